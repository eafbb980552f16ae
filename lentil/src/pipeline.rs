//! The analysis as one sequential run: QC, raw marker capture,
//! regression and scaling, PCA, embeddings and clusters, drug scores,
//! selectivity and its marker genes

use crate::batched_pca::{run_batched_pca, PcaResult};
use crate::common::*;
use crate::config::PipelineParams;
use crate::embedding::{run_embedding_clustering, EmbeddingResult};
use crate::expression::ExpressionContainer;
use crate::marker::RawMarkerSnapshot;
use crate::pharmacology::{score_drug_responses, DrugResponseScores};
use crate::qc::{filter_cells_and_genes, lookup_markers, QcReport};
use crate::rank_test::RankTestRow;
use crate::reference::ReferenceTables;
use crate::regress::regress_and_scale;
use crate::selectivity::{classify_selectivity, selective_markers, SelectivityFlags};
use std::time::Instant;

#[derive(Debug)]
pub struct PipelineOutput {
    /// narrowed, scaled and annotated container
    pub data: ExpressionContainer,
    pub qc: QcReport,
    pub snapshot: RawMarkerSnapshot,
    pub pca: PcaResult,
    pub embedding: EmbeddingResult,
    pub scores: DrugResponseScores,
    pub selectivity: SelectivityFlags,
    /// rank test of the selective cells, by decreasing z-score
    pub selective_markers: Vec<RankTestRow>,
    /// recoverable conditions met along the way
    pub diagnostics: Vec<Diagnostic>,
}

/// Run every stage in order. Any error aborts the run and names the
/// stage it came from.
pub fn run_pipeline(
    data: ExpressionContainer,
    tables: &ReferenceTables,
    params: &PipelineParams,
) -> anyhow::Result<PipelineOutput> {
    params.validate()?;

    let reference = params.selectivity.reference_compound.to_uppercase();
    if !tables.affinity.has_drug(&reference) {
        return Err(LentilError::configuration(format!(
            "reference compound {} is not in the affinity table",
            reference
        )));
    }

    let mut diagnostics = vec![];
    data.check_integrity(Stage::Load)?;

    let tic = Instant::now();
    let (data, qc) = filter_cells_and_genes(data, &params.qc)?;
    data.check_integrity(Stage::Qc)?;
    info!(
        "QC: {} x {} -> {} x {} in {} round(s), {:.1}s",
        qc.cells_before,
        qc.genes_before,
        qc.cells_after,
        qc.genes_after,
        qc.rounds,
        tic.elapsed().as_secs_f32()
    );

    let lookups = lookup_markers(&data, &params.markers(), &mut diagnostics);
    let snapshot = RawMarkerSnapshot::capture(&data, &lookups)?;
    let mut data = data;
    snapshot.record_annotations(&mut data)?;

    let tic = Instant::now();
    let data = regress_and_scale(data, &params.scale)?;
    data.check_integrity(Stage::Regression)?;
    info!("regression and scaling: {:.1}s", tic.elapsed().as_secs_f32());

    let tic = Instant::now();
    let pca = run_batched_pca(&data, &params.pca)?;
    data.check_integrity(Stage::Pca)?;
    info!("PCA: {:.1}s", tic.elapsed().as_secs_f32());

    let tic = Instant::now();
    let embedding = run_embedding_clustering(&pca.embedding, &params.embedding)?;
    let mut data = data;
    embedding.record_annotations(&mut data)?;
    data.check_integrity(Stage::Embedding)?;
    info!("embedding and clustering: {:.1}s", tic.elapsed().as_secs_f32());

    let scores = score_drug_responses(&snapshot, tables, &params.pharmacology, &mut diagnostics)?;
    scores.record_annotations(&mut data)?;
    data.check_integrity(Stage::Pharmacology)?;

    let selectivity = classify_selectivity(&scores, &params.selectivity)?;
    selectivity.record_annotations(&mut data)?;
    let selective_markers = selective_markers(&data, &selectivity, &mut diagnostics)?;
    data.check_integrity(Stage::Selectivity)?;

    if !diagnostics.is_empty() {
        warn!("{} diagnostic(s) recorded", diagnostics.len());
    }

    Ok(PipelineOutput {
        data,
        qc,
        snapshot,
        pca,
        embedding,
        scores,
        selectivity,
        selective_markers,
        diagnostics,
    })
}
