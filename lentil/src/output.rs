//! Persisting a finished run next to its input

use crate::annotation::AnnotationColumn;
use crate::common::*;
use crate::config::PipelineParams;
use crate::pipeline::PipelineOutput;
use crate::rank_test::RankTestRow;
use matrix_util::common_io::{mkdir, write_lines};
use matrix_util::mtx_io::write_mtx_triplets;
use matrix_util::parquet::{write_matrix_parquet, write_parquet_frame, ParquetColumn};

/// Paths of a run's output files, all sharing one header
pub struct OutputFiles {
    pub obs: Box<str>,
    pub pca: Box<str>,
    pub pca_loadings: Box<str>,
    pub pca_variance: Box<str>,
    pub pca_train_cells: Box<str>,
    pub tsne: Box<str>,
    pub umap: Box<str>,
    pub selective_markers: Box<str>,
    pub diagnostics: Box<str>,
    pub params: Box<str>,
    pub scaled_mtx: Box<str>,
    pub scaled_genes: Box<str>,
    pub scaled_cells: Box<str>,
}

impl OutputFiles {
    pub fn new(header: &str) -> Self {
        let file = |suffix: &str| format!("{}.{}", header, suffix).into_boxed_str();
        Self {
            obs: file("obs.parquet"),
            pca: file("pca.parquet"),
            pca_loadings: file("pca_loadings.parquet"),
            pca_variance: file("pca_variance.tsv"),
            pca_train_cells: file("pca_train_cells.tsv.gz"),
            tsne: file("tsne.parquet"),
            umap: file("umap.parquet"),
            selective_markers: file("selective_markers.tsv.gz"),
            diagnostics: file("diagnostics.tsv"),
            params: file("params.json"),
            scaled_mtx: file("scaled.mtx.gz"),
            scaled_genes: file("genes.tsv.gz"),
            scaled_cells: file("cells.tsv.gz"),
        }
    }
}

fn axis_names(prefix: &str, n: usize) -> Vec<Box<str>> {
    (1..=n)
        .map(|k| format!("{}{}", prefix, k).into_boxed_str())
        .collect()
}

/// Per-cell annotations as a data frame; numbers as DOUBLE, labels
/// and flags as UTF8
fn annotation_frame(output: &PipelineOutput) -> Vec<ParquetColumn> {
    output
        .data
        .annotations
        .iter()
        .map(|(key, column)| {
            let name = key.to_string().into_boxed_str();
            match column {
                AnnotationColumn::Numeric(x) => {
                    ParquetColumn::Double(name, x.iter().map(|&v| v as f64).collect())
                }
                AnnotationColumn::Categorical(x) => ParquetColumn::Utf8(name, x.clone()),
                AnnotationColumn::Flag(x) => ParquetColumn::Utf8(
                    name,
                    x.iter()
                        .map(|&b| if b { "true" } else { "false" }.into())
                        .collect(),
                ),
            }
        })
        .collect()
}

fn write_rank_table(rows: &[RankTestRow], file: &str) -> anyhow::Result<()> {
    let mut lines: Vec<Box<str>> = Vec::with_capacity(rows.len() + 1);
    lines.push(RankTestRow::HEADER.into());
    lines.extend(rows.iter().map(|r| r.to_tsv_line()));
    write_lines(&lines, file)
}

fn write_diagnostics(diagnostics: &[Diagnostic], file: &str) -> anyhow::Result<()> {
    let mut lines: Vec<Box<str>> = vec!["stage\tkind\tsubject\tmessage".into()];
    lines.extend(diagnostics.iter().map(|d| d.to_tsv_line()));
    write_lines(&lines, file)
}

/// Non-zero scaled values in the genes × cells orientation the loader
/// reads by default
fn write_scaled_matrix(output: &PipelineOutput, files: &OutputFiles) -> anyhow::Result<()> {
    let data = &output.data;
    let Some(xx) = data.scaled() else {
        return Err(LentilError::integrity(
            Stage::Output,
            "no scaled matrix to write",
        ));
    };
    let mut triplets = vec![];
    for (j, column) in xx.column_iter().enumerate() {
        for (i, &x) in column.iter().enumerate() {
            if x != 0. {
                triplets.push((j, i, x));
            }
        }
    }
    write_mtx_triplets(&triplets, data.num_genes(), data.num_cells(), &files.scaled_mtx)?;
    write_lines(data.genes(), &files.scaled_genes)?;
    write_lines(data.cells(), &files.scaled_cells)?;
    Ok(())
}

/// Write every output of a run under `header`
pub fn write_outputs(
    header: &str,
    output: &PipelineOutput,
    params: &PipelineParams,
    write_scaled: bool,
) -> anyhow::Result<OutputFiles> {
    let files = OutputFiles::new(header);
    mkdir(&files.obs)?;

    let data = &output.data;
    data.check_integrity(Stage::Output)?;
    let cells = data.cells();

    write_parquet_frame(&files.obs, cells, &annotation_frame(output))?;

    let pca = &output.pca;
    let k = pca.basis.num_components();
    write_matrix_parquet(&files.pca, &pca.embedding, cells, &axis_names("PC", k))?;
    write_matrix_parquet(
        &files.pca_loadings,
        &pca.basis.components,
        data.genes(),
        &axis_names("PC", k),
    )?;

    let mut variance: Vec<Box<str>> = vec!["component\texplained_variance\texplained_variance_ratio".into()];
    variance.extend(
        pca.basis
            .explained_variance
            .iter()
            .zip(pca.basis.explained_variance_ratio.iter())
            .enumerate()
            .map(|(c, (v, r))| format!("PC{}\t{}\t{}", c + 1, v, r).into_boxed_str()),
    );
    write_lines(&variance, &files.pca_variance)?;

    let train: Vec<Box<str>> = pca.basis.train_cells.iter().map(|&i| cells[i].clone()).collect();
    write_lines(&train, &files.pca_train_cells)?;

    let emb = &output.embedding;
    write_matrix_parquet(&files.tsne, &emb.tsne, cells, &axis_names("tSNE", 2))?;
    write_matrix_parquet(&files.umap, &emb.umap, cells, &axis_names("UMAP", 2))?;

    write_rank_table(&output.selective_markers, &files.selective_markers)?;
    write_diagnostics(&output.diagnostics, &files.diagnostics)?;
    params.to_json_file(&files.params)?;

    if write_scaled {
        write_scaled_matrix(output, &files)?;
    }

    info!("wrote outputs under {}", header);
    Ok(files)
}
