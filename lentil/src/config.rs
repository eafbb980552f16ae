//! Tunable parameters of the pipeline
//!
//! Every field has a default, so a partial JSON document (or none)
//! is a valid configuration.

use crate::common::*;
use serde::{Deserialize, Serialize};
use std::io::Write;

/// The 32 GPCR genes scored for drug response
pub const DEFAULT_GPCR_PANEL: [&str; 32] = [
    "HTR1A", "HTR1B", "HTR1D", "HTR1E", "HTR2A", "HTR2B", "HTR2C", "HTR3A", "HTR4", "HTR5A",
    "HTR6", "HTR7", "DRD1", "DRD2", "DRD3", "DRD4", "DRD5", "HRH1", "HRH2", "HRH3", "CHRM1",
    "CHRM2", "CHRM3", "CHRM4", "CHRM5", "ADRA1A", "ADRA1B", "ADRA2A", "ADRA2B", "ADRA2C",
    "ADRB1", "ADRB2",
];

/// Cell type markers kept as raw values next to the GPCR panel
pub const DEFAULT_CELL_TYPE_MARKERS: [&str; 13] = [
    "CX3CR1", "CLDN5", "GLUL", "NDRG2", "PCDH15", "PLP1", "MBP", "SATB2", "SLC17A7", "SLC17A6",
    "GAD2", "GAD1", "SNAP25",
];

fn upper_boxed(names: &[&str]) -> Vec<Box<str>> {
    names.iter().map(|x| x.to_uppercase().into_boxed_str()).collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    pub min_genes_per_cell: usize,
    pub max_genes_per_cell: usize,
    pub min_cells_per_gene: usize,
}

impl Default for QcParams {
    fn default() -> Self {
        Self {
            min_genes_per_cell: 200,
            max_genes_per_cell: 6000,
            min_cells_per_gene: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleParams {
    /// genes starting with this prefix (any case) are mitochondrial
    pub mito_prefix: String,
    /// scaled values above this are set to it
    pub clip_max: f32,
}

impl Default for ScaleParams {
    fn default() -> Self {
        Self {
            mito_prefix: "mt-".to_string(),
            clip_max: 10.,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaParams {
    pub n_components: usize,
    pub train_ratio: f32,
    pub n_batches: usize,
    /// above this many genes the basis is fit by randomized SVD
    pub max_dense_features: usize,
    pub seed: u64,
}

impl Default for PcaParams {
    fn default() -> Self {
        Self {
            n_components: 50,
            train_ratio: 0.35,
            n_batches: 10,
            max_dense_features: 4000,
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingParams {
    pub tsne_n_pcs: usize,
    pub tsne_perplexity: f32,
    pub tsne_iter: usize,
    pub kmeans_k: usize,
    pub kmeans_max_iter: usize,
    pub kmeans_n_init: usize,
    /// neighbours per cell, the cell itself included
    pub n_neighbors: usize,
    pub knn_n_pcs: usize,
    pub umap_min_dist: f32,
    pub umap_spread: f32,
    /// `None`: 500 epochs up to 10,000 cells, 200 beyond
    pub umap_epochs: Option<usize>,
    pub resolution: f64,
    pub seed: u64,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            tsne_n_pcs: 20,
            tsne_perplexity: 30.,
            tsne_iter: 1000,
            kmeans_k: 35,
            kmeans_max_iter: 300,
            kmeans_n_init: 10,
            n_neighbors: 15,
            knn_n_pcs: 50,
            umap_min_dist: 0.3,
            umap_spread: 1.0,
            umap_epochs: None,
            resolution: 1.0,
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PharmacologyParams {
    pub gpcr_panel: Vec<Box<str>>,
    pub target_sum: f32,
    pub ca_offset: f32,
}

impl Default for PharmacologyParams {
    fn default() -> Self {
        Self {
            gpcr_panel: upper_boxed(&DEFAULT_GPCR_PANEL),
            target_sum: 1e4,
            ca_offset: 1e-4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectivityParams {
    pub reference_compound: Box<str>,
    /// |cAMP| beyond this flags activation or inhibition
    pub activation_threshold: f32,
    pub selectivity_threshold: f32,
}

impl Default for SelectivityParams {
    fn default() -> Self {
        Self {
            reference_compound: "CLOZAPINE".into(),
            activation_threshold: 10.,
            selectivity_threshold: 1.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    pub qc: QcParams,
    pub scale: ScaleParams,
    pub pca: PcaParams,
    pub embedding: EmbeddingParams,
    pub pharmacology: PharmacologyParams,
    pub selectivity: SelectivityParams,
    pub cell_type_markers: Vec<Box<str>>,
    pub extra_markers: Vec<Box<str>>,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            qc: QcParams::default(),
            scale: ScaleParams::default(),
            pca: PcaParams::default(),
            embedding: EmbeddingParams::default(),
            pharmacology: PharmacologyParams::default(),
            selectivity: SelectivityParams::default(),
            cell_type_markers: upper_boxed(&DEFAULT_CELL_TYPE_MARKERS),
            extra_markers: vec![],
        }
    }
}

impl PipelineParams {
    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let reader = matrix_util::common_io::open_buf_reader(file)?;
        serde_json::from_reader(reader)
            .map_err(|e| LentilError::configuration(format!("{}: {}", file, e)))
    }

    pub fn to_json_file(&self, file: &str) -> anyhow::Result<()> {
        let mut writer = matrix_util::common_io::open_buf_writer(file)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Upper-case every gene and compound name
    pub fn normalize_names(&mut self) {
        let upper = |xx: &mut Vec<Box<str>>| {
            for x in xx.iter_mut() {
                *x = x.to_uppercase().into_boxed_str();
            }
        };
        upper(&mut self.cell_type_markers);
        upper(&mut self.extra_markers);
        upper(&mut self.pharmacology.gpcr_panel);
        self.selectivity.reference_compound =
            self.selectivity.reference_compound.to_uppercase().into_boxed_str();
    }

    /// Cell type markers, then the GPCR panel, then extra markers,
    /// without duplicates
    pub fn markers(&self) -> Vec<Box<str>> {
        let mut seen = std::collections::HashSet::new();
        self.cell_type_markers
            .iter()
            .chain(self.pharmacology.gpcr_panel.iter())
            .chain(self.extra_markers.iter())
            .map(|x| x.to_uppercase().into_boxed_str())
            .filter(|x| seen.insert(x.clone()))
            .collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let bad = |msg: String| Err(LentilError::configuration(msg));

        let qc = &self.qc;
        if qc.min_genes_per_cell > qc.max_genes_per_cell {
            return bad(format!(
                "min_genes_per_cell {} exceeds max_genes_per_cell {}",
                qc.min_genes_per_cell, qc.max_genes_per_cell
            ));
        }
        if !(self.scale.clip_max > 0.) {
            return bad(format!("clip bound must be positive: {}", self.scale.clip_max));
        }
        if self.scale.mito_prefix.is_empty() {
            return bad("empty mitochondrial gene prefix".into());
        }

        let pca = &self.pca;
        if pca.n_components == 0 {
            return bad("n_components must be positive".into());
        }
        if !(pca.train_ratio > 0. && pca.train_ratio <= 1.) {
            return bad(format!("train_ratio must be in (0, 1]: {}", pca.train_ratio));
        }
        if pca.n_batches == 0 {
            return bad("n_batches must be positive".into());
        }

        let emb = &self.embedding;
        if emb.tsne_n_pcs == 0 || emb.knn_n_pcs == 0 {
            return bad("leading component counts must be positive".into());
        }
        if emb.n_neighbors < 2 {
            return bad(format!("n_neighbors must be at least 2: {}", emb.n_neighbors));
        }
        if emb.kmeans_k == 0 {
            return bad("k-means needs at least one cluster".into());
        }
        if !(emb.tsne_perplexity > 0.) {
            return bad(format!("perplexity must be positive: {}", emb.tsne_perplexity));
        }
        if !(emb.umap_spread > 0. && emb.umap_min_dist >= 0. && emb.umap_min_dist <= emb.umap_spread)
        {
            return bad(format!(
                "need 0 <= min_dist <= spread, spread > 0: min_dist {}, spread {}",
                emb.umap_min_dist, emb.umap_spread
            ));
        }
        if !(emb.resolution > 0.) {
            return bad(format!("resolution must be positive: {}", emb.resolution));
        }

        let pharm = &self.pharmacology;
        if pharm.gpcr_panel.is_empty() {
            return bad("empty GPCR panel".into());
        }
        if !(pharm.target_sum > 0.) {
            return bad(format!("target_sum must be positive: {}", pharm.target_sum));
        }

        let sel = &self.selectivity;
        if sel.reference_compound.is_empty() {
            return bad("no reference compound".into());
        }
        if !(sel.activation_threshold >= 0.) || !(sel.selectivity_threshold >= 0.) {
            return bad("selectivity thresholds must be non-negative".into());
        }
        Ok(())
    }
}
