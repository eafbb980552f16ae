//! Command-line entry points

use crate::common::*;
use crate::config::{PipelineParams, DEFAULT_GPCR_PANEL};
use crate::input::{derive_output_header, load_expression, LoadOptions};
use crate::output::write_outputs;
use crate::patterns::generate_patterns;
use crate::pipeline::run_pipeline;
use crate::reference::ReferenceTables;
use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        required = true,
        help = "Count matrix in Matrix Market format (`.mtx` or `.mtx.gz`)",
        long_help = "Count matrix in Matrix Market format (`.mtx` or `.mtx.gz`).\n\
		     By default rows are genes and columns are cells, as written by 10x;\n\
		     use `--cells-by-genes` for the transposed layout."
    )]
    mtx_file: Box<str>,

    #[arg(
        short = 'g',
        long,
        required = true,
        help = "Gene names, one per line (first column)"
    )]
    genes: Box<str>,

    #[arg(
        short = 'c',
        long,
        required = true,
        help = "Cell barcodes, one per line (first column)"
    )]
    cells: Box<str>,

    #[arg(
        short = 'a',
        long,
        required = true,
        help = "Drug x receptor affinity table",
        long_help = "Drug x receptor affinity table.\n\
		     Header: a corner cell then receptor names; each row: a drug then affinities.\n\
		     `.csv` files are comma-separated, anything else tab-separated.\n\
		     Empty, `NA` and `NaN` entries mean no affinity."
    )]
    affinity: Box<str>,

    #[arg(
        short = 'r',
        long,
        required = true,
        help = "Receptor G-protein type table",
        long_help = "Receptor G-protein type table with `receptor_name` and `type` columns.\n\
		     Types are `Gs`, `Gi` or `Gq`."
    )]
    receptor_types: Box<str>,

    #[arg(long, default_value_t = false, help = "Rows of the matrix are cells")]
    cells_by_genes: bool,

    #[arg(long, help = "Cell label file (`cell<TAB>label` per line)")]
    label_file: Option<Box<str>>,

    #[arg(long, help = "Only analyse cells of this label")]
    label: Option<Box<str>>,

    #[arg(long, help = "Only use the first N cells")]
    max_cells: Option<usize>,

    #[arg(
        long,
        help = "Parameters in JSON",
        long_help = "Pipeline parameters in JSON. Missing fields take their defaults;\n\
		     options given on the command line override the file."
    )]
    params: Option<Box<str>>,

    #[arg(long, value_delimiter = ',', help = "Additional marker genes (comma-separated)")]
    add_markers: Option<Vec<Box<str>>>,

    #[arg(long, help = "Minimum number of genes detected per cell")]
    min_genes: Option<usize>,

    #[arg(long, help = "Maximum number of genes detected per cell")]
    max_genes: Option<usize>,

    #[arg(long, help = "Minimum number of cells expressing a gene")]
    min_cells: Option<usize>,

    #[arg(long, help = "Mitochondrial gene prefix")]
    mito_prefix: Option<String>,

    #[arg(short = 'p', long, help = "Number of principal components")]
    n_components: Option<usize>,

    #[arg(long, help = "Fraction of cells used to fit the principal components")]
    train_ratio: Option<f32>,

    #[arg(long, help = "Number of batches in PCA fitting and projection")]
    n_batches: Option<usize>,

    #[arg(short = 'k', long, help = "Number of k-means clusters")]
    kmeans_k: Option<usize>,

    #[arg(long, help = "Number of neighbours (including the cell itself)")]
    n_neighbors: Option<usize>,

    #[arg(long, help = "Leading PCs for the neighbour graph")]
    knn_n_pcs: Option<usize>,

    #[arg(long, help = "Leading PCs for t-SNE")]
    tsne_n_pcs: Option<usize>,

    #[arg(long, help = "UMAP minimum distance")]
    umap_min_dist: Option<f32>,

    #[arg(long, help = "UMAP spread")]
    umap_spread: Option<f32>,

    #[arg(long, help = "Reference compound of the selectivity test")]
    reference: Option<Box<str>>,

    #[arg(long, help = "Selectivity ratio threshold")]
    selectivity_threshold: Option<f32>,

    #[arg(long, help = "Random seed")]
    seed: Option<u64>,

    #[arg(
        short,
        long,
        help = "Output header",
        long_help = "Output header. Defaults to the input path with `_processed`\n\
		     in place of the `.mtx[.gz]` extension."
    )]
    out: Option<Box<str>>,

    #[arg(long, default_value_t = false, help = "Also write the scaled matrix")]
    save_scaled: bool,
}

impl RunArgs {
    /// Parameters from the JSON file (or defaults) with command-line
    /// overrides applied
    pub fn pipeline_params(&self) -> anyhow::Result<PipelineParams> {
        let mut params = match self.params.as_deref() {
            Some(file) => PipelineParams::from_json_file(file)?,
            None => PipelineParams::default(),
        };

        macro_rules! set {
            ($field:expr, $value:expr) => {
                if let Some(v) = $value.clone() {
                    $field = v;
                }
            };
        }

        set!(params.qc.min_genes_per_cell, self.min_genes);
        set!(params.qc.max_genes_per_cell, self.max_genes);
        set!(params.qc.min_cells_per_gene, self.min_cells);
        set!(params.scale.mito_prefix, self.mito_prefix);
        set!(params.pca.n_components, self.n_components);
        set!(params.pca.train_ratio, self.train_ratio);
        set!(params.pca.n_batches, self.n_batches);
        set!(params.embedding.kmeans_k, self.kmeans_k);
        set!(params.embedding.n_neighbors, self.n_neighbors);
        set!(params.embedding.knn_n_pcs, self.knn_n_pcs);
        set!(params.embedding.tsne_n_pcs, self.tsne_n_pcs);
        set!(params.embedding.umap_min_dist, self.umap_min_dist);
        set!(params.embedding.umap_spread, self.umap_spread);
        set!(params.selectivity.reference_compound, self.reference);
        set!(params.selectivity.selectivity_threshold, self.selectivity_threshold);

        if let Some(seed) = self.seed {
            params.pca.seed = seed;
            params.embedding.seed = seed;
        }
        if let Some(markers) = self.add_markers.as_ref() {
            params.extra_markers.extend(markers.iter().cloned());
        }

        params.normalize_names();
        params.validate()?;
        Ok(params)
    }
}

pub fn run_analysis(args: &RunArgs) -> anyhow::Result<()> {
    let params = args.pipeline_params()?;
    let tables = ReferenceTables::from_files(&args.affinity, &args.receptor_types)?;

    let options = LoadOptions {
        cells_by_genes: args.cells_by_genes,
        label_file: args.label_file.clone(),
        select_label: args.label.clone(),
        max_cells: args.max_cells,
    };
    let data = load_expression(&args.mtx_file, &args.genes, &args.cells, &options)?;

    let header = match args.out.as_ref() {
        Some(out) => out.clone(),
        None => derive_output_header(&args.mtx_file),
    };

    let output = run_pipeline(data, &tables, &params)?;
    write_outputs(&header, &output, &params, args.save_scaled)?;

    info!(
        "done: {} cells x {} genes, {} selective cells, {} diagnostic(s)",
        output.data.num_cells(),
        output.data.num_genes(),
        output.selectivity.num_selective(),
        output.diagnostics.len()
    );
    Ok(())
}

#[derive(Args, Debug, Clone)]
pub struct PatternArgs {
    #[arg(short = 'n', long, default_value_t = 10_000, help = "Number of patterns")]
    n_patterns: usize,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Receptors (comma-separated); defaults to the GPCR panel"
    )]
    receptors: Option<Vec<Box<str>>>,

    #[arg(long, default_value_t = 0, help = "Random seed")]
    seed: u64,

    #[arg(short, long, required = true, help = "Output file (`.tsv` or `.tsv.gz`)")]
    out: Box<str>,
}

pub fn run_patterns(args: &PatternArgs) -> anyhow::Result<()> {
    let receptors: Vec<Box<str>> = match args.receptors.as_ref() {
        Some(r) => r.iter().map(|x| x.to_uppercase().into_boxed_str()).collect(),
        None => DEFAULT_GPCR_PANEL
            .iter()
            .map(|&x| x.to_uppercase().into_boxed_str())
            .collect(),
    };
    let patterns = generate_patterns(&receptors, args.n_patterns, args.seed)?;
    matrix_util::common_io::mkdir(&args.out)?;
    patterns.to_tsv(&args.out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn command_line_overrides_defaults() {
        let cli = TestCli::parse_from([
            "lentil",
            "x.mtx",
            "-g",
            "genes.tsv",
            "-c",
            "cells.tsv",
            "-a",
            "aff.csv",
            "-r",
            "types.tsv",
            "--min-genes",
            "50",
            "-k",
            "7",
            "--reference",
            "haloperidol",
            "--add-markers",
            "Aqp4,Olig2",
            "--seed",
            "3",
        ]);
        let params = cli.run.pipeline_params().unwrap();
        assert_eq!(params.qc.min_genes_per_cell, 50);
        assert_eq!(params.qc.max_genes_per_cell, 6000);
        assert_eq!(params.embedding.kmeans_k, 7);
        assert_eq!(params.pca.seed, 3);
        assert_eq!(params.selectivity.reference_compound.as_ref(), "HALOPERIDOL");
        assert!(params.markers().iter().any(|m| m.as_ref() == "OLIG2"));
    }
}
