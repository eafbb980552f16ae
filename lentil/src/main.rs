use clap::{Parser, Subcommand};
use lentil::run::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Ligand Effect iNference on Transcriptomes In Large single-cell data\n\
		  QC, confounder regression, batched PCA, embeddings and clusters,\n\
		  then per-cell GPCR drug responses and reference-compound selectivity."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,

    /// number of threads (defaults to all logical CPUs)
    #[arg(long, global = true)]
    threads: Option<usize>,

    /// verbosity
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run the full analysis on a count matrix",
        long_about = "Run the analysis in order:\n\
		      (1) QC filtering of cells and genes, raw marker capture\n\
		      (2) Regress out total counts and mitochondrial fraction, scale\n\
		      (3) Batched PCA, t-SNE, UMAP, k-means, Louvain and Leiden\n\
		      (4) Drug responses (cAMP, Ca) and selectivity of a reference compound.\n"
    )]
    Run(RunArgs),

    #[command(about = "Generate random GPCR activation patterns")]
    Patterns(PatternArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let threads = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    match &cli.commands {
        Commands::Run(args) => {
            run_analysis(args)?;
        }
        Commands::Patterns(args) => {
            run_patterns(args)?;
        }
    }

    Ok(())
}
