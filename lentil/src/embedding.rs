//! Two-dimensional embeddings and cell partitions of the PCA embedding

use crate::annotation::{AnnotationColumn, AnnotationKey, ClusterAlgorithm};
use crate::cluster::*;
use crate::common::*;
use crate::config::EmbeddingParams;
use crate::expression::ExpressionContainer;
use crate::tsne::TSne;
use crate::umap_layout::UmapLayout;
use matrix_util::knn_graph::{KnnGraph, KnnGraphArgs};
use std::time::Instant;

const SMALL_DATA_CELLS: usize = 10_000;

#[derive(Debug)]
pub struct EmbeddingResult {
    /// n × 2 t-SNE coordinates
    pub tsne: Mat,
    /// n × 2 graph layout coordinates
    pub umap: Mat,
    pub kmeans: ClusterResult,
    pub louvain: ClusterResult,
    pub leiden: ClusterResult,
}

/// Leading `ncomp` columns (all when fewer are available)
fn leading_components(pcs: &Mat, ncomp: usize) -> Mat {
    let ncomp = ncomp.clamp(1, pcs.ncols().max(1));
    pcs.columns(0, ncomp.min(pcs.ncols())).into_owned()
}

/// Layout starting point: the first two principal components
fn pca_initial_layout(pcs: &Mat) -> Mat {
    let mut init = Mat::zeros(pcs.nrows(), 2);
    for d in 0..pcs.ncols().min(2) {
        init.column_mut(d).copy_from(&pcs.column(d));
    }
    init
}

pub fn umap_epochs(params: &EmbeddingParams, n_cells: usize) -> usize {
    params.umap_epochs.unwrap_or(if n_cells <= SMALL_DATA_CELLS {
        500
    } else {
        200
    })
}

/// t-SNE, k-means, kNN graph, graph layout and both community
/// partitions, all on the PCA embedding which is left untouched
pub fn run_embedding_clustering(
    pcs: &Mat,
    params: &EmbeddingParams,
) -> anyhow::Result<EmbeddingResult> {
    let n_cells = pcs.nrows();
    if n_cells < 3 {
        return Err(LentilError::insufficient(Stage::Embedding, 3, n_cells));
    }
    if params.n_neighbors < 2 {
        return Err(LentilError::configuration(format!(
            "n_neighbors {} must count the cell itself and at least one neighbour",
            params.n_neighbors
        )));
    }

    let tic = Instant::now();
    let tsne_input = leading_components(pcs, params.tsne_n_pcs);
    info!(
        "t-SNE on {} cells x {} PCs, perplexity {}",
        n_cells,
        tsne_input.ncols(),
        params.tsne_perplexity
    );
    let tsne = TSne::default()
        .perplexity(params.tsne_perplexity)
        .n_iter(params.tsne_iter)
        .seed(params.seed)
        .fit(&tsne_input)?;
    info!("t-SNE done in {:.1}s", tic.elapsed().as_secs_f32());

    let kmeans = kmeans_clustering(
        pcs,
        params.kmeans_k,
        params.kmeans_max_iter,
        params.kmeans_n_init,
        params.seed,
    )?;

    let tic = Instant::now();
    let knn_input = leading_components(pcs, params.knn_n_pcs);
    info!(
        "kNN graph on {} cells x {} PCs with {} neighbours",
        n_cells,
        knn_input.ncols(),
        params.n_neighbors
    );
    let graph = KnnGraph::from_rows(
        &knn_input,
        &KnnGraphArgs {
            // neighbour count includes the cell itself
            knn: params.n_neighbors - 1,
            seed: params.seed,
            ..Default::default()
        },
    )?;
    let weights = graph.fuzzy_kernel_weights();
    info!(
        "kNN graph: {} edges in {:.1}s",
        graph.num_edges(),
        tic.elapsed().as_secs_f32()
    );

    let layout = UmapLayout {
        min_dist: params.umap_min_dist,
        spread: params.umap_spread,
        n_epochs: umap_epochs(params, n_cells),
        seed: params.seed,
        ..Default::default()
    };
    let umap = layout.optimize(&graph.edges, &weights, &pca_initial_layout(&knn_input))?;

    let louvain = community_clustering(
        &graph,
        &weights,
        CommunityMethod::Louvain,
        params.resolution,
        params.seed,
    )?;
    let leiden = community_clustering(
        &graph,
        &weights,
        CommunityMethod::Leiden,
        params.resolution,
        params.seed,
    )?;

    let result = EmbeddingResult {
        tsne,
        umap,
        kmeans,
        louvain,
        leiden,
    };
    for (key, partition) in result.partitions() {
        info!("{}", partition.histogram_ascii(&key.to_string(), 40, 10));
    }
    Ok(result)
}

impl EmbeddingResult {
    /// Each partition with the annotation column it is stored under
    pub fn partitions(&self) -> [(AnnotationKey, &ClusterResult); 3] {
        [
            (AnnotationKey::Cluster(ClusterAlgorithm::KMeans), &self.kmeans),
            (AnnotationKey::Cluster(ClusterAlgorithm::Louvain), &self.louvain),
            (AnnotationKey::Cluster(ClusterAlgorithm::Leiden), &self.leiden),
        ]
    }

    /// Cluster labels as categorical annotation columns
    pub fn record_annotations(&self, data: &mut ExpressionContainer) -> anyhow::Result<()> {
        for (key, result) in self.partitions() {
            data.annotations.insert(
                Stage::Embedding,
                key,
                AnnotationColumn::Categorical(result.label_names()),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn two_blob_pcs() -> Mat {
        let mut rng = StdRng::seed_from_u64(1);
        let noise = Normal::new(0f32, 0.3).unwrap();
        Mat::from_fn(60, 5, |i, d| {
            let centre = if i < 30 { 0. } else { 8. };
            let shift = if d == 0 { centre } else { 0. };
            shift + noise.sample(&mut rng)
        })
    }

    fn small_params() -> EmbeddingParams {
        EmbeddingParams {
            tsne_n_pcs: 3,
            tsne_perplexity: 5.,
            tsne_iter: 300,
            kmeans_k: 2,
            kmeans_n_init: 2,
            n_neighbors: 8,
            knn_n_pcs: 4,
            umap_epochs: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn embeddings_and_partitions_have_one_row_per_cell() {
        let pcs = two_blob_pcs();
        let before = pcs.clone();
        let result = run_embedding_clustering(&pcs, &small_params()).unwrap();

        assert_eq!(pcs, before);
        assert_eq!(result.tsne.shape(), (60, 2));
        assert_eq!(result.umap.shape(), (60, 2));
        assert!(result.tsne.iter().all(|x| x.is_finite()));
        assert!(result.umap.iter().all(|x| x.is_finite()));

        assert_eq!(result.kmeans.n_clusters, 2);
        assert!(result.kmeans.labels[..30].iter().all(|&l| l == result.kmeans.labels[0]));
        assert!(result.kmeans.labels[30..].iter().all(|&l| l == result.kmeans.labels[30]));

        for partition in [&result.louvain, &result.leiden] {
            assert_eq!(partition.labels.len(), 60);
            let left: std::collections::HashSet<_> = partition.labels[..30].iter().collect();
            assert!(partition.labels[30..].iter().all(|l| !left.contains(l)));
        }
    }

    #[test]
    fn histograms_are_titled_by_column() {
        let result = run_embedding_clustering(&two_blob_pcs(), &small_params()).unwrap();
        let titles: Vec<String> = result
            .partitions()
            .iter()
            .map(|(key, partition)| {
                let text = partition.histogram_ascii(&key.to_string(), 20, 5);
                text.lines().next().unwrap_or_default().to_string()
            })
            .collect();
        assert!(titles[0].starts_with("kmeans cluster assignments (60 cells, 2 clusters)"));
        assert!(titles[1].starts_with("louvain cluster assignments (60 cells"));
        assert!(titles[2].starts_with("leiden cluster assignments (60 cells"));
    }

    #[test]
    fn epoch_default_depends_on_size() {
        let params = EmbeddingParams::default();
        assert_eq!(umap_epochs(&params, 5_000), 500);
        assert_eq!(umap_epochs(&params, 20_000), 200);
    }

    #[test]
    fn too_few_cells() {
        let pcs = Mat::zeros(2, 3);
        assert!(run_embedding_clustering(&pcs, &small_params()).is_err());
    }
}
