//! Cell partitions on a latent representation
//!
//! k-means on the PCA embedding and modularity communities (Louvain,
//! Leiden) on the fuzzy-weighted kNN graph.

use crate::common::*;
use crate::community::{leiden, louvain, WeightedGraph};
use matrix_util::clustering::{fit_kmeans_rows, KmeansArgs};
use matrix_util::knn_graph::KnnGraph;

/// Community detection method over a neighbour graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommunityMethod {
    Louvain,
    Leiden,
}

/// Clustering result
#[derive(Debug, Clone)]
pub struct ClusterResult {
    /// Cluster assignment for each cell (cell index -> cluster id)
    pub labels: Vec<usize>,
    /// Number of clusters
    pub n_clusters: usize,
}

impl ClusterResult {
    /// Get cluster size distribution
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_clusters];
        for &label in &self.labels {
            if label < self.n_clusters {
                counts[label] += 1;
            }
        }
        counts
    }

    /// Labels as strings, for categorical annotation columns
    pub fn label_names(&self) -> Vec<Box<str>> {
        self.labels
            .iter()
            .map(|l| l.to_string().into_boxed_str())
            .collect()
    }

    /// Get cluster assignment histogram as ASCII, titled by the
    /// annotation column `name`, showing up to `max_show` largest
    /// clusters sorted by size (descending).
    pub fn histogram_ascii(&self, name: &str, max_width: usize, max_show: usize) -> String {
        let sizes = self.cluster_sizes();

        let mut ranked: Vec<(usize, usize)> = sizes
            .iter()
            .enumerate()
            .filter(|(_, &s)| s > 0)
            .map(|(id, &s)| (id, s))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let n_total = ranked.len();
        let n_show = max_show.min(n_total);
        let max_size = ranked.first().map(|&(_, s)| s).unwrap_or(1);
        let n_cells = self.labels.len().max(1) as f64;

        let mut lines = Vec::new();
        lines.push(format!(
            "{} cluster assignments ({} cells, {} clusters):",
            name,
            self.labels.len(),
            n_total
        ));

        for &(cluster_id, size) in ranked.iter().take(n_show) {
            let pct = 100.0 * size as f64 / n_cells;
            let bar_len = ((size as f64 / max_size as f64) * max_width as f64) as usize;
            let bar = "█".repeat(bar_len.max(1));

            lines.push(format!(
                "  Cluster {:3}  {:>6} cells ({:>5.1}%)  {}",
                cluster_id, size, pct, bar
            ));
        }

        if n_total > n_show {
            let hidden_cells: usize = ranked[n_show..].iter().map(|&(_, s)| s).sum();
            lines.push(format!(
                "  ... and {} more clusters ({} cells, {:.1}%)",
                n_total - n_show,
                hidden_cells,
                100.0 * hidden_cells as f64 / n_cells
            ));
        }

        lines.join("\n")
    }
}

/// Run k-means clustering on latent representation (cells × features)
pub fn kmeans_clustering(
    latent: &Mat,
    k: usize,
    max_iter: usize,
    num_init: usize,
    seed: u64,
) -> anyhow::Result<ClusterResult> {
    if k == 0 {
        return Err(LentilError::configuration("number of k-means clusters must be > 0"));
    }

    let n = latent.nrows();
    if k > n {
        return Err(LentilError::insufficient(Stage::Embedding, k, n));
    }

    info!(
        "K-means: {} cells x {} features, k={}, max_iter={}, n_init={}",
        n,
        latent.ncols(),
        k,
        max_iter,
        num_init
    );

    let args = KmeansArgs {
        num_clusters: k,
        max_iter,
        num_init: num_init.max(1),
        seed,
    };

    let fit = fit_kmeans_rows(latent, &args);
    let mut labels = fit.membership;
    let n_clusters = crate::community::renumber_by_size(&mut labels);

    let result = ClusterResult { labels, n_clusters };

    let sizes = result.cluster_sizes();
    info!(
        "K-means done: {} clusters in {} iterations, inertia {:.3}, sizes min={} max={}",
        n_clusters,
        fit.iterations,
        fit.inertia,
        sizes.iter().copied().min().unwrap_or(0),
        sizes.iter().copied().max().unwrap_or(0)
    );

    Ok(result)
}

/// Modularity communities on a kNN graph with the given edge weights
/// (parallel to `graph.edges`)
pub fn community_clustering(
    graph: &KnnGraph,
    weights: &[f32],
    method: CommunityMethod,
    resolution: f64,
    seed: u64,
) -> anyhow::Result<ClusterResult> {
    if weights.len() != graph.num_edges() {
        return Err(LentilError::integrity(
            Stage::Embedding,
            format!(
                "{} edge weights for {} edges",
                weights.len(),
                graph.num_edges()
            ),
        ));
    }

    let n_components = count_components(graph);
    info!(
        "{:?}: {} nodes, {} edges, {} connected component(s), resolution={}",
        method,
        graph.num_nodes(),
        graph.num_edges(),
        n_components,
        resolution
    );

    let network = WeightedGraph::from_edges(graph.num_nodes(), &graph.edges, weights);
    let labels = match method {
        CommunityMethod::Louvain => louvain(&network, resolution, seed),
        CommunityMethod::Leiden => leiden(&network, resolution, seed),
    };
    let n_clusters = labels.iter().max().map(|&c| c + 1).unwrap_or(0);

    info!(
        "{:?} done: {} clusters, modularity {:.4}",
        method,
        n_clusters,
        crate::community::modularity(&network, &labels, resolution)
    );

    Ok(ClusterResult { labels, n_clusters })
}

/// Count connected components in the KNN graph using DFS.
fn count_components(graph: &KnnGraph) -> usize {
    let n = graph.num_nodes();
    let mut visited = vec![false; n];
    let mut n_components = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        n_components += 1;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            for &neighbor in graph.neighbors(node) {
                if !visited[neighbor] {
                    stack.push(neighbor);
                }
            }
        }
    }

    n_components
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrix_util::knn_graph::KnnGraphArgs;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::collections::HashSet;

    const N_PER_CLUSTER: usize = 40;
    const N_GROUPS: usize = 3;
    const N: usize = N_GROUPS * N_PER_CLUSTER;

    /// 3 well-separated clusters in 3D
    fn three_cluster_latent() -> Mat {
        let mut rng = StdRng::seed_from_u64(42);
        let noise = Normal::new(0.0f32, 0.05).unwrap();
        let centers: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]];

        let mut data = Mat::zeros(N, 3);
        for (c, center) in centers.iter().enumerate() {
            for i in 0..N_PER_CLUSTER {
                let row = c * N_PER_CLUSTER + i;
                for (d, &val) in center.iter().enumerate() {
                    data[(row, d)] = val + noise.sample(&mut rng);
                }
            }
        }
        data
    }

    fn assert_no_shared_labels(labels: &[usize]) {
        let groups: Vec<HashSet<usize>> = (0..N_GROUPS)
            .map(|c| {
                labels[c * N_PER_CLUSTER..(c + 1) * N_PER_CLUSTER]
                    .iter()
                    .copied()
                    .collect()
            })
            .collect();
        for i in 0..N_GROUPS {
            for j in (i + 1)..N_GROUPS {
                assert!(groups[i].is_disjoint(&groups[j]));
            }
        }
    }

    #[test]
    fn kmeans_recovers_groups() {
        let latent = three_cluster_latent();
        let result = kmeans_clustering(&latent, 3, 100, 4, 0).unwrap();
        assert_eq!(result.n_clusters, 3);
        assert_no_shared_labels(&result.labels);
        assert_eq!(result.cluster_sizes(), vec![N_PER_CLUSTER; 3]);
    }

    #[test]
    fn kmeans_is_seeded() {
        let latent = three_cluster_latent();
        let a = kmeans_clustering(&latent, 5, 100, 2, 7).unwrap();
        let b = kmeans_clustering(&latent, 5, 100, 2, 7).unwrap();
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn kmeans_more_clusters_than_cells() {
        let latent = Mat::zeros(4, 2);
        let err = kmeans_clustering(&latent, 5, 10, 1, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LentilError>(),
            Some(LentilError::InsufficientSamples { requested: 5, available: 4, .. })
        ));
    }

    #[test]
    fn communities_respect_groups() {
        let latent = three_cluster_latent();
        let graph = KnnGraph::from_rows(
            &latent,
            &KnnGraphArgs {
                knn: 10,
                ..Default::default()
            },
        )
        .unwrap();
        let weights = graph.fuzzy_kernel_weights();

        for method in [CommunityMethod::Louvain, CommunityMethod::Leiden] {
            let result = community_clustering(&graph, &weights, method, 1.0, 0).unwrap();
            assert_eq!(result.labels.len(), N);
            assert!(result.n_clusters >= N_GROUPS);
            assert!(result.labels.iter().all(|&l| l < result.n_clusters));
            assert_no_shared_labels(&result.labels);
            let total: usize = result.cluster_sizes().iter().sum();
            assert_eq!(total, N);
        }
    }

    #[test]
    fn histogram_lists_largest_first() {
        let result = ClusterResult {
            labels: vec![1, 1, 1, 0, 2, 2],
            n_clusters: 3,
        };
        let text = result.histogram_ascii("louvain", 10, 2);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("louvain cluster assignments (6 cells, 3 clusters)"));
        assert!(lines[1].contains("Cluster   1"));
        assert!(lines[2].contains("Cluster   2"));
        assert!(lines[3].contains("1 more clusters"));
    }
}
