use crate::knn_match::ColumnDict;
use crate::utils::generate_minibatch_intervals;

use dashmap::DashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;

const DEFAULT_BLOCK_SIZE: usize = 1000;

/// Symmetric k-nearest neighbour graph over the rows of a matrix
pub struct KnnGraph {
    /// Symmetric CSC adjacency matrix (n_nodes x n_nodes) of distances
    pub adjacency: CscMatrix<f32>,
    /// Sorted edge list (i < j), deduplicated
    pub edges: Vec<(usize, usize)>,
    /// Edge distances, parallel to `edges`
    pub distances: Vec<f32>,
    /// Directed neighbour lists `(j, d_ij)`, closest first
    pub neighbour_lists: Vec<Vec<(usize, f32)>>,
    /// Number of nodes
    pub n_nodes: usize,
}

pub struct KnnGraphArgs {
    /// number of neighbours per node, excluding the node itself
    pub knn: usize,
    pub block_size: usize,
    /// seed of the approximate index (large inputs only)
    pub seed: u64,
}

impl Default for KnnGraphArgs {
    fn default() -> Self {
        Self {
            knn: 15,
            block_size: DEFAULT_BLOCK_SIZE,
            seed: 0,
        }
    }
}

impl KnnGraph {
    /// Build a KNN graph from row vectors (cells × features).
    ///
    /// * `data` - matrix (n x d), where each row is a point
    /// * `args` - KNN graph construction parameters
    pub fn from_rows(data: &DMatrix<f32>, args: &KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = data.nrows();
        if nn < 2 {
            anyhow::bail!("need at least two points for a kNN graph, got {}", nn);
        }
        let dict = ColumnDict::from_matrix_rows(data, args.seed)?;
        Self::build_from_dict(dict, nn, args)
    }

    fn build_from_dict(
        dict: ColumnDict<usize>,
        nn: usize,
        args: &KnnGraphArgs,
    ) -> anyhow::Result<KnnGraph> {
        let nquery = args.knn.clamp(1, nn - 1);

        let block_size = if args.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            args.block_size
        };
        let jobs = generate_minibatch_intervals(nn, block_size);
        let njobs = jobs.len() as u64;

        // 1. directed neighbour search
        let lists: Vec<Vec<Vec<(usize, f32)>>> = jobs
            .into_par_iter()
            .progress_count(njobs)
            .map(|(lb, ub)| -> anyhow::Result<Vec<Vec<(usize, f32)>>> {
                (lb..ub)
                    .map(|i| {
                        let (indices, distances) = dict.search_others(&i, nquery)?;
                        Ok(indices.into_iter().zip(distances).collect())
                    })
                    .collect()
            })
            .collect::<anyhow::Result<_>>()?;

        let neighbour_lists: Vec<Vec<(usize, f32)>> = lists.into_iter().flatten().collect();

        let triplets: DashMap<(usize, usize), f32> = DashMap::new();
        neighbour_lists
            .par_iter()
            .enumerate()
            .for_each(|(i, nbrs)| {
                for &(j, d_ij) in nbrs {
                    triplets.insert((i, j), d_ij);
                }
            });

        info!("{} directed pairs by kNN matching", triplets.len());

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("empty triplets"));
        }

        // 2. symmetrize: i→j or j→i, at the smaller distance
        let mut edges: Vec<((usize, usize), f32)> = triplets
            .par_iter()
            .filter_map(|entry| {
                let &(i, j) = entry.key();
                let d_ij = *entry.value();
                match triplets.get(&(j, i)).map(|e| *e) {
                    Some(d_ji) if i < j => Some(((i, j), d_ij.min(d_ji))),
                    Some(_) => None,
                    None => Some(((i.min(j), i.max(j)), d_ij)),
                }
            })
            .collect();

        edges.par_sort_by_key(|&(ij, _)| ij);
        edges.dedup_by_key(|&mut (ij, _)| ij);

        info!("{} undirected edges", edges.len());

        // 3. sparse backbone
        let mut coo = CooMatrix::new(nn, nn);
        for &((i, j), v) in edges.iter() {
            coo.push(i, j, v);
            coo.push(j, i, v);
        }

        let adjacency = CscMatrix::from(&coo);

        let (edge_pairs, distances): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        Ok(KnnGraph {
            adjacency,
            edges: edge_pairs,
            distances,
            neighbour_lists,
            n_nodes: nn,
        })
    }

    /// Neighbours of a node in the symmetric adjacency
    pub fn neighbors(&self, node: usize) -> &[usize] {
        let offsets = self.adjacency.col_offsets();
        &self.adjacency.row_indices()[offsets[node]..offsets[node + 1]]
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Fuzzy simplicial set weights of the symmetric edges.
    ///
    /// 1. rho_i = distance to the nearest neighbour
    /// 2. sigma_i such that sum_j exp(-(d_ij - rho_i)/sigma_i) = log2(k)
    /// 3. w(i→j) = exp(-(d_ij - rho_i) / sigma_i) over the directed lists
    /// 4. w = w(i→j) + w(j→i) - w(i→j) w(j→i)
    ///
    /// Returns weights parallel to `self.edges`, all in (0, 1].
    pub fn fuzzy_kernel_weights(&self) -> Vec<f32> {
        if self.edges.is_empty() {
            return Vec::new();
        }

        let (rho, sigma): (Vec<f32>, Vec<f32>) = self
            .neighbour_lists
            .par_iter()
            .map(|nbrs| {
                if nbrs.is_empty() {
                    return (0., 1.);
                }
                let dists: Vec<f32> = nbrs.iter().map(|&(_, d)| d).collect();
                let rho = dists.iter().cloned().fold(f32::INFINITY, f32::min);
                let target = (dists.len() as f32).log2();
                (rho, smooth_knn_sigma(&dists, rho, target))
            })
            .unzip();

        let directed = |from: usize, to: usize| -> f32 {
            self.neighbour_lists[from]
                .iter()
                .find(|&&(j, _)| j == to)
                .map(|&(_, d)| directed_umap_weight(d, rho[from], sigma[from]))
                .unwrap_or(0.)
        };

        self.edges
            .par_iter()
            .map(|&(i, j)| {
                let w_ij = directed(i, j);
                let w_ji = directed(j, i);
                w_ij + w_ji - w_ij * w_ji
            })
            .collect()
    }
}

/// Binary search for per-point sigma
///
/// Finds sigma such that: sum_j exp(-max(0, d_j - rho) / sigma) = target
fn smooth_knn_sigma(dists: &[f32], rho: f32, target: f32) -> f32 {
    const TOLERANCE: f32 = 1e-5;
    const MAX_ITER: usize = 64;

    let mean_dist: f32 = dists.iter().sum::<f32>() / dists.len().max(1) as f32;
    let min_sigma = 1e-3 * mean_dist;

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;

    for _ in 0..MAX_ITER {
        let psum: f32 = dists
            .iter()
            .map(|&d| {
                let gap = d - rho;
                if gap > 0.0 {
                    (-gap / mid).exp()
                } else {
                    1.0
                }
            })
            .sum();

        if (psum - target).abs() < TOLERANCE {
            break;
        }

        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }

    mid.max(min_sigma)
}

fn directed_umap_weight(d: f32, rho: f32, sigma: f32) -> f32 {
    if d.is_infinite() || sigma <= 0.0 {
        return 0.0;
    }
    let gap = d - rho;
    if gap <= 0.0 {
        1.0
    } else {
        (-gap / sigma).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight clusters of 5 points each in 2D, well separated
    fn two_cluster_matrix() -> DMatrix<f32> {
        DMatrix::from_row_slice(
            10,
            2,
            &[
                0.0, 0.0, //
                0.1, 0.0, //
                0.0, 0.1, //
                0.1, 0.1, //
                0.05, 0.05, //
                10.0, 10.0, //
                10.1, 10.0, //
                10.0, 10.1, //
                10.1, 10.1, //
                10.05, 10.05, //
            ],
        )
    }

    fn args(knn: usize) -> KnnGraphArgs {
        KnnGraphArgs {
            knn,
            block_size: 3,
            seed: 0,
        }
    }

    #[test]
    fn directed_lists_and_canonical_edges() {
        let graph = KnnGraph::from_rows(&two_cluster_matrix(), &args(4)).unwrap();

        assert_eq!(graph.num_nodes(), 10);
        assert!(graph.num_edges() > 0);
        assert_eq!(graph.edges.len(), graph.distances.len());
        assert_eq!(graph.neighbour_lists.len(), 10);
        assert!(graph.neighbour_lists.iter().all(|x| x.len() == 4));

        for &(i, j) in &graph.edges {
            assert!(i < j, "edge ({}, {}) not canonical", i, j);
        }
        assert!(graph.distances.iter().all(|&d| d >= 0.));
    }

    #[test]
    fn separated_groups_share_no_edge() {
        let graph = KnnGraph::from_rows(&two_cluster_matrix(), &args(4)).unwrap();

        for &(i, j) in &graph.edges {
            let same_cluster = (i < 5 && j < 5) || (i >= 5 && j >= 5);
            assert!(same_cluster, "cross-group edge ({}, {})", i, j);
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let graph = KnnGraph::from_rows(&two_cluster_matrix(), &args(3)).unwrap();

        for node in 0..graph.num_nodes() {
            for &neighbor in graph.neighbors(node) {
                assert!(graph.neighbors(neighbor).contains(&node));
            }
        }
    }

    #[test]
    fn fuzzy_weights_stay_in_unit_interval() {
        let graph = KnnGraph::from_rows(&two_cluster_matrix(), &args(4)).unwrap();

        let weights = graph.fuzzy_kernel_weights();
        assert_eq!(weights.len(), graph.num_edges());

        for &w in &weights {
            assert!(w > 0.0 && w <= 1.0, "weight {} out of range", w);
        }

        let min_w = weights.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!(min_w > 0.01, "min fuzzy weight {} too small", min_w);
    }

    #[test]
    fn sigma_matches_log2_k() {
        let dists = [0.1, 0.2, 0.3, 0.5, 1.0];
        let rho = 0.1;
        let target = (5.0f32).log2();

        let sigma = smooth_knn_sigma(&dists, rho, target);
        assert!(sigma > 0.0);

        let psum: f32 = dists
            .iter()
            .map(|&d| {
                let gap = d - rho;
                if gap > 0.0 {
                    (-gap / sigma).exp()
                } else {
                    1.0
                }
            })
            .sum();

        assert!((psum - target).abs() < 0.1);
    }

    #[test]
    fn single_point_is_an_error() {
        let data = DMatrix::<f32>::zeros(1, 3);
        assert!(KnnGraph::from_rows(&data, &args(3)).is_err());
    }
}
