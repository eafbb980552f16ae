//! Modularity-based community detection: Louvain and Leiden
//!
//! Both work on an undirected weighted graph and optimize
//!
//! Q = 1/2m Σ_ij [A_ij - γ k_i k_j / 2m] δ(c_i, c_j)
//!
//! Louvain alternates greedy local moving with aggregation of the
//! communities. Leiden additionally refines each community into
//! well-connected sub-communities and aggregates on the refinement,
//! so no community ends up internally disconnected.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const MAX_LEVELS: usize = 50;
const MAX_PASSES: usize = 100;
const MIN_GAIN: f64 = 1e-12;

/// Undirected weighted graph with self loops, as produced by
/// aggregation
#[derive(Clone, Debug)]
pub struct WeightedGraph {
    /// neighbours `(j, w_ij)` without self loops; each edge is listed
    /// from both ends
    adjacency: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    /// weighted degree, self loops counted twice
    degree: Vec<f64>,
    /// 2m, the sum of all degrees
    total_degree: f64,
}

impl WeightedGraph {
    /// Build from undirected edges `(i, j)` with weights; repeated
    /// edges add up and `i == j` adds a self loop
    pub fn from_edges(n_nodes: usize, edges: &[(usize, usize)], weights: &[f32]) -> Self {
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![vec![]; n_nodes];
        let mut self_loops = vec![0f64; n_nodes];
        for (&(i, j), &w) in edges.iter().zip(weights.iter()) {
            let w = w as f64;
            if i == j {
                self_loops[i] += w;
            } else {
                adjacency[i].push((j, w));
                adjacency[j].push((i, w));
            }
        }
        for nbrs in adjacency.iter_mut() {
            merge_duplicates(nbrs);
        }
        Self::with_degrees(adjacency, self_loops)
    }

    fn with_degrees(adjacency: Vec<Vec<(usize, f64)>>, self_loops: Vec<f64>) -> Self {
        let degree: Vec<f64> = adjacency
            .iter()
            .zip(self_loops.iter())
            .map(|(nbrs, &s)| nbrs.iter().map(|&(_, w)| w).sum::<f64>() + 2. * s)
            .collect();
        let total_degree = degree.iter().sum();
        Self {
            adjacency,
            self_loops,
            degree,
            total_degree,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.adjacency.len()
    }

    /// Collapse each community into a node; internal edges become
    /// self loops and degrees are preserved
    fn aggregate(&self, membership: &[usize], n_comm: usize) -> Self {
        let mut adjacency: Vec<Vec<(usize, f64)>> = vec![vec![]; n_comm];
        let mut self_loops = vec![0f64; n_comm];
        for (i, nbrs) in self.adjacency.iter().enumerate() {
            let ci = membership[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in nbrs {
                let cj = membership[j];
                if ci == cj {
                    // seen from both ends
                    self_loops[ci] += w / 2.;
                } else {
                    adjacency[ci].push((cj, w));
                }
            }
        }
        for nbrs in adjacency.iter_mut() {
            merge_duplicates(nbrs);
        }
        Self::with_degrees(adjacency, self_loops)
    }
}

fn merge_duplicates(nbrs: &mut Vec<(usize, f64)>) {
    nbrs.sort_by_key(|&(j, _)| j);
    let mut merged: Vec<(usize, f64)> = Vec::with_capacity(nbrs.len());
    for &(j, w) in nbrs.iter() {
        match merged.last_mut() {
            Some(last) if last.0 == j => last.1 += w,
            _ => merged.push((j, w)),
        }
    }
    *nbrs = merged;
}

/// Modularity of a partition at resolution `gamma`
pub fn modularity(graph: &WeightedGraph, membership: &[usize], gamma: f64) -> f64 {
    let m2 = graph.total_degree;
    if m2 <= 0. {
        return 0.;
    }
    let n_comm = membership.iter().max().map(|&c| c + 1).unwrap_or(0);
    let mut internal = vec![0f64; n_comm];
    let mut tot = vec![0f64; n_comm];
    for i in 0..graph.num_nodes() {
        let c = membership[i];
        tot[c] += graph.degree[i];
        internal[c] += 2. * graph.self_loops[i];
        for &(j, w) in graph.adjacency[i].iter() {
            if membership[j] == c {
                internal[c] += w;
            }
        }
    }
    internal
        .iter()
        .zip(tot.iter())
        .map(|(&int, &t)| int / m2 - gamma * (t / m2) * (t / m2))
        .sum()
}

/// Relabel communities `0..k` by decreasing size, ties by first
/// appearance; returns the number of communities
pub fn renumber_by_size(membership: &mut [usize]) -> usize {
    let n_max = membership.iter().max().map(|&c| c + 1).unwrap_or(0);
    let mut size = vec![0usize; n_max];
    let mut first = vec![usize::MAX; n_max];
    for (i, &c) in membership.iter().enumerate() {
        size[c] += 1;
        first[c] = first[c].min(i);
    }
    let mut order: Vec<usize> = (0..n_max).filter(|&c| size[c] > 0).collect();
    order.sort_by(|&a, &b| size[b].cmp(&size[a]).then(first[a].cmp(&first[b])));
    let mut new_label = vec![0; n_max];
    for (k, &c) in order.iter().enumerate() {
        new_label[c] = k;
    }
    for c in membership.iter_mut() {
        *c = new_label[*c];
    }
    order.len()
}

/// Scratch space to accumulate edge weights to neighbouring
/// communities
struct NeighbourWeights {
    weight: Vec<f64>,
    touched: Vec<usize>,
}

impl NeighbourWeights {
    fn new(n: usize) -> Self {
        Self {
            weight: vec![0.; n],
            touched: vec![],
        }
    }

    fn add(&mut self, c: usize, w: f64) {
        if self.weight[c] == 0. && !self.touched.contains(&c) {
            self.touched.push(c);
        }
        self.weight[c] += w;
    }

    fn clear(&mut self) {
        for &c in self.touched.iter() {
            self.weight[c] = 0.;
        }
        self.touched.clear();
    }
}

/// Greedy moves of single nodes to the neighbouring community of
/// largest modularity gain until a pass moves nothing. Returns
/// whether any node moved.
fn local_moving(
    graph: &WeightedGraph,
    membership: &mut [usize],
    gamma: f64,
    rng: &mut StdRng,
) -> bool {
    let nn = graph.num_nodes();
    let m2 = graph.total_degree;
    let mut comm_tot = vec![0f64; nn];
    for i in 0..nn {
        comm_tot[membership[i]] += graph.degree[i];
    }

    let mut order: Vec<usize> = (0..nn).collect();
    order.shuffle(rng);

    let mut scratch = NeighbourWeights::new(nn);
    let mut any_moved = false;

    for _ in 0..MAX_PASSES {
        let mut moved = 0;
        for &i in order.iter() {
            let ci = membership[i];
            let ki = graph.degree[i];

            for &(j, w) in graph.adjacency[i].iter() {
                scratch.add(membership[j], w);
            }

            comm_tot[ci] -= ki;
            let gain = |c: usize, w_to: f64| w_to - gamma * ki * comm_tot[c] / m2;

            let mut best = ci;
            let mut best_gain = gain(ci, scratch.weight[ci]);
            for &c in scratch.touched.iter() {
                let g = gain(c, scratch.weight[c]);
                if g > best_gain + MIN_GAIN {
                    best = c;
                    best_gain = g;
                }
            }
            comm_tot[best] += ki;
            scratch.clear();

            if best != ci {
                membership[i] = best;
                moved += 1;
            }
        }
        if moved == 0 {
            break;
        }
        any_moved = true;
    }
    any_moved
}

/// Louvain community detection; labels are renumbered by size
pub fn louvain(graph: &WeightedGraph, gamma: f64, seed: u64) -> Vec<usize> {
    let nn = graph.num_nodes();
    if graph.total_degree <= 0. {
        return (0..nn).collect();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut labels: Vec<usize> = (0..nn).collect();
    let mut current = graph.clone();

    for level in 0..MAX_LEVELS {
        let mut membership: Vec<usize> = (0..current.num_nodes()).collect();
        let moved = local_moving(&current, &mut membership, gamma, &mut rng);
        let n_comm = renumber_by_size(&mut membership);

        for c in labels.iter_mut() {
            *c = membership[*c];
        }
        log::debug!("louvain level {}: {} communities", level, n_comm);

        if !moved || n_comm == current.num_nodes() {
            break;
        }
        current = current.aggregate(&membership, n_comm);
    }

    renumber_by_size(&mut labels);
    labels
}

/// Split each community into sub-communities by merging singletons
/// into well-connected sub-communities of the same community
fn refine(
    graph: &WeightedGraph,
    partition: &[usize],
    gamma: f64,
    rng: &mut StdRng,
) -> Vec<usize> {
    let nn = graph.num_nodes();
    let m2 = graph.total_degree;

    let mut comm_tot = vec![0f64; nn];
    for i in 0..nn {
        comm_tot[partition[i]] += graph.degree[i];
    }

    // weight from a node to the rest of its community
    let w_in_comm: Vec<f64> = (0..nn)
        .map(|i| {
            graph.adjacency[i]
                .iter()
                .filter(|&&(j, _)| partition[j] == partition[i])
                .map(|&(_, w)| w)
                .sum()
        })
        .collect();

    let mut refined: Vec<usize> = (0..nn).collect();
    let mut sub_tot = graph.degree.clone();
    let mut sub_size = vec![1usize; nn];
    // weight from a sub-community S to C \ S
    let mut sub_ext = w_in_comm.clone();

    let mut order: Vec<usize> = (0..nn).collect();
    order.shuffle(rng);

    let mut scratch = NeighbourWeights::new(nn);

    for &v in order.iter() {
        let rv = refined[v];
        if sub_size[rv] != 1 {
            continue;
        }
        let c = partition[v];
        let kv = graph.degree[v];
        if w_in_comm[v] < gamma * kv * (comm_tot[c] - kv) / m2 {
            continue;
        }

        for &(u, w) in graph.adjacency[v].iter() {
            if partition[u] == c && refined[u] != rv {
                scratch.add(refined[u], w);
            }
        }

        let mut best = rv;
        let mut best_gain = 0.;
        for &r in scratch.touched.iter() {
            let well_connected =
                sub_ext[r] >= gamma * sub_tot[r] * (comm_tot[c] - sub_tot[r]) / m2;
            if !well_connected {
                continue;
            }
            let g = scratch.weight[r] - gamma * kv * sub_tot[r] / m2;
            if g > best_gain + MIN_GAIN {
                best = r;
                best_gain = g;
            }
        }

        if best != rv {
            sub_ext[best] += w_in_comm[v] - 2. * scratch.weight[best];
            sub_tot[best] += kv;
            sub_size[best] += 1;
            sub_tot[rv] = 0.;
            sub_size[rv] = 0;
            sub_ext[rv] = 0.;
            refined[v] = best;
        }
        scratch.clear();
    }
    refined
}

/// Leiden community detection; labels are renumbered by size
pub fn leiden(graph: &WeightedGraph, gamma: f64, seed: u64) -> Vec<usize> {
    let nn = graph.num_nodes();
    if graph.total_degree <= 0. {
        return (0..nn).collect();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut current = graph.clone();
    // node of the current graph holding each original node
    let mut node_of: Vec<usize> = (0..nn).collect();
    let mut partition: Vec<usize> = (0..nn).collect();

    for level in 0..MAX_LEVELS {
        local_moving(&current, &mut partition, gamma, &mut rng);
        let n_comm = renumber_by_size(&mut partition);
        log::debug!("leiden level {}: {} communities", level, n_comm);

        if n_comm == current.num_nodes() {
            break;
        }

        let mut refined = refine(&current, &partition, gamma, &mut rng);
        let n_refined = renumber_by_size(&mut refined);
        if n_refined == current.num_nodes() {
            break;
        }

        // aggregate nodes start in the community of their members
        let mut next_partition = vec![0; n_refined];
        for (v, &r) in refined.iter().enumerate() {
            next_partition[r] = partition[v];
        }

        for x in node_of.iter_mut() {
            *x = refined[*x];
        }
        current = current.aggregate(&refined, n_refined);
        partition = next_partition;
    }

    let mut labels: Vec<usize> = node_of.iter().map(|&x| partition[x]).collect();
    renumber_by_size(&mut labels);
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    /// three 6-cliques joined in a ring by single weak edges
    fn ring_of_cliques() -> WeightedGraph {
        let mut edges = vec![];
        let mut weights = vec![];
        for block in 0..3 {
            let lb = block * 6;
            for i in 0..6 {
                for j in (i + 1)..6 {
                    edges.push((lb + i, lb + j));
                    weights.push(1.);
                }
            }
            edges.push((lb, (lb + 6) % 18));
            weights.push(0.1);
        }
        WeightedGraph::from_edges(18, &edges, &weights)
    }

    fn assert_blocks(labels: &[usize]) {
        for block in 0..3 {
            let first = labels[block * 6];
            assert!(labels[block * 6..(block + 1) * 6].iter().all(|&l| l == first));
        }
        let mut distinct: Vec<usize> = vec![labels[0], labels[6], labels[12]];
        distinct.sort();
        assert_eq!(distinct, vec![0, 1, 2]);
    }

    #[test]
    fn louvain_finds_cliques() {
        let g = ring_of_cliques();
        let labels = louvain(&g, 1.0, 0);
        assert_blocks(&labels);
        assert!(modularity(&g, &labels, 1.0) > 0.5);
    }

    #[test]
    fn leiden_finds_cliques() {
        let g = ring_of_cliques();
        let labels = leiden(&g, 1.0, 0);
        assert_blocks(&labels);
    }

    #[test]
    fn aggregation_preserves_degree_and_modularity() {
        let g = ring_of_cliques();
        let membership: Vec<usize> = (0..18).map(|i| i / 6).collect();
        let agg = g.aggregate(&membership, 3);
        assert!((agg.total_degree - g.total_degree).abs() < 1e-9);
        let q_fine = modularity(&g, &membership, 1.0);
        let q_coarse = modularity(&agg, &[0, 1, 2], 1.0);
        assert!((q_fine - q_coarse).abs() < 1e-9);
    }

    #[test]
    fn renumbering_orders_by_size() {
        let mut labels = vec![5, 2, 2, 9, 2, 5];
        let k = renumber_by_size(&mut labels);
        assert_eq!(k, 3);
        assert_eq!(labels, vec![1, 0, 0, 2, 0, 1]);
    }

    #[test]
    fn edgeless_graph_keeps_singletons() {
        let g = WeightedGraph::from_edges(3, &[], &[]);
        assert_eq!(louvain(&g, 1.0, 0), vec![0, 1, 2]);
        assert_eq!(leiden(&g, 1.0, 0), vec![0, 1, 2]);
    }
}
