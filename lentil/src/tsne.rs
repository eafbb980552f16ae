//! Two-dimensional t-SNE over a few leading principal components

use crate::common::*;
use matrix_util::knn_match::ColumnDict;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// t-SNE with sparse input affinities over `3 * perplexity` nearest
/// neighbours and Barnes-Hut repulsion
pub struct TSne {
    perplexity: f32,
    theta: f32,
    learning_rate: f32,
    n_iter: usize,
    early_exaggeration: f32,
    early_exaggeration_iter: usize,
    seed: u64,
}

impl Default for TSne {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            theta: 0.5,
            learning_rate: 200.0,
            n_iter: 1000,
            early_exaggeration: 12.0,
            early_exaggeration_iter: 250,
            seed: 0,
        }
    }
}

impl TSne {
    pub fn perplexity(mut self, p: f32) -> Self {
        self.perplexity = p;
        self
    }

    /// Barnes-Hut opening angle; 0 sums every pair exactly
    pub fn theta(mut self, theta: f32) -> Self {
        self.theta = theta.max(0.);
        self
    }

    pub fn n_iter(mut self, n: usize) -> Self {
        self.n_iter = n;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Embed the rows of `data` in two dimensions
    pub fn fit(&self, data: &Mat) -> anyhow::Result<Mat> {
        let nn = data.nrows();
        if nn < 3 {
            return Err(LentilError::insufficient(Stage::Embedding, 3, nn));
        }

        let knn = ((3. * self.perplexity).floor() as usize).clamp(1, nn - 1);
        let perplexity = self.perplexity.min(knn as f32 / 3.).max(1.);
        info!(
            "t-SNE on {} x {}: {} neighbours, perplexity {:.1}",
            nn,
            data.ncols(),
            knn,
            perplexity
        );

        let pp = self.joint_probabilities(data, knn, perplexity)?;
        self.optimize(&pp, nn)
    }

    /// Symmetrized `P_ij = (p_j|i + p_i|j) / 2n` over kNN lists
    fn joint_probabilities(
        &self,
        data: &Mat,
        knn: usize,
        perplexity: f32,
    ) -> anyhow::Result<CsrMatrix<f32>> {
        let nn = data.nrows();
        let dict = ColumnDict::from_matrix_rows(data, self.seed)?;
        let target = perplexity.ln();

        let rows = (0..nn)
            .into_par_iter()
            .map(|i| {
                let (nbrs, dist) = dict.search_others(&i, knn)?;
                let d2: Vec<f32> = dist.iter().map(|d| d * d).collect();
                Ok((nbrs, conditional_probabilities(&d2, target)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let denom = 2. * nn as f32;
        let mut coo = CooMatrix::new(nn, nn);
        for (i, (nbrs, probs)) in rows.into_iter().enumerate() {
            for (j, p) in nbrs.into_iter().zip(probs) {
                coo.push(i, j, p / denom);
                coo.push(j, i, p / denom);
            }
        }
        Ok(CsrMatrix::from(&coo))
    }

    fn optimize(&self, pp: &CsrMatrix<f32>, nn: usize) -> anyhow::Result<Mat> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let init = Normal::new(0f32, 1e-2)?;
        let mut yy: Vec<[f32; 2]> = (0..nn)
            .map(|_| [init.sample(&mut rng), init.sample(&mut rng)])
            .collect();

        let mut update = vec![[0f32; 2]; nn];
        let mut gains = vec![[1f32; 2]; nn];

        for iter in 0..self.n_iter {
            let (exaggeration, momentum) = if iter < self.early_exaggeration_iter {
                (self.early_exaggeration, 0.5)
            } else {
                (1.0, 0.8)
            };

            let tree = QuadTree::new(&yy);
            let repulsion: Vec<Repulsion> = (0..nn)
                .into_par_iter()
                .map(|i| tree.repulsion(&yy, i, self.theta))
                .collect();

            let z_total: f32 = repulsion.iter().map(|r| r.z).sum::<f32>().max(f32::MIN_POSITIVE);

            let grads: Vec<[f32; 2]> = (0..nn)
                .into_par_iter()
                .map(|i| {
                    let row = pp.row(i);
                    let mut attr = [0f32; 2];
                    for (&j, &p) in row.col_indices().iter().zip(row.values()) {
                        let dx = yy[i][0] - yy[j][0];
                        let dy = yy[i][1] - yy[j][1];
                        let q = 1. / (1. + dx * dx + dy * dy);
                        attr[0] += p * q * dx;
                        attr[1] += p * q * dy;
                    }
                    let rep = repulsion[i].force;
                    [
                        4. * (exaggeration * attr[0] - rep[0] / z_total),
                        4. * (exaggeration * attr[1] - rep[1] / z_total),
                    ]
                })
                .collect();

            for i in 0..nn {
                for d in 0..2 {
                    let g = grads[i][d];
                    gains[i][d] = if (g > 0.) != (update[i][d] > 0.) {
                        gains[i][d] + 0.2
                    } else {
                        (gains[i][d] * 0.8).max(0.01)
                    };
                    update[i][d] = momentum * update[i][d] - self.learning_rate * gains[i][d] * g;
                    yy[i][d] += update[i][d];
                }
            }

            let (mx, my) = yy
                .iter()
                .fold((0f32, 0f32), |(a, b), y| (a + y[0], b + y[1]));
            for y in yy.iter_mut() {
                y[0] -= mx / nn as f32;
                y[1] -= my / nn as f32;
            }

            if (iter + 1) % 250 == 0 {
                let visits: usize = repulsion.iter().map(|r| r.visits).sum();
                log::debug!(
                    "t-SNE iteration {}: {:.1} repulsion terms per cell",
                    iter + 1,
                    visits as f32 / nn as f32
                );
            }
        }

        Ok(Mat::from_fn(nn, 2, |i, d| yy[i][d]))
    }
}

const MAX_TREE_DEPTH: usize = 32;

/// Repulsive part of the gradient at one point
#[derive(Clone, Copy, Debug, Default)]
struct Repulsion {
    /// sum of unnormalized q_ij over j != i
    z: f32,
    /// sum of q_ij² (y_i - y_j)
    force: [f32; 2],
    /// points and cells summed
    visits: usize,
}

struct QuadNode {
    centre_of_mass: [f32; 2],
    mass: f32,
    /// side length of the cell
    width: f32,
    children: Vec<usize>,
    /// points of this cell are `order[lb..ub]`
    lb: usize,
    ub: usize,
}

/// Quadtree over a 2D layout; cells far enough from a point act as
/// one mass at their centre of mass
struct QuadTree {
    nodes: Vec<QuadNode>,
    order: Vec<usize>,
}

impl QuadTree {
    fn new(yy: &[[f32; 2]]) -> Self {
        let mut tree = QuadTree {
            nodes: Vec::with_capacity(2 * yy.len()),
            order: (0..yy.len()).collect(),
        };
        if yy.is_empty() {
            return tree;
        }
        let (mut lo, mut hi) = ([f32::INFINITY; 2], [f32::NEG_INFINITY; 2]);
        for y in yy {
            for d in 0..2 {
                lo[d] = lo[d].min(y[d]);
                hi[d] = hi[d].max(y[d]);
            }
        }
        let centre = [(lo[0] + hi[0]) / 2., (lo[1] + hi[1]) / 2.];
        let half = (hi[0] - lo[0]).max(hi[1] - lo[1]) / 2. * (1. + 1e-4) + 1e-6;
        tree.build(yy, 0, yy.len(), centre, half, 0);
        tree
    }

    fn build(
        &mut self,
        yy: &[[f32; 2]],
        lb: usize,
        ub: usize,
        centre: [f32; 2],
        half: f32,
        depth: usize,
    ) -> usize {
        let id = self.nodes.len();
        let mass = (ub - lb) as f32;
        let mut com = [0f32; 2];
        for &i in &self.order[lb..ub] {
            com[0] += yy[i][0];
            com[1] += yy[i][1];
        }
        self.nodes.push(QuadNode {
            centre_of_mass: [com[0] / mass, com[1] / mass],
            mass,
            width: 2. * half,
            children: vec![],
            lb,
            ub,
        });

        if ub - lb <= 1 || depth >= MAX_TREE_DEPTH {
            return id;
        }

        let quadrant =
            |i: usize| (yy[i][0] >= centre[0]) as usize + 2 * (yy[i][1] >= centre[1]) as usize;
        self.order[lb..ub].sort_by_key(|&i| quadrant(i));

        let mut children = Vec::with_capacity(4);
        let mut start = lb;
        for q in 0..4 {
            let mut end = start;
            while end < ub && quadrant(self.order[end]) == q {
                end += 1;
            }
            if end > start {
                let sx = if q & 1 == 1 { 0.5 } else { -0.5 };
                let sy = if q & 2 == 2 { 0.5 } else { -0.5 };
                let sub = [centre[0] + sx * half, centre[1] + sy * half];
                children.push(self.build(yy, start, end, sub, half / 2., depth + 1));
            }
            start = end;
        }
        self.nodes[id].children = children;
        id
    }

    /// Repulsion at point `i`: a cell of width w at distance d is
    /// summarized when `w < theta * d`
    fn repulsion(&self, yy: &[[f32; 2]], i: usize, theta: f32) -> Repulsion {
        let mut ret = Repulsion::default();
        if self.nodes.is_empty() {
            return ret;
        }
        let yi = yy[i];
        let mut add = |dx: f32, dy: f32, mass: f32| {
            let q = 1. / (1. + dx * dx + dy * dy);
            ret.z += mass * q;
            ret.force[0] += mass * q * q * dx;
            ret.force[1] += mass * q * q * dy;
            ret.visits += 1;
        };

        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                for &j in &self.order[node.lb..node.ub] {
                    if j != i {
                        add(yi[0] - yy[j][0], yi[1] - yy[j][1], 1.);
                    }
                }
                continue;
            }
            let dx = yi[0] - node.centre_of_mass[0];
            let dy = yi[1] - node.centre_of_mass[1];
            let d2 = dx * dx + dy * dy;
            if d2 > 0. && node.width * node.width < theta * theta * d2 {
                add(dx, dy, node.mass);
            } else {
                stack.extend(node.children.iter().copied());
            }
        }
        ret
    }
}

/// `p_j|i ∝ exp(-β d²_ij)` with β found by bisection so that the
/// entropy matches `target = ln(perplexity)`
fn conditional_probabilities(d2: &[f32], target: f32) -> Vec<f32> {
    const TOLERANCE: f32 = 1e-5;
    const MAX_ITER: usize = 100;

    if d2.is_empty() {
        return vec![];
    }

    let d_min = d2.iter().cloned().fold(f32::INFINITY, f32::min);
    let mut beta = 1f32;
    let mut lo = 0f32;
    let mut hi = f32::INFINITY;
    let mut probs = vec![0f32; d2.len()];

    for _ in 0..MAX_ITER {
        let mut sum = 0f32;
        let mut weighted = 0f32;
        for (p, &d) in probs.iter_mut().zip(d2) {
            // shifted by the nearest distance for stability
            *p = (-(d - d_min) * beta).exp();
            sum += *p;
            weighted += (d - d_min) * *p;
        }
        let entropy = sum.ln() + beta * weighted / sum;

        let diff = entropy - target;
        if diff.abs() < TOLERANCE {
            break;
        }
        if diff > 0. {
            lo = beta;
            beta = if hi.is_infinite() { beta * 2. } else { (beta + hi) / 2. };
        } else {
            hi = beta;
            beta = (beta + lo) / 2.;
        }
    }

    let sum: f32 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn conditional_probabilities_hit_the_perplexity() {
        let d2: Vec<f32> = (1..=30).map(|x| x as f32 * 0.3).collect();
        let probs = conditional_probabilities(&d2, 10f32.ln());
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.).abs() < 1e-4);
        let entropy: f32 = -probs.iter().filter(|&&p| p > 0.).map(|p| p * p.ln()).sum::<f32>();
        assert!((entropy.exp() - 10.).abs() < 0.1, "perplexity {}", entropy.exp());
    }

    #[test]
    fn separated_groups_stay_apart() {
        let mut rng = StdRng::seed_from_u64(3);
        let data = Mat::from_fn(60, 5, |i, _| {
            let offset = if i < 30 { 0. } else { 20. };
            offset + rng.random::<f32>()
        });
        let yy = TSne::default().perplexity(5.).n_iter(300).seed(1).fit(&data).unwrap();
        assert_eq!(yy.shape(), (60, 2));
        assert!(yy.iter().all(|x| x.is_finite()));

        let centre = |lb: usize| {
            let block = yy.rows(lb, 30);
            (block.column(0).mean(), block.column(1).mean())
        };
        let (a, b) = (centre(0), centre(30));
        let between = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();

        let spread = |lb: usize, c: (f32, f32)| {
            yy.rows(lb, 30)
                .row_iter()
                .map(|r| ((r[0] - c.0).powi(2) + (r[1] - c.1).powi(2)).sqrt())
                .sum::<f32>()
                / 30.
        };
        assert!(between > spread(0, a) + spread(30, b));
    }

    /// Gaussian blobs laid out like a t-SNE map
    fn layout(nn: usize, seed: u64) -> Vec<[f32; 2]> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0f32, 10.).unwrap();
        (0..nn)
            .map(|i| {
                let shift = if i % 3 == 0 { 30. } else { 0. };
                [noise.sample(&mut rng) + shift, noise.sample(&mut rng)]
            })
            .collect()
    }

    #[test]
    fn zero_theta_matches_the_exact_sum() {
        let yy = layout(200, 5);
        let tree = QuadTree::new(&yy);
        for i in [0, 17, 199] {
            let approx = tree.repulsion(&yy, i, 0.);
            let mut z = 0f32;
            let mut force = [0f32; 2];
            for (j, yj) in yy.iter().enumerate() {
                if j != i {
                    let (dx, dy) = (yy[i][0] - yj[0], yy[i][1] - yj[1]);
                    let q = 1. / (1. + dx * dx + dy * dy);
                    z += q;
                    force[0] += q * q * dx;
                    force[1] += q * q * dy;
                }
            }
            assert_eq!(approx.visits, 199);
            assert!((approx.z - z).abs() <= 1e-4 * z.abs().max(1.));
            assert!((approx.force[0] - force[0]).abs() < 1e-5);
            assert!((approx.force[1] - force[1]).abs() < 1e-5);
        }
    }

    #[test]
    fn barnes_hut_cost_grows_slowly_with_cells() {
        let mean_visits = |nn: usize| {
            let yy = layout(nn, 9);
            let tree = QuadTree::new(&yy);
            let total: usize = (0..nn).map(|i| tree.repulsion(&yy, i, 0.5).visits).sum();
            total as f32 / nn as f32
        };
        let small = mean_visits(1000);
        let large = mean_visits(3000);
        assert!(large < 3000. / 8., "{} terms per cell", large);
        // an exact sum would triple
        assert!(large < 2. * small, "{} vs {}", large, small);
    }

    #[test]
    fn approximate_repulsion_stays_close() {
        let yy = layout(1500, 2);
        let tree = QuadTree::new(&yy);
        let z_exact: f32 = (0..yy.len()).map(|i| tree.repulsion(&yy, i, 0.).z).sum();
        let z_bh: f32 = (0..yy.len()).map(|i| tree.repulsion(&yy, i, 0.5).z).sum();
        assert!((z_bh - z_exact).abs() < 0.05 * z_exact);
    }

    #[test]
    fn duplicated_points_do_not_recurse_forever() {
        let yy = vec![[1f32, 1.]; 50];
        let tree = QuadTree::new(&yy);
        let rep = tree.repulsion(&yy, 3, 0.5);
        assert_eq!(rep.visits, 49);
        assert!((rep.z - 49.).abs() < 1e-4);
    }

    #[test]
    fn same_seed_same_layout() {
        let data = Mat::from_fn(20, 3, |i, j| (i * 7 + j * 3) as f32 % 5.);
        let a = TSne::default().perplexity(3.).n_iter(50).fit(&data).unwrap();
        let b = TSne::default().perplexity(3.).n_iter(50).fit(&data).unwrap();
        assert_eq!(a, b);
    }
}
