//! Seeded k-means clustering for matrices
//!
//! Lloyd iterations started from k-means++ seeding. Every random
//! draw comes from a `StdRng` seeded by `KmeansArgs::seed`, so a fixed
//! seed gives a fixed partition.

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    /// Number of clusters
    pub num_clusters: usize,
    /// Maximum number of Lloyd iterations
    pub max_iter: usize,
    /// Number of restarts; the lowest inertia wins
    pub num_init: usize,
    pub seed: u64,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 300,
            num_init: 1,
            seed: 0,
        }
    }
}

impl KmeansArgs {
    /// Create args with specified number of clusters
    pub fn with_clusters(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Default::default()
        }
    }
}

/// Result of one k-means fit
#[derive(Debug, Clone)]
pub struct KmeansFit {
    pub membership: Vec<usize>,
    /// k x d centroid matrix
    pub centroids: DMatrix<f32>,
    /// sum of squared distances to the assigned centroids
    pub inertia: f64,
    pub iterations: usize,
}

/// Trait for k-means clustering on matrices
pub trait Kmeans {
    /// Cluster columns and return membership vector
    fn kmeans_columns(&self, args: &KmeansArgs) -> Vec<usize>;

    /// Cluster rows and return membership vector
    fn kmeans_rows(&self, args: &KmeansArgs) -> Vec<usize>;
}

impl Kmeans for DMatrix<f32> {
    fn kmeans_columns(&self, args: &KmeansArgs) -> Vec<usize> {
        self.transpose().kmeans_rows(args)
    }

    fn kmeans_rows(&self, args: &KmeansArgs) -> Vec<usize> {
        if args.num_clusters <= 1 || self.nrows() == 0 {
            return vec![0; self.nrows()];
        }
        fit_kmeans_rows(self, args).membership
    }
}

/// Fit k-means on the rows of `data`, keeping the best of
/// `args.num_init` seeded restarts.
pub fn fit_kmeans_rows(data: &DMatrix<f32>, args: &KmeansArgs) -> KmeansFit {
    let nn = data.nrows();
    let kk = args.num_clusters.clamp(1, nn.max(1));

    let points: Vec<Vec<f32>> = data
        .row_iter()
        .map(|x| x.iter().copied().collect())
        .collect();

    let mut seeder = StdRng::seed_from_u64(args.seed);
    let mut best: Option<KmeansFit> = None;

    for _ in 0..args.num_init.max(1) {
        let mut rng = StdRng::seed_from_u64(seeder.random::<u64>());
        let fit = lloyd(&points, kk, args.max_iter, &mut rng);
        if best.as_ref().is_none_or(|b| fit.inertia < b.inertia) {
            best = Some(fit);
        }
    }

    best.unwrap_or_else(|| KmeansFit {
        membership: vec![0; nn],
        centroids: DMatrix::zeros(0, data.ncols()),
        inertia: 0.,
        iterations: 0,
    })
}

fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// k-means++ seeding: each new centre is drawn with probability
/// proportional to the squared distance from the nearest chosen one
fn kmeans_plus_plus(points: &[Vec<f32>], kk: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let nn = points.len();
    let mut centres = Vec::with_capacity(kk);
    centres.push(points[rng.random_range(0..nn)].clone());

    let mut d2: Vec<f32> = points.iter().map(|x| sq_dist(x, &centres[0])).collect();

    while centres.len() < kk {
        let total: f64 = d2.iter().map(|&d| d as f64).sum();
        let next = if total > 0. {
            let mut u = rng.random::<f64>() * total;
            let mut pick = nn - 1;
            for (i, &d) in d2.iter().enumerate() {
                u -= d as f64;
                if u <= 0. && d > 0. {
                    pick = i;
                    break;
                }
            }
            pick
        } else {
            rng.random_range(0..nn)
        };
        let c = points[next].clone();
        d2.par_iter_mut()
            .zip(points.par_iter())
            .for_each(|(d, x)| *d = d.min(sq_dist(x, &c)));
        centres.push(c);
    }
    centres
}

fn assign(points: &[Vec<f32>], centres: &[Vec<f32>]) -> Vec<(usize, f32)> {
    points
        .par_iter()
        .map(|x| {
            centres
                .iter()
                .enumerate()
                .map(|(k, c)| (k, sq_dist(x, c)))
                .fold((0, f32::INFINITY), |a, b| if b.1 < a.1 { b } else { a })
        })
        .collect()
}

fn lloyd(points: &[Vec<f32>], kk: usize, max_iter: usize, rng: &mut StdRng) -> KmeansFit {
    let nn = points.len();
    let dd = points.first().map(|x| x.len()).unwrap_or(0);

    let mut centres = kmeans_plus_plus(points, kk, rng);
    let mut assignment = assign(points, &centres);
    let mut iterations = 0;

    for iter in 0..max_iter {
        iterations = iter + 1;

        let mut sums = vec![vec![0f64; dd]; kk];
        let mut counts = vec![0usize; kk];
        for (x, &(k, _)) in points.iter().zip(assignment.iter()) {
            counts[k] += 1;
            for (s, &v) in sums[k].iter_mut().zip(x) {
                *s += v as f64;
            }
        }

        for k in 0..kk {
            if counts[k] > 0 {
                centres[k] = sums[k]
                    .iter()
                    .map(|&s| (s / counts[k] as f64) as f32)
                    .collect();
            } else {
                // an empty cluster takes over the worst-fitted point
                let far = assignment
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                centres[k] = points[far].clone();
                assignment[far] = (k, 0.);
            }
        }

        let next = assign(points, &centres);
        let changed = next
            .iter()
            .zip(assignment.iter())
            .filter(|(a, b)| a.0 != b.0)
            .count();
        assignment = next;
        if changed == 0 {
            break;
        }
    }

    let inertia = assignment.iter().map(|&(_, d)| d as f64).sum();
    let mut centroids = DMatrix::<f32>::zeros(kk, dd);
    for (k, c) in centres.iter().enumerate() {
        for (j, &v) in c.iter().enumerate() {
            centroids[(k, j)] = v;
        }
    }

    debug_assert_eq!(assignment.len(), nn);

    KmeansFit {
        membership: assignment.into_iter().map(|(k, _)| k).collect(),
        centroids,
        inertia,
        iterations,
    }
}
