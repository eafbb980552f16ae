//! UMAP-style two-dimensional layout of a fuzzy kNN graph

use crate::common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct UmapLayout {
    pub min_dist: f32,
    pub spread: f32,
    pub n_epochs: usize,
    pub learning_rate: f32,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl Default for UmapLayout {
    fn default() -> Self {
        Self {
            min_dist: 0.3,
            spread: 1.0,
            n_epochs: 200,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: 0,
        }
    }
}

/// Fit `a, b` of `1 / (1 + a x^(2b))` to the curve that is 1 up to
/// `min_dist` and decays as `exp(-(x - min_dist) / spread)` beyond,
/// by Levenberg-Marquardt least squares from `a = b = 1`.
pub fn fit_ab(spread: f32, min_dist: f32) -> (f32, f32) {
    const NPTS: usize = 300;
    let spread = spread as f64;
    let min_dist = min_dist as f64;

    let xs: Vec<f64> = (0..NPTS)
        .map(|i| 3. * spread * i as f64 / (NPTS - 1) as f64)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let sse = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(ys.iter())
            .map(|(&x, &y)| {
                let r = 1. / (1. + a * x.powf(2. * b)) - y;
                r * r
            })
            .sum()
    };

    let (mut a, mut b) = (1f64, 1f64);
    let mut lambda = 1e-3;
    let mut current = sse(a, b);

    for _ in 0..500 {
        // normal equations J'J and J'r
        let (mut jaa, mut jab, mut jbb, mut gra, mut grb) = (0., 0., 0., 0., 0.);
        for (&x, &y) in xs.iter().zip(ys.iter()) {
            if x <= 0. {
                continue;
            }
            let u = x.powf(2. * b);
            let denom = 1. + a * u;
            let f = 1. / denom;
            let r = f - y;
            let da = -u / (denom * denom);
            let db = -a * u * 2. * x.ln() / (denom * denom);
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            gra += da * r;
            grb += db * r;
        }

        let mut improved = false;
        while lambda < 1e10 {
            let (haa, hbb) = (jaa * (1. + lambda), jbb * (1. + lambda));
            let det = haa * hbb - jab * jab;
            if det.abs() < 1e-300 {
                lambda *= 10.;
                continue;
            }
            let step_a = -(hbb * gra - jab * grb) / det;
            let step_b = -(haa * grb - jab * gra) / det;
            let (na, nb) = (a + step_a, b + step_b);
            if na > 0. && nb > 0. {
                let next = sse(na, nb);
                if next < current {
                    let gain = current - next;
                    a = na;
                    b = nb;
                    current = next;
                    lambda = (lambda / 10.).max(1e-12);
                    improved = gain > 1e-14;
                    break;
                }
            }
            lambda *= 10.;
        }
        if !improved {
            break;
        }
    }

    (a as f32, b as f32)
}

fn clip(x: f32) -> f32 {
    x.clamp(-4., 4.)
}

impl UmapLayout {
    /// Optimize the layout of a weighted graph by stochastic gradient
    /// descent with negative sampling.
    ///
    /// * `edges` - undirected edges `(i, j)`
    /// * `weights` - membership strength of each edge, in (0, 1]
    /// * `init` - n × 2 starting coordinates
    pub fn optimize(
        &self,
        edges: &[(usize, usize)],
        weights: &[f32],
        init: &Mat,
    ) -> anyhow::Result<Mat> {
        let nn = init.nrows();
        if init.ncols() != 2 {
            return Err(LentilError::integrity(
                Stage::Embedding,
                format!("layout starts from {} columns, not 2", init.ncols()),
            ));
        }
        if edges.len() != weights.len() {
            return Err(LentilError::integrity(
                Stage::Embedding,
                format!("{} edges with {} weights", edges.len(), weights.len()),
            ));
        }

        let (a, b) = fit_ab(self.spread, self.min_dist);
        info!(
            "layout of {} nodes, {} edges: a = {:.4}, b = {:.4}, {} epochs",
            nn,
            edges.len(),
            a,
            b,
            self.n_epochs
        );

        // rescale the start to [-10, 10]
        let max_abs = init.iter().fold(0f32, |m, x| m.max(x.abs()));
        let scale = if max_abs > 0. { 10. / max_abs } else { 1. };
        let mut yy: Vec<[f32; 2]> = (0..nn)
            .map(|i| [init[(i, 0)] * scale, init[(i, 1)] * scale])
            .collect();

        let n_epochs = self.n_epochs.max(1) as f32;
        let max_w = weights.iter().cloned().fold(0f32, f32::max);

        // edges too weak to be sampled once are dropped
        let sampled: Vec<(usize, usize, f32)> = edges
            .iter()
            .zip(weights.iter())
            .filter(|&(_, &w)| w > 0. && w >= max_w / n_epochs)
            .map(|(&(i, j), &w)| (i, j, max_w / w))
            .collect();

        let mut next_sample: Vec<f32> = sampled.iter().map(|s| s.2).collect();
        let mut next_negative: Vec<f32> = sampled
            .iter()
            .map(|s| s.2 / self.negative_sample_rate.max(1) as f32)
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed);

        for epoch in 0..self.n_epochs {
            let alpha = self.learning_rate * (1. - epoch as f32 / n_epochs);
            let now = epoch as f32 + 1.;

            for (e, &(i, j, every)) in sampled.iter().enumerate() {
                if next_sample[e] > now {
                    continue;
                }

                let dx = yy[i][0] - yy[j][0];
                let dy = yy[i][1] - yy[j][1];
                let d2 = dx * dx + dy * dy;
                if d2 > 0. {
                    let coef = -2. * a * b * d2.powf(b - 1.) / (a * d2.powf(b) + 1.);
                    let gx = clip(coef * dx) * alpha;
                    let gy = clip(coef * dy) * alpha;
                    yy[i][0] += gx;
                    yy[i][1] += gy;
                    yy[j][0] -= gx;
                    yy[j][1] -= gy;
                }
                next_sample[e] += every;

                let every_neg = every / self.negative_sample_rate.max(1) as f32;
                let n_neg = ((now - next_negative[e]) / every_neg).floor().max(0.) as usize;
                for _ in 0..n_neg {
                    let k = rng.random_range(0..nn);
                    if k == i {
                        continue;
                    }
                    let dx = yy[i][0] - yy[k][0];
                    let dy = yy[i][1] - yy[k][1];
                    let d2 = dx * dx + dy * dy;
                    let (gx, gy) = if d2 > 0. {
                        let coef = 2. * b / ((0.001 + d2) * (a * d2.powf(b) + 1.));
                        (clip(coef * dx), clip(coef * dy))
                    } else {
                        (4., 4.)
                    };
                    yy[i][0] += gx * alpha;
                    yy[i][1] += gy * alpha;
                }
                next_negative[e] += n_neg as f32 * every_neg;
            }
        }

        Ok(Mat::from_fn(nn, 2, |i, d| yy[i][d]))
    }
}
