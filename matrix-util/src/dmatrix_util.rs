use crate::traits::*;
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

impl SampleOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn runif(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = StdRng::seed_from_u64(seed);
        let rvec: Vec<f32> = (0..(dd * nn)).map(|_| rng.random::<f32>()).collect();
        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }

    fn rnorm(dd: usize, nn: usize, seed: u64) -> Self::Mat {
        let mut rng = StdRng::seed_from_u64(seed);
        let rvec: Vec<f32> = (0..(dd * nn))
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        DMatrix::<f32>::from_vec(dd, nn, rvec)
    }
}

impl MatOps for DMatrix<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn normalize_columns_inplace(&mut self) {
        for mut xj in self.column_iter_mut() {
            let denom = xj.norm();
            if denom > 0. {
                xj /= denom;
            }
        }
    }

    fn normalize_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.normalize_columns_inplace();
        ret
    }

    fn scale_columns_inplace(&mut self) {
        for mut xj in self.column_iter_mut() {
            let (mu, sig) = column_mean_sd(xj.as_slice());
            for x in xj.iter_mut() {
                *x -= mu;
                if sig > 0. {
                    *x /= sig;
                }
            }
        }
    }

    fn scale_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.scale_columns_inplace();
        ret
    }

    fn centre_columns_inplace(&mut self) {
        for mut xj in self.column_iter_mut() {
            let (mu, _) = column_mean_sd(xj.as_slice());
            xj.add_scalar_mut(-mu);
        }
    }

    fn centre_columns(&self) -> Self::Mat {
        let mut ret = self.clone();
        ret.centre_columns_inplace();
        ret
    }
}

/// Mean and population standard deviation, accumulated in `f64`
pub fn column_mean_sd(xx: &[f32]) -> (f32, f32) {
    if xx.is_empty() {
        return (0., 0.);
    }
    let nn = xx.len() as f64;
    let mu = xx.iter().map(|&x| x as f64).sum::<f64>() / nn;
    let var = xx
        .iter()
        .map(|&x| {
            let d = x as f64 - mu;
            d * d
        })
        .sum::<f64>()
        / nn;
    (mu as f32, var.sqrt() as f32)
}
