use crate::traits::SampleOps;
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f32>;
type DVec = DVector<f32>;

/// A matrix known only through products, so randomized SVD can run
/// on data that is never materialized in one piece
pub trait LinearOperator {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    /// `A M`
    fn apply(&self, mm: &Mat) -> anyhow::Result<Mat>;
    /// `Aᵀ M`
    fn apply_transpose(&self, mm: &Mat) -> anyhow::Result<Mat>;
}

impl LinearOperator for Mat {
    fn nrows(&self) -> usize {
        self.shape().0
    }
    fn ncols(&self) -> usize {
        self.shape().1
    }
    fn apply(&self, mm: &Mat) -> anyhow::Result<Mat> {
        Ok(self * mm)
    }
    fn apply_transpose(&self, mm: &Mat) -> anyhow::Result<Mat> {
        Ok(self.tr_mul(mm))
    }
}

pub trait RSVD {
    /// Truncated SVD `X ≈ U diag(d) Vᵀ` with a seeded random sketch
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, DVec, Mat)>;
}

impl RSVD for Mat {
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, DVec, Mat)> {
        let default_iter = 5;
        let mut rsvd = RandomizedSVD::new(rank, default_iter, seed);
        rsvd.compute(self)?;
        Ok((
            rsvd.matrix_u().clone(),
            rsvd.singular_values().clone(),
            rsvd.matrix_v().clone(),
        ))
    }
}

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009): randomized subspace
/// iteration with re-orthonormalization between the power steps.
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: DVec,
    v_vectors: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize, seed: u64) -> Self {
        Self {
            max_rank,
            iter,
            seed,
            u_vectors: Mat::zeros(0, 0),
            singular_values: DVec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
        }
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &DVec {
        &self.singular_values
    }

    pub fn compute<A>(&mut self, xx: &A) -> anyhow::Result<()>
    where
        A: LinearOperator + ?Sized,
    {
        let nr = xx.nrows();
        let nc = xx.ncols();

        let mut rank = nr.min(nc);
        let mut oversample = 0;

        if self.max_rank > 0 && rank > self.max_rank {
            rank = self.max_rank;
            oversample = 10.min(nr.min(nc) - rank);
        }

        if rank == 0 {
            anyhow::bail!("randomized SVD needs a non-empty matrix");
        }

        let qq = self.rand_subspace_iteration(xx, rank + oversample)?;

        let bb = xx.apply_transpose(&qq)?.transpose();
        log::debug!("final svd on [{} x {}]", bb.nrows(), bb.ncols());

        let svd = bb.svd(true, true);

        if let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) {
            let rank = rank.min(svd.singular_values.len());
            self.u_vectors = qq * svd_u.columns(0, rank);
            self.v_vectors = svd_vt.transpose().columns(0, rank).into_owned();
            self.singular_values = svd.singular_values.rows(0, rank).into_owned();
        } else {
            anyhow::bail!("SVD failed");
        }

        Ok(())
    }

    // Find an orthonormal matrix qq whose range approximates the range of xx
    fn rand_subspace_iteration<A>(&self, xx: &A, rank_and_oversample: usize) -> anyhow::Result<Mat>
    where
        A: LinearOperator + ?Sized,
    {
        let omega = Mat::rnorm(xx.ncols(), rank_and_oversample, self.seed);

        let mut qq = orthonormal_columns(xx.apply(&omega)?);

        for i in 0..self.iter {
            log::debug!("subspace iteration {:>5}", i + 1);
            let ww = orthonormal_columns(xx.apply_transpose(&qq)?);
            qq = orthonormal_columns(xx.apply(&ww)?);
        }
        Ok(qq)
    }
}

fn orthonormal_columns(yy: Mat) -> Mat {
    let kk = yy.ncols().min(yy.nrows());
    let qr = yy.qr();
    qr.q().columns(0, kk).into_owned()
}
