//! Principal components fit on a seeded subsample of cells and
//! applied to every cell
//!
//! Fitting touches only the training cells, a batch at a time; the
//! projection then streams the full matrix through the fixed basis
//! in contiguous batches. A batch is centred into one buffer of at
//! most `ceil(n / n_batches)` rows and batches run one after another;
//! the work inside a batch is parallel.

use crate::common::*;
use crate::config::PcaParams;
use crate::expression::ExpressionContainer;

use indicatif::ProgressBar;
use matrix_util::dmatrix_rsvd::{LinearOperator, RandomizedSVD};
use matrix_util::utils::split_into_batches;
use nalgebra::{DMatrix, RowDVector, SymmetricEigen};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

/// Fitted principal component basis; immutable once fit
#[derive(Clone, Debug, PartialEq)]
pub struct PcaBasis {
    /// per-gene mean of the training cells
    pub mean: RowDVector<f32>,
    /// genes × components, orthonormal columns
    pub components: Mat,
    pub explained_variance: Vec<f32>,
    pub explained_variance_ratio: Vec<f32>,
    /// sorted row positions of the training cells
    pub train_cells: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct PcaResult {
    pub basis: PcaBasis,
    /// cells × components
    pub embedding: Mat,
}

/// `floor(train_ratio * n_cells)` distinct cells drawn by a seeded
/// generator, sorted
pub fn draw_training_cells(n_cells: usize, train_ratio: f32, seed: u64) -> Vec<usize> {
    let n_train = ((n_cells as f64) * (train_ratio as f64)).floor() as usize;
    let n_train = n_train.min(n_cells);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cells = rand::seq::index::sample(&mut rng, n_cells, n_train).into_vec();
    cells.sort_unstable();
    cells
}

/// Fit a basis of `params.n_components` components on the training
/// cells of `xx` (cells × genes)
pub fn fit_pca_basis(xx: &Mat, params: &PcaParams) -> anyhow::Result<PcaBasis> {
    let (n_cells, n_genes) = xx.shape();
    let kk = params.n_components;

    let train_cells = draw_training_cells(n_cells, params.train_ratio, params.seed);
    let n_train = train_cells.len();

    if n_train < kk {
        return Err(LentilError::insufficient(Stage::Pca, kk, n_train));
    }
    if n_genes < kk {
        return Err(LentilError::insufficient(Stage::Pca, kk, n_genes));
    }
    if n_train < 2 {
        return Err(LentilError::insufficient(Stage::Pca, 2, n_train));
    }

    info!(
        "fitting {} components on {} of {} cells ({} genes)",
        kk, n_train, n_cells, n_genes
    );

    let (mean, components, explained_variance, total_variance) =
        if n_genes <= params.max_dense_features {
            fit_by_covariance(xx, &train_cells, kk, params.n_batches)?
        } else {
            fit_by_randomized_svd(xx, &train_cells, kk, params.n_batches, params.seed)?
        };

    let mut components = components;
    fix_component_signs(&mut components);

    let explained_variance_ratio = explained_variance
        .iter()
        .map(|&v| if total_variance > 0. { v / total_variance } else { 0. })
        .collect::<Vec<_>>();

    info!(
        "explained variance ratio of the first {} components: {:.4}",
        kk,
        explained_variance_ratio.iter().sum::<f32>()
    );

    Ok(PcaBasis {
        mean,
        components,
        explained_variance,
        explained_variance_ratio,
        train_cells,
    })
}

type BasisParts = (RowDVector<f32>, Mat, Vec<f32>, f32);

/// Per-gene mean over `rows` of `xx`
fn training_mean(xx: &Mat, rows: &[usize]) -> RowDVector<f32> {
    let nn = rows.len().max(1) as f64;
    let mean: Vec<f32> = (0..xx.ncols())
        .into_par_iter()
        .map(|j| (rows.iter().map(|&i| xx[(i, j)] as f64).sum::<f64>() / nn) as f32)
        .collect();
    RowDVector::from_vec(mean)
}

/// Copy rows `lb..lb + buf.nrows()` of the selection into `buf`,
/// minus the mean; `rows = None` selects every row of `xx`
fn fill_centred_block(
    xx: &Mat,
    rows: Option<&[usize]>,
    mean: &RowDVector<f32>,
    lb: usize,
    buf: &mut Mat,
) {
    let len = buf.nrows();
    if len == 0 {
        return;
    }
    buf.as_mut_slice()
        .par_chunks_mut(len)
        .enumerate()
        .for_each(|(j, col)| {
            let mu = mean[j];
            for (r, x) in col.iter_mut().enumerate() {
                let i = rows.map_or(lb + r, |rr| rr[lb + r]);
                *x = xx[(i, j)] - mu;
            }
        });
}

/// Visit the centred selection in `n_batches` contiguous batches,
/// in order, handing each one to `visit` with its first row
fn for_each_centred_batch<F>(
    xx: &Mat,
    rows: Option<&[usize]>,
    mean: &RowDVector<f32>,
    n_batches: usize,
    mut visit: F,
) -> anyhow::Result<()>
where
    F: FnMut(usize, &Mat) -> anyhow::Result<()>,
{
    let ntot = rows.map_or(xx.nrows(), <[usize]>::len);
    let mut buf = Mat::zeros(0, xx.ncols());
    for (lb, ub) in split_into_batches(ntot, n_batches) {
        if buf.nrows() != ub - lb {
            buf = Mat::zeros(ub - lb, xx.ncols());
        }
        fill_centred_block(xx, rows, mean, lb, &mut buf);
        visit(lb, &buf)?;
    }
    Ok(())
}

/// Gram matrix of the centred training cells accumulated batch by
/// batch, then an eigen-decomposition of the covariance
fn fit_by_covariance(
    xx: &Mat,
    train_cells: &[usize],
    kk: usize,
    n_batches: usize,
) -> anyhow::Result<BasisParts> {
    let n_genes = xx.ncols();
    let nn = train_cells.len() as f64;

    let mean = training_mean(xx, train_cells);
    let mut gram = DMatrix::<f64>::zeros(n_genes, n_genes);
    for_each_centred_batch(xx, Some(train_cells), &mean, n_batches, |_, block| {
        gram += block.tr_mul(block).cast::<f64>();
        Ok(())
    })?;

    let cov = gram / (nn - 1.);
    let total_variance = cov.trace();

    let eig = SymmetricEigen::new(cov);
    let mut order: Vec<usize> = (0..n_genes).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    order.truncate(kk);

    let components = eig.eigenvectors.select_columns(&order).cast::<f32>();
    let explained_variance = order
        .iter()
        .map(|&j| eig.eigenvalues[j].max(0.) as f32)
        .collect();

    Ok((mean, components, explained_variance, total_variance as f32))
}

/// Centred training cells as an operator; every product streams the
/// batches, so the subsample is never copied whole
struct CentredRows<'a> {
    xx: &'a Mat,
    rows: &'a [usize],
    mean: &'a RowDVector<f32>,
    n_batches: usize,
}

impl LinearOperator for CentredRows<'_> {
    fn nrows(&self) -> usize {
        self.rows.len()
    }

    fn ncols(&self) -> usize {
        self.xx.ncols()
    }

    fn apply(&self, mm: &Mat) -> anyhow::Result<Mat> {
        let mut ret = Mat::zeros(self.rows.len(), mm.ncols());
        for_each_centred_batch(self.xx, Some(self.rows), self.mean, self.n_batches, |lb, block| {
            ret.rows_mut(lb, block.nrows()).copy_from(&(block * mm));
            Ok(())
        })?;
        Ok(ret)
    }

    fn apply_transpose(&self, mm: &Mat) -> anyhow::Result<Mat> {
        let mut ret = Mat::zeros(self.xx.ncols(), mm.ncols());
        for_each_centred_batch(self.xx, Some(self.rows), self.mean, self.n_batches, |lb, block| {
            ret += block.tr_mul(&mm.rows(lb, block.nrows()));
            Ok(())
        })?;
        Ok(ret)
    }
}

/// Seeded randomized SVD of the centred training cells, sketched
/// batch by batch
fn fit_by_randomized_svd(
    xx: &Mat,
    train_cells: &[usize],
    kk: usize,
    n_batches: usize,
    seed: u64,
) -> anyhow::Result<BasisParts> {
    let nn = train_cells.len() as f32;
    let mean = training_mean(xx, train_cells);

    let mut sum_squares = 0f64;
    for_each_centred_batch(xx, Some(train_cells), &mean, n_batches, |_, block| {
        sum_squares += block.norm_squared() as f64;
        Ok(())
    })?;
    let total_variance = (sum_squares / (nn as f64 - 1.)) as f32;

    let op = CentredRows {
        xx,
        rows: train_cells,
        mean: &mean,
        n_batches,
    };
    let mut svd = RandomizedSVD::new(kk, 5, seed);
    svd.compute(&op)?;

    let vv = svd.matrix_v().clone();
    if vv.ncols() < kk {
        return Err(LentilError::insufficient(Stage::Pca, kk, vv.ncols()));
    }
    let explained_variance = svd
        .singular_values()
        .iter()
        .map(|&s| s * s / (nn - 1.))
        .collect();

    Ok((mean, vv, explained_variance, total_variance))
}

/// Flip each component so its largest-magnitude loading is positive
fn fix_component_signs(components: &mut Mat) {
    for mut col in components.column_iter_mut() {
        let pivot = col
            .iter()
            .copied()
            .fold(0f32, |a, x| if x.abs() > a.abs() { x } else { a });
        if pivot < 0. {
            col.neg_mut();
        }
    }
}

impl PcaBasis {
    pub fn num_components(&self) -> usize {
        self.components.ncols()
    }

    /// `(X - μ) V` for the rows of `xx`
    pub fn project(&self, xx: &Mat) -> anyhow::Result<Mat> {
        self.project_in_batches(xx, 1)
    }

    /// Project every row of `xx` in `n_batches` contiguous batches of
    /// at most `ceil(n / n_batches)` rows, one batch at a time
    pub fn project_in_batches(&self, xx: &Mat, n_batches: usize) -> anyhow::Result<Mat> {
        if xx.ncols() != self.mean.len() {
            return Err(LentilError::integrity(
                Stage::Pca,
                format!(
                    "{} genes to project on a basis of {} genes",
                    xx.ncols(),
                    self.mean.len()
                ),
            ));
        }

        let nn = xx.nrows();
        let kk = self.num_components();
        let mut ret = Mat::zeros(nn, kk);
        if nn == 0 {
            return Ok(ret);
        }

        let pb = ProgressBar::new(split_into_batches(nn, n_batches).len() as u64);
        for_each_centred_batch(xx, None, &self.mean, n_batches, |lb, block| {
            let len = block.nrows();
            // columns of the output are contiguous in column-major storage
            ret.as_mut_slice()
                .par_chunks_mut(nn)
                .enumerate()
                .for_each(|(k, col)| {
                    let proj = block * self.components.column(k);
                    col[lb..(lb + len)].copy_from_slice(proj.as_slice());
                });
            pb.inc(1);
            Ok(())
        })?;
        pb.finish_and_clear();
        Ok(ret)
    }
}

/// Fit on a subsample of the scaled matrix and project all cells
pub fn run_batched_pca(data: &ExpressionContainer, params: &PcaParams) -> anyhow::Result<PcaResult> {
    let Some(xx) = data.scaled() else {
        return Err(LentilError::integrity(
            Stage::Pca,
            "principal components need the scaled matrix",
        ));
    };

    let basis = fit_pca_basis(xx, params)?;
    let embedding = basis.project_in_batches(xx, params.n_batches)?;

    if embedding.nrows() != data.num_cells() {
        return Err(LentilError::integrity(
            Stage::Pca,
            format!(
                "{} projected rows for {} cells",
                embedding.nrows(),
                data.num_cells()
            ),
        ));
    }

    info!(
        "projected {} cells onto {} components",
        embedding.nrows(),
        embedding.ncols()
    );

    Ok(PcaResult { basis, embedding })
}
