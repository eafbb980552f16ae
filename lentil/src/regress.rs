//! Regress total counts and mitochondrial fraction out of every
//! gene, then standardize and clip

use crate::annotation::*;
use crate::common::*;
use crate::config::ScaleParams;
use crate::expression::{ExpressionContainer, ExpressionValues};

use indicatif::ParallelProgressIterator;
use matrix_util::dmatrix_util::column_mean_sd;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Per-cell technical covariates
#[derive(Clone, Debug, PartialEq)]
pub struct Confounders {
    pub total_counts: Vec<f32>,
    /// mitochondrial counts over total counts
    pub mito_fraction: Vec<f32>,
}

pub fn is_mito_gene(gene: &str, prefix: &str) -> bool {
    gene.len() >= prefix.len()
        && gene.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Total counts and mitochondrial fraction of each cell. A cell with
/// zero total count has no defined fraction, which is an integrity
/// error: such cells must be removed by quality control first.
pub fn compute_confounders(
    data: &ExpressionContainer,
    mito_prefix: &str,
) -> anyhow::Result<Confounders> {
    let Some(counts) = data.counts() else {
        return Err(LentilError::integrity(
            Stage::Regression,
            "confounders need raw counts",
        ));
    };

    let is_mito: Vec<bool> = data
        .genes()
        .iter()
        .map(|g| is_mito_gene(g, mito_prefix))
        .collect();

    info!(
        "{} mitochondrial genes by prefix {}",
        is_mito.iter().filter(|&&x| x).count(),
        mito_prefix
    );

    let mut total_counts = Vec::with_capacity(data.num_cells());
    let mut mito_fraction = Vec::with_capacity(data.num_cells());

    for (i, row) in counts.row_iter().enumerate() {
        let mut tot = 0f64;
        let mut mito = 0f64;
        for (&j, &x) in row.col_indices().iter().zip(row.values()) {
            tot += x as f64;
            if is_mito[j] {
                mito += x as f64;
            }
        }
        if tot == 0. {
            return Err(LentilError::integrity(
                Stage::Regression,
                format!("cell {} has zero total count", data.cells()[i]),
            ));
        }
        total_counts.push(tot as f32);
        mito_fraction.push((mito / tot) as f32);
    }

    Ok(Confounders {
        total_counts,
        mito_fraction,
    })
}

/// `(XᵀX)⁺` of the design `[1, total, mito]`
fn design_pseudo_inverse(conf: &Confounders) -> anyhow::Result<Matrix3<f64>> {
    let mut xtx = Matrix3::<f64>::zeros();
    for (&t, &m) in conf.total_counts.iter().zip(conf.mito_fraction.iter()) {
        let x = Vector3::new(1., t as f64, m as f64);
        xtx += x * x.transpose();
    }
    xtx.pseudo_inverse(1e-10)
        .map_err(|e| LentilError::integrity(Stage::Regression, format!("design: {}", e)))
}

/// Standardize to zero mean and unit population variance, then cap
/// values above `clip_max`. A constant column is centred only.
pub fn scale_and_clip_column(xx: &mut [f32], clip_max: f32) {
    let (mu, sig) = column_mean_sd(xx);
    for x in xx.iter_mut() {
        *x -= mu;
        if sig > 0. {
            *x /= sig;
        }
        if *x > clip_max {
            *x = clip_max;
        }
    }
}

/// Dense residuals of each gene after ordinary least squares on the
/// confounders, scaled and clipped gene by gene.
pub fn regress_out_and_scale(
    counts: &CsrMat,
    conf: &Confounders,
    clip_max: f32,
) -> anyhow::Result<Mat> {
    let nn = counts.nrows();
    let ngenes = counts.ncols();

    if conf.total_counts.len() != nn {
        return Err(LentilError::integrity(
            Stage::Regression,
            format!("{} confounder rows for {} cells", conf.total_counts.len(), nn),
        ));
    }

    let pinv = design_pseudo_inverse(conf)?;
    let csc = CscMat::from(counts);

    let mut data = vec![0f32; nn * ngenes];

    data.par_chunks_mut(nn.max(1))
        .enumerate()
        .progress_count(ngenes as u64)
        .for_each(|(j, yy)| {
            let col = csc.col(j);
            let mut xty = Vector3::<f64>::zeros();
            for (&i, &y) in col.row_indices().iter().zip(col.values()) {
                yy[i] = y;
                let y = y as f64;
                xty[0] += y;
                xty[1] += y * conf.total_counts[i] as f64;
                xty[2] += y * conf.mito_fraction[i] as f64;
            }
            let beta = pinv * xty;
            for (i, y) in yy.iter_mut().enumerate() {
                let fitted = beta[0]
                    + beta[1] * conf.total_counts[i] as f64
                    + beta[2] * conf.mito_fraction[i] as f64;
                *y = (*y as f64 - fitted) as f32;
            }
            scale_and_clip_column(yy, clip_max);
        });

    Ok(Mat::from_vec(nn, ngenes, data))
}

/// Replace the container's counts by regressed, scaled and clipped
/// values; records `n_counts` and `percent_mito`
pub fn regress_and_scale(
    data: ExpressionContainer,
    params: &ScaleParams,
) -> anyhow::Result<ExpressionContainer> {
    let mut data = data;
    let conf = compute_confounders(&data, &params.mito_prefix)?;

    let Some(counts) = data.counts() else {
        return Err(LentilError::integrity(
            Stage::Regression,
            "regression needs raw counts",
        ));
    };

    info!(
        "regressing out confounders over {} cells x {} genes",
        data.num_cells(),
        data.num_genes()
    );
    let scaled = regress_out_and_scale(counts, &conf, params.clip_max)?;

    data.annotations.insert(
        Stage::Regression,
        AnnotationKey::Qc(QcMetric::TotalCounts),
        AnnotationColumn::Numeric(conf.total_counts),
    )?;
    data.annotations.insert(
        Stage::Regression,
        AnnotationKey::Qc(QcMetric::MitoPercent),
        AnnotationColumn::Numeric(conf.mito_fraction),
    )?;

    data.replace_values(ExpressionValues::Scaled(scaled), Stage::Regression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn container(triplets: &[(usize, usize, f32)], ncells: usize) -> ExpressionContainer {
        let cells = (0..ncells).map(|i| format!("c{}", i).into_boxed_str()).collect();
        let genes = vec!["mt-Nd1".into(), "Snap25".into(), "Gad1".into()];
        ExpressionContainer::from_triplets(cells, genes, triplets).unwrap()
    }

    #[test]
    fn zero_count_cell_is_an_integrity_error() {
        let data = container(&[(0, 1, 2.), (2, 2, 1.)], 3);
        let err = regress_and_scale(data, &ScaleParams::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LentilError>(),
            Some(LentilError::DataIntegrity {
                stage: Stage::Regression,
                ..
            })
        ));
    }

    #[test]
    fn mito_prefix_ignores_case() {
        let data = container(&[(0, 0, 1.), (0, 1, 3.), (1, 1, 2.)], 2);
        let conf = compute_confounders(&data, "mt-").unwrap();
        assert_eq!(conf.total_counts, vec![4., 2.]);
        assert_eq!(conf.mito_fraction, vec![0.25, 0.]);
    }

    #[test]
    fn residuals_are_orthogonal_to_total_counts() {
        let triplets: Vec<(usize, usize, f32)> = (0..20)
            .flat_map(|i| {
                let t = 1. + i as f32;
                vec![(i, 0, 1. + (i % 3) as f32), (i, 1, 2. * t + (i % 2) as f32), (i, 2, t)]
            })
            .collect();
        let data = container(&triplets, 20);
        let conf = compute_confounders(&data, "MT-").unwrap();
        let scaled = regress_out_and_scale(data.counts().unwrap(), &conf, 100.).unwrap();

        for j in 0..3 {
            let col = scaled.column(j);
            let (mu, _) = column_mean_sd(col.as_slice());
            assert_abs_diff_eq!(mu, 0., epsilon = 1e-4);
            let dot: f64 = col
                .iter()
                .zip(conf.total_counts.iter())
                .map(|(&r, &t)| r as f64 * t as f64)
                .sum();
            assert_abs_diff_eq!(dot, 0., epsilon = 5e-2);
        }
    }

    #[test]
    fn clipping_caps_only_large_values() {
        let mut xx: Vec<f32> = vec![0.; 99];
        xx.push(100.);
        scale_and_clip_column(&mut xx, 3.);
        assert_eq!(xx[99], 3.);
        assert!(xx[0] < 0.);

        let mut constant = vec![2.; 5];
        scale_and_clip_column(&mut constant, 10.);
        assert!(constant.iter().all(|&x| x == 0.));
    }
}
