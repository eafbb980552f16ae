//! Reference-compound activation and selectivity flags

use crate::annotation::*;
use crate::common::*;
use crate::config::SelectivityParams;
use crate::expression::ExpressionContainer;
use crate::pharmacology::DrugResponseScores;
use crate::rank_test::{rank_genes_groups, RankTestRow};

/// Per-cell flags of the reference compound against the other drugs
#[derive(Clone, Debug, PartialEq)]
pub struct SelectivityFlags {
    pub reference: Box<str>,
    pub reference_camp: Vec<f32>,
    /// cAMP modulation strictly above the activation threshold
    pub activated: Vec<bool>,
    /// cAMP modulation strictly below minus the threshold
    pub inhibited: Vec<bool>,
    pub mean_other_camp: Vec<f32>,
    /// reference² / mean_other²
    pub ratio: Vec<f32>,
    pub selective: Vec<bool>,
}

impl SelectivityFlags {
    pub fn num_selective(&self) -> usize {
        self.selective.iter().filter(|&&s| s).count()
    }

    pub fn record_annotations(&self, data: &mut ExpressionContainer) -> anyhow::Result<()> {
        let key = |field| AnnotationKey::Selectivity {
            reference: self.reference.clone(),
            field,
        };
        let ann = &mut data.annotations;
        ann.insert(
            Stage::Selectivity,
            key(SelectivityField::Activated),
            AnnotationColumn::Flag(self.activated.clone()),
        )?;
        ann.insert(
            Stage::Selectivity,
            key(SelectivityField::Inhibited),
            AnnotationColumn::Flag(self.inhibited.clone()),
        )?;
        ann.insert(
            Stage::Selectivity,
            key(SelectivityField::MeanOtherCamp),
            AnnotationColumn::Numeric(self.mean_other_camp.clone()),
        )?;
        ann.insert(
            Stage::Selectivity,
            key(SelectivityField::Ratio),
            AnnotationColumn::Numeric(self.ratio.clone()),
        )?;
        ann.insert(
            Stage::Selectivity,
            key(SelectivityField::Selective),
            AnnotationColumn::Flag(self.selective.clone()),
        )?;
        Ok(())
    }
}

/// Flag activation, inhibition and selectivity of the reference
/// compound in every cell. A zero mean of the other drugs gives an
/// infinite or NaN ratio; NaN never flags.
pub fn classify_selectivity(
    scores: &DrugResponseScores,
    params: &SelectivityParams,
) -> anyhow::Result<SelectivityFlags> {
    let reference = params.reference_compound.to_uppercase().into_boxed_str();
    let Some(r) = scores.drug_index(&reference) else {
        return Err(LentilError::configuration(format!(
            "reference compound {} is not in the affinity table",
            reference
        )));
    };

    let others: Vec<usize> = (0..scores.drugs.len()).filter(|&d| d != r).collect();
    if others.is_empty() {
        return Err(LentilError::configuration(format!(
            "selectivity of {} needs at least one other drug",
            reference
        )));
    }

    let thr = params.activation_threshold;
    let n_cells = scores.camp.nrows();

    let reference_camp: Vec<f32> = scores.camp.column(r).iter().copied().collect();
    let mean_other_camp: Vec<f32> = (0..n_cells)
        .map(|i| {
            let tot: f64 = others.iter().map(|&d| scores.camp[(i, d)] as f64).sum();
            (tot / others.len() as f64) as f32
        })
        .collect();

    let ratio: Vec<f32> = reference_camp
        .iter()
        .zip(mean_other_camp.iter())
        .map(|(&x, &m)| (x * x) / (m * m))
        .collect();

    let activated: Vec<bool> = reference_camp.iter().map(|&x| x > thr).collect();
    let inhibited: Vec<bool> = reference_camp.iter().map(|&x| x < -thr).collect();
    let selective: Vec<bool> = reference_camp
        .iter()
        .zip(ratio.iter())
        .map(|(&x, &q)| q > params.selectivity_threshold && x > 0.)
        .collect();

    let ret = SelectivityFlags {
        reference,
        reference_camp,
        activated,
        inhibited,
        mean_other_camp,
        ratio,
        selective,
    };

    info!(
        "{}: {} activated, {} inhibited, {} selective of {} cells",
        ret.reference,
        ret.activated.iter().filter(|&&x| x).count(),
        ret.inhibited.iter().filter(|&&x| x).count(),
        ret.num_selective(),
        n_cells
    );

    Ok(ret)
}

/// Marker genes of the selective cells against the rest, on the
/// processed matrix of the container
pub fn selective_markers(
    data: &ExpressionContainer,
    flags: &SelectivityFlags,
    diagnostics: &mut Vec<Diagnostic>,
) -> anyhow::Result<Vec<RankTestRow>> {
    let Some(xx) = data.scaled() else {
        return Err(LentilError::integrity(
            Stage::Selectivity,
            "marker test runs on the scaled matrix",
        ));
    };
    rank_genes_groups(xx, data.genes(), &flags.selective, diagnostics)
}
