//! Per-cell drug response from raw GPCR expression
//!
//! For drug d and G-protein class C the effect is
//!
//! effect(d, C) = Σ_{r ∈ C} x_r / affinity(d, r)
//!
//! over library-size normalized receptor expression x; then
//! cAMP = Gi - Gs and Ca = -Gq + offset.

use crate::annotation::*;
use crate::common::*;
use crate::config::PharmacologyParams;
use crate::error::DiagnosticKind;
use crate::expression::ExpressionContainer;
use crate::marker::RawMarkerSnapshot;
use crate::reference::{GProtein, ReferenceTables};
use rayon::prelude::*;

/// Scale each row to sum to `target_sum`; all-zero rows stay zero
pub fn normalize_total(xx: &Mat, target_sum: f32) -> Mat {
    let mut ret = xx.clone();
    for mut row in ret.row_iter_mut() {
        let tot: f32 = row.iter().sum();
        if tot > 0. {
            row *= target_sum / tot;
        }
    }
    ret
}

/// Panel receptors present in the snapshot, split by G-protein class.
/// Column indices refer to the restricted panel matrix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceptorClasses {
    pub gs: Vec<(Box<str>, usize)>,
    pub gi: Vec<(Box<str>, usize)>,
    pub gq: Vec<(Box<str>, usize)>,
}

impl ReceptorClasses {
    pub fn class(&self, g: GProtein) -> &[(Box<str>, usize)] {
        match g {
            GProtein::Gs => &self.gs,
            GProtein::Gi => &self.gi,
            GProtein::Gq => &self.gq,
        }
    }

    pub fn num_receptors(&self) -> usize {
        self.gs.len() + self.gi.len() + self.gq.len()
    }
}

/// Classify the receptors in panel order; receptors without a class
/// or without any affinity column are reported
pub fn partition_receptors(
    receptors: &[Box<str>],
    tables: &ReferenceTables,
    diagnostics: &mut Vec<Diagnostic>,
) -> ReceptorClasses {
    let mut ret = ReceptorClasses::default();
    for (k, r) in receptors.iter().enumerate() {
        if !tables.affinity.has_receptor(r) {
            diagnostics.push(Diagnostic::new(
                Stage::Pharmacology,
                DiagnosticKind::ReceptorWithoutAffinity,
                r.clone(),
                "no affinity column; contributes nothing",
            ));
        }
        match tables.receptor_types.get(r) {
            Some(GProtein::Gs) => ret.gs.push((r.clone(), k)),
            Some(GProtein::Gi) => ret.gi.push((r.clone(), k)),
            Some(GProtein::Gq) => ret.gq.push((r.clone(), k)),
            None => diagnostics.push(Diagnostic::new(
                Stage::Pharmacology,
                DiagnosticKind::UnclassifiedReceptor,
                r.clone(),
                "no G-protein type; excluded from scoring",
            )),
        }
    }
    info!(
        "receptor classes: {} Gs, {} Gi, {} Gq",
        ret.gs.len(),
        ret.gi.len(),
        ret.gq.len()
    );
    ret
}

/// cAMP and Ca modulation for every cell and drug
#[derive(Clone, Debug, PartialEq)]
pub struct DrugResponseScores {
    pub cells: Vec<Box<str>>,
    pub drugs: Vec<Box<str>>,
    /// cells × drugs
    pub camp: Mat,
    /// cells × drugs
    pub ca: Mat,
}

impl DrugResponseScores {
    pub fn drug_index(&self, drug: &str) -> Option<usize> {
        self.drugs.iter().position(|d| d.as_ref() == drug)
    }

    pub fn camp_of(&self, drug: &str) -> Option<Vec<f32>> {
        self.drug_index(drug)
            .map(|d| self.camp.column(d).iter().copied().collect())
    }

    pub fn ca_of(&self, drug: &str) -> Option<Vec<f32>> {
        self.drug_index(drug)
            .map(|d| self.ca.column(d).iter().copied().collect())
    }

    /// `cAMP_{drug}` and `Ca_{drug}` columns
    pub fn record_annotations(&self, data: &mut ExpressionContainer) -> anyhow::Result<()> {
        if data.cells() != self.cells.as_slice() {
            return Err(LentilError::integrity(
                Stage::Pharmacology,
                "drug scores and container list different cells",
            ));
        }
        for (d, drug) in self.drugs.iter().enumerate() {
            for (quantity, scores) in [
                (ResponseQuantity::CampModulation, &self.camp),
                (ResponseQuantity::CaModulation, &self.ca),
            ] {
                data.annotations.insert(
                    Stage::Pharmacology,
                    AnnotationKey::Response(ResponseKey {
                        drug: drug.clone(),
                        quantity,
                    }),
                    AnnotationColumn::Numeric(scores.column(d).iter().copied().collect()),
                )?;
            }
        }
        Ok(())
    }
}

/// Sum of `x_r / affinity(d, r)` over one class; receptors without an
/// affinity are skipped, and an empty class sums to zero
fn class_effect(
    xx: &Mat,
    cell: usize,
    members: &[(Box<str>, usize)],
    affinities: &[Option<f32>],
) -> f32 {
    members
        .iter()
        .zip(affinities.iter())
        .filter_map(|(&(_, k), a)| a.map(|a| xx[(cell, k)] / a))
        .sum()
}

/// Score every drug of the affinity table on the raw marker snapshot
pub fn score_drug_responses(
    snapshot: &RawMarkerSnapshot,
    tables: &ReferenceTables,
    params: &PharmacologyParams,
    diagnostics: &mut Vec<Diagnostic>,
) -> anyhow::Result<DrugResponseScores> {
    if !(params.target_sum > 0.) {
        return Err(LentilError::configuration(format!(
            "target_sum must be positive: {}",
            params.target_sum
        )));
    }

    let (receptors, raw) = snapshot.restrict(&params.gpcr_panel);
    if receptors.len() < params.gpcr_panel.len() {
        info!(
            "{} of {} panel receptors are present after filtering",
            receptors.len(),
            params.gpcr_panel.len()
        );
    }

    let xx = normalize_total(&raw, params.target_sum);
    let classes = partition_receptors(&receptors, tables, diagnostics);

    let n_cells = xx.nrows();
    let drugs = tables.affinity.drugs().to_vec();

    let columns: Vec<(Vec<f32>, Vec<f32>)> = (0..drugs.len())
        .into_par_iter()
        .map(|d| {
            let affinities = |g: GProtein| -> Vec<Option<f32>> {
                classes
                    .class(g)
                    .iter()
                    .map(|(r, _)| tables.affinity.affinity(d, r))
                    .collect()
            };
            let a_gs = affinities(GProtein::Gs);
            let a_gi = affinities(GProtein::Gi);
            let a_gq = affinities(GProtein::Gq);

            (0..n_cells)
                .map(|i| {
                    let gs = class_effect(&xx, i, &classes.gs, &a_gs);
                    let gi = class_effect(&xx, i, &classes.gi, &a_gi);
                    let gq = class_effect(&xx, i, &classes.gq, &a_gq);
                    (gi - gs, -gq + params.ca_offset)
                })
                .unzip()
        })
        .collect();

    let mut camp = Mat::zeros(n_cells, drugs.len());
    let mut ca = Mat::zeros(n_cells, drugs.len());
    for (d, (camp_d, ca_d)) in columns.into_iter().enumerate() {
        camp.column_mut(d).copy_from_slice(&camp_d);
        ca.column_mut(d).copy_from_slice(&ca_d);
    }

    info!(
        "scored {} drugs over {} cells with {} classified receptors",
        drugs.len(),
        n_cells,
        classes.num_receptors()
    );

    Ok(DrugResponseScores {
        cells: snapshot.cells().to_vec(),
        drugs,
        camp,
        ca,
    })
}
