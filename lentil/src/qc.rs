//! Quality control of cells and genes by detected-gene counts

use crate::annotation::*;
use crate::common::*;
use crate::config::QcParams;
use crate::error::DiagnosticKind;
use crate::expression::ExpressionContainer;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QcReport {
    pub cells_before: usize,
    pub genes_before: usize,
    pub cells_after: usize,
    pub genes_after: usize,
    /// filtering rounds until nothing changed
    pub rounds: usize,
}

/// Numbers of detected (strictly positive) genes per cell and cells
/// per gene
pub fn detection_counts(counts: &CsrMat) -> (Vec<usize>, Vec<usize>) {
    let mut per_gene = vec![0usize; counts.ncols()];
    let per_cell = counts
        .row_iter()
        .map(|row| {
            let mut n = 0;
            for (&j, &x) in row.col_indices().iter().zip(row.values()) {
                if x > 0. {
                    n += 1;
                    per_gene[j] += 1;
                }
            }
            n
        })
        .collect();
    (per_cell, per_gene)
}

/// Keep cells with `min_genes <= detected genes <= max_genes` and
/// genes detected in at least `min_cells` cells.
///
/// Removing genes can push a cell below `min_genes` and removing
/// cells can push a gene below `min_cells`, so both filters repeat
/// until neither removes anything. The surviving cells and genes then
/// satisfy both bounds at once.
pub fn filter_cells_and_genes(
    data: ExpressionContainer,
    params: &QcParams,
) -> anyhow::Result<(ExpressionContainer, QcReport)> {
    let mut report = QcReport {
        cells_before: data.num_cells(),
        genes_before: data.num_genes(),
        ..Default::default()
    };

    let mut data = data;

    loop {
        let Some(counts) = data.counts() else {
            return Err(LentilError::integrity(
                Stage::Qc,
                "quality control needs raw counts",
            ));
        };
        report.rounds += 1;

        let (per_cell, _) = detection_counts(counts);
        let keep_cells: Vec<usize> = per_cell
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n >= params.min_genes_per_cell && n <= params.max_genes_per_cell)
            .map(|(i, _)| i)
            .collect();
        let cells_changed = keep_cells.len() < data.num_cells();
        if cells_changed {
            info!(
                "round {}: removing {} of {} cells outside [{}, {}] detected genes",
                report.rounds,
                data.num_cells() - keep_cells.len(),
                data.num_cells(),
                params.min_genes_per_cell,
                params.max_genes_per_cell
            );
            data = data.select_cells(&keep_cells, Stage::Qc)?;
        }

        let Some(counts) = data.counts() else {
            return Err(LentilError::integrity(Stage::Qc, "counts vanished"));
        };
        let (_, per_gene) = detection_counts(counts);
        let keep_genes: Vec<usize> = per_gene
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n >= params.min_cells_per_gene)
            .map(|(j, _)| j)
            .collect();
        let genes_changed = keep_genes.len() < data.num_genes();
        if genes_changed {
            info!(
                "round {}: removing {} of {} genes detected in < {} cells",
                report.rounds,
                data.num_genes() - keep_genes.len(),
                data.num_genes(),
                params.min_cells_per_gene
            );
            data = data.select_genes(&keep_genes, Stage::Qc)?;
        }

        if !cells_changed && !genes_changed {
            break;
        }
    }

    report.cells_after = data.num_cells();
    report.genes_after = data.num_genes();

    info!(
        "QC kept {} / {} cells and {} / {} genes",
        report.cells_after, report.cells_before, report.genes_after, report.genes_before
    );

    if data.num_cells() == 0 || data.num_genes() == 0 {
        return Err(LentilError::insufficient(
            Stage::Qc,
            1,
            data.num_cells().min(data.num_genes()),
        ));
    }

    let (per_cell, _) = match data.counts() {
        Some(counts) => detection_counts(counts),
        None => return Err(LentilError::integrity(Stage::Qc, "counts vanished")),
    };
    data.annotations.insert(
        Stage::Qc,
        AnnotationKey::Qc(QcMetric::GenesDetected),
        AnnotationColumn::Numeric(per_cell.into_iter().map(|n| n as f32).collect()),
    )?;

    Ok((data, report))
}

/// Whether a requested marker survived filtering
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerLookup {
    Present { gene: Box<str>, column: usize },
    Absent { gene: Box<str> },
}

impl MarkerLookup {
    pub fn gene(&self) -> &str {
        match self {
            MarkerLookup::Present { gene, .. } | MarkerLookup::Absent { gene } => gene,
        }
    }
}

/// Look up each marker among the retained genes; every absent marker
/// adds a diagnostic
pub fn lookup_markers(
    data: &ExpressionContainer,
    markers: &[Box<str>],
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<MarkerLookup> {
    markers
        .iter()
        .map(|m| {
            let gene = m.to_uppercase().into_boxed_str();
            match data.gene_position(&gene) {
                Some(column) => MarkerLookup::Present { gene, column },
                None => {
                    diagnostics.push(Diagnostic::new(
                        Stage::Qc,
                        DiagnosticKind::AbsentMarker,
                        gene.clone(),
                        "not among the retained genes; excluded from marker-dependent steps",
                    ));
                    MarkerLookup::Absent { gene }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("{}{}", prefix, i).into_boxed_str()).collect()
    }

    #[test]
    fn four_cells_three_genes_drop_rare_gene() {
        // gene 2 is detected in one cell only
        let triplets = vec![
            (0, 0, 1.),
            (0, 1, 2.),
            (1, 0, 3.),
            (1, 1, 1.),
            (2, 0, 1.),
            (2, 1, 1.),
            (2, 2, 4.),
            (3, 0, 2.),
            (3, 1, 5.),
        ];
        let data =
            ExpressionContainer::from_triplets(names("c", 4), names("G", 3), &triplets).unwrap();
        let params = QcParams {
            min_genes_per_cell: 1,
            max_genes_per_cell: 10,
            min_cells_per_gene: 2,
        };
        let (data, report) = filter_cells_and_genes(data, &params).unwrap();
        assert_eq!((data.num_cells(), data.num_genes()), (4, 2));
        assert_eq!(data.genes(), &["G0".into(), Box::<str>::from("G1")]);
        assert_eq!(data.cells(), names("c", 4).as_slice());
        assert_eq!(report.cells_after, 4);
    }

    #[test]
    fn bounds_hold_after_cascading_removals() {
        // removing cell 3 (too many genes) leaves genes 2 and 3 in one
        // cell each, and removing those genes leaves cells 2 and 4 with
        // a single detected gene
        let triplets = vec![
            (0, 0, 1.),
            (0, 1, 1.),
            (1, 0, 1.),
            (1, 1, 1.),
            (2, 0, 1.),
            (2, 2, 1.),
            (3, 0, 1.),
            (3, 1, 1.),
            (3, 2, 1.),
            (3, 3, 1.),
            (4, 1, 1.),
            (4, 3, 1.),
            (4, 2, 0.),
        ];
        let data =
            ExpressionContainer::from_triplets(names("c", 5), names("G", 4), &triplets).unwrap();
        let params = QcParams {
            min_genes_per_cell: 2,
            max_genes_per_cell: 3,
            min_cells_per_gene: 2,
        };
        let (data, report) = filter_cells_and_genes(data, &params).unwrap();
        assert_eq!(report.rounds, 3);

        let (per_cell, per_gene) = detection_counts(data.counts().unwrap());
        assert!(per_cell
            .iter()
            .all(|&n| n >= params.min_genes_per_cell && n <= params.max_genes_per_cell));
        assert!(per_gene.iter().all(|&n| n >= params.min_cells_per_gene));
        assert_eq!(data.cells(), &["c0".into(), Box::<str>::from("c1")]);
    }

    #[test]
    fn absent_markers_become_diagnostics() {
        let data = ExpressionContainer::from_triplets(
            names("c", 1),
            vec!["Snap25".into()],
            &[(0, 0, 1.)],
        )
        .unwrap();
        let mut diagnostics = vec![];
        let found = lookup_markers(&data, &["SNAP25".into(), "GAD1".into()], &mut diagnostics);
        assert_eq!(
            found,
            vec![
                MarkerLookup::Present {
                    gene: "SNAP25".into(),
                    column: 0
                },
                MarkerLookup::Absent { gene: "GAD1".into() }
            ]
        );
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::AbsentMarker);
    }
}
