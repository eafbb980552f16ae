//! Per-cell annotation columns keyed by structured names
//!
//! Column names are only rendered to strings when written out; inside
//! the pipeline a column is found by its [`AnnotationKey`].

use crate::common::*;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QcMetric {
    GenesDetected,
    TotalCounts,
    MitoPercent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterAlgorithm {
    KMeans,
    Louvain,
    Leiden,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseQuantity {
    CampModulation,
    CaModulation,
}

/// A score column of one drug
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseKey {
    pub drug: Box<str>,
    pub quantity: ResponseQuantity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SelectivityField {
    Activated,
    Inhibited,
    MeanOtherCamp,
    Ratio,
    Selective,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnnotationKey {
    Label,
    Qc(QcMetric),
    RawMarker(Box<str>),
    Cluster(ClusterAlgorithm),
    Response(ResponseKey),
    Selectivity {
        reference: Box<str>,
        field: SelectivityField,
    },
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationKey::Label => write!(f, "label"),
            AnnotationKey::Qc(QcMetric::GenesDetected) => write!(f, "n_genes"),
            AnnotationKey::Qc(QcMetric::TotalCounts) => write!(f, "n_counts"),
            AnnotationKey::Qc(QcMetric::MitoPercent) => write!(f, "percent_mito"),
            AnnotationKey::RawMarker(gene) => write!(f, "{}_raw", gene),
            AnnotationKey::Cluster(ClusterAlgorithm::KMeans) => write!(f, "kmeans"),
            AnnotationKey::Cluster(ClusterAlgorithm::Louvain) => write!(f, "louvain"),
            AnnotationKey::Cluster(ClusterAlgorithm::Leiden) => write!(f, "leiden"),
            AnnotationKey::Response(ResponseKey { drug, quantity }) => match quantity {
                ResponseQuantity::CampModulation => write!(f, "cAMP_{}", drug),
                ResponseQuantity::CaModulation => write!(f, "Ca_{}", drug),
            },
            AnnotationKey::Selectivity { reference, field } => match field {
                SelectivityField::Activated => write!(f, "{}_activated", reference),
                SelectivityField::Inhibited => write!(f, "{}_inhibited", reference),
                SelectivityField::MeanOtherCamp => {
                    write!(f, "cAMP_mean_other_than_{}", reference)
                }
                SelectivityField::Ratio => write!(f, "cAMP_{}_selectivity", reference),
                SelectivityField::Selective => write!(f, "{}_selective", reference),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AnnotationColumn {
    Numeric(Vec<f32>),
    Categorical(Vec<Box<str>>),
    Flag(Vec<bool>),
}

impl AnnotationColumn {
    pub fn len(&self) -> usize {
        match self {
            AnnotationColumn::Numeric(x) => x.len(),
            AnnotationColumn::Categorical(x) => x.len(),
            AnnotationColumn::Flag(x) => x.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            AnnotationColumn::Numeric(x) => {
                AnnotationColumn::Numeric(rows.iter().map(|&i| x[i]).collect())
            }
            AnnotationColumn::Categorical(x) => {
                AnnotationColumn::Categorical(rows.iter().map(|&i| x[i].clone()).collect())
            }
            AnnotationColumn::Flag(x) => AnnotationColumn::Flag(rows.iter().map(|&i| x[i]).collect()),
        }
    }
}

/// Annotation columns of equal length, one value per cell
#[derive(Clone, Debug, Default)]
pub struct CellAnnotations {
    ncells: usize,
    columns: BTreeMap<AnnotationKey, AnnotationColumn>,
}

impl CellAnnotations {
    pub fn new(ncells: usize) -> Self {
        Self {
            ncells,
            columns: BTreeMap::new(),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.ncells
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Add or replace a column; its length must match the cells
    pub fn insert(
        &mut self,
        stage: Stage,
        key: AnnotationKey,
        column: AnnotationColumn,
    ) -> anyhow::Result<()> {
        if column.len() != self.ncells {
            return Err(LentilError::integrity(
                stage,
                format!(
                    "annotation {} has {} values for {} cells",
                    key,
                    column.len(),
                    self.ncells
                ),
            ));
        }
        self.columns.insert(key, column);
        Ok(())
    }

    pub fn get(&self, key: &AnnotationKey) -> Option<&AnnotationColumn> {
        self.columns.get(key)
    }

    pub fn numeric(&self, key: &AnnotationKey) -> Option<&[f32]> {
        match self.columns.get(key) {
            Some(AnnotationColumn::Numeric(x)) => Some(x),
            _ => None,
        }
    }

    pub fn flags(&self, key: &AnnotationKey) -> Option<&[bool]> {
        match self.columns.get(key) {
            Some(AnnotationColumn::Flag(x)) => Some(x),
            _ => None,
        }
    }

    pub fn categorical(&self, key: &AnnotationKey) -> Option<&[Box<str>]> {
        match self.columns.get(key) {
            Some(AnnotationColumn::Categorical(x)) => Some(x),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AnnotationKey, &AnnotationColumn)> {
        self.columns.iter()
    }

    /// Keep the given rows, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            ncells: rows.len(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v.select(rows)))
                .collect(),
        }
    }

    pub fn check_integrity(&self, stage: Stage) -> anyhow::Result<()> {
        for (key, column) in self.columns.iter() {
            if column.len() != self.ncells {
                return Err(LentilError::integrity(
                    stage,
                    format!(
                        "annotation {} drifted to {} values for {} cells",
                        key,
                        column.len(),
                        self.ncells
                    ),
                ));
            }
        }
        Ok(())
    }
}
