//! Error taxonomy of the pipeline
//!
//! Fatal conditions surface as a [`LentilError`] wrapped in
//! `anyhow::Error`, so callers can `downcast_ref` to tell the kinds
//! apart. Conditions the pipeline can work around become
//! [`Diagnostic`] entries carried along with the result.

use std::fmt;

/// Pipeline stage in which a condition was raised
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Load,
    Qc,
    Regression,
    Pca,
    Embedding,
    Pharmacology,
    Selectivity,
    Output,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Qc => "qc",
            Stage::Regression => "regression",
            Stage::Pca => "pca",
            Stage::Embedding => "embedding",
            Stage::Pharmacology => "pharmacology",
            Stage::Selectivity => "selectivity",
            Stage::Output => "output",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LentilError {
    /// invalid parameters or reference tables
    #[error("configuration error: {0}")]
    Configuration(String),

    /// matrix and annotations fell out of alignment, or the data
    /// violate an assumption of a stage
    #[error("data integrity error at the {stage} stage: {message}")]
    DataIntegrity { stage: Stage, message: String },

    #[error("insufficient samples at the {stage} stage: requested {requested}, available {available}")]
    InsufficientSamples {
        stage: Stage,
        requested: usize,
        available: usize,
    },
}

impl LentilError {
    pub fn configuration(message: impl Into<String>) -> anyhow::Error {
        LentilError::Configuration(message.into()).into()
    }

    pub fn integrity(stage: Stage, message: impl Into<String>) -> anyhow::Error {
        LentilError::DataIntegrity {
            stage,
            message: message.into(),
        }
        .into()
    }

    pub fn insufficient(stage: Stage, requested: usize, available: usize) -> anyhow::Error {
        LentilError::InsufficientSamples {
            stage,
            requested,
            available,
        }
        .into()
    }
}

/// What kind of recoverable condition was met
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// a requested marker gene is not in the filtered matrix
    AbsentMarker,
    /// a panel receptor has no G-protein class
    UnclassifiedReceptor,
    /// a panel receptor has no affinity column
    ReceptorWithoutAffinity,
    /// a rank test group has no cells
    EmptyTestGroup,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::AbsentMarker => "absent_marker",
            DiagnosticKind::UnclassifiedReceptor => "unclassified_receptor",
            DiagnosticKind::ReceptorWithoutAffinity => "receptor_without_affinity",
            DiagnosticKind::EmptyTestGroup => "empty_test_group",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub stage: Stage,
    pub kind: DiagnosticKind,
    pub subject: Box<str>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        stage: Stage,
        kind: DiagnosticKind,
        subject: impl Into<Box<str>>,
        message: impl Into<String>,
    ) -> Self {
        let ret = Self {
            stage,
            kind,
            subject: subject.into(),
            message: message.into(),
        };
        log::warn!("[{}] {}: {}", ret.stage, ret.subject, ret.message);
        ret
    }

    /// tab-separated `stage kind subject message`
    pub fn to_tsv_line(&self) -> Box<str> {
        format!(
            "{}\t{}\t{}\t{}",
            self.stage, self.kind, self.subject, self.message
        )
        .into_boxed_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_survive_anyhow_round_trip() {
        let err = LentilError::insufficient(Stage::Pca, 50, 12);
        let kind = err.downcast_ref::<LentilError>().unwrap();
        assert_eq!(
            kind,
            &LentilError::InsufficientSamples {
                stage: Stage::Pca,
                requested: 50,
                available: 12
            }
        );
        assert!(err.to_string().contains("pca"));
    }
}
