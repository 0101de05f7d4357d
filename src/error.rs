use thiserror::Error;

use crate::types::Label;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("embedding has {actual} values, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("label {label} is outside the configured {num_classes} classes")]
    UnknownLabel { label: Label, num_classes: usize },
    #[error("classifier has no examples")]
    EmptyClassifier,
    #[error("malformed classifier graph: {0}")]
    MalformedGraph(String),
    #[error("label {label} has {count} examples, the stored graph holds at most {capacity}")]
    CapacityExceeded {
        label: Label,
        count: usize,
        capacity: usize,
    },
    #[error("classifier file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("classifier document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ClassifierError> = std::result::Result<T, E>;

pub(crate) fn malformed(msg: impl Into<String>) -> ClassifierError {
    ClassifierError::MalformedGraph(msg.into())
}
