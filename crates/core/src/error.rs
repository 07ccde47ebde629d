use thiserror::Error;

use crate::event::ContractViolation;

pub type PulseResult<T> = Result<T, PulseError>;

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("Event contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("Search index error: {0}")]
    Search(String),

    #[error("Mirror store error: {0}")]
    Mirror(String),

    #[error("Shared state error: {0}")]
    SharedState(String),

    #[error("Alert sink error: {0}")]
    Alert(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Remediation error: {0}")]
    Remediation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
