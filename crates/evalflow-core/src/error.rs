//! Error types shared by every EvalFlow crate.

use thiserror::Error;

use crate::types::EvalState;

#[derive(Error, Debug)]
pub enum EvalFlowError {
    /// Caller passed a value the operation can never accept (empty lock name, reminder job
    /// handed to generic reconciliation, unparsable action name).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Programming error: a transition that must never be requested.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("State {0} has no position in the lifecycle order")]
    IncomparableState(EvalState),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalFlowError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EvalFlowError>;
