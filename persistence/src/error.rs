//! FILENAME: persistence/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported schema version: {0}")]
    UnsupportedVersion(u64),

    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

impl PersistenceError {
    pub(crate) fn invalid(id: &str, reason: impl Into<String>) -> Self {
        PersistenceError::InvalidRecord {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}
