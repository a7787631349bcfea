//! FILENAME: engine/src/error.rs
//! PURPOSE: Error taxonomy for resolution, aggregation and migration.
//! CONTEXT: None of these errors is fatal. Resolution and aggregation degrade
//! to a blank value and keep the error as a diagnostic so that one bad
//! identifier or one bad reference never aborts a bulk pass.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Dangling reference: column {0} does not exist")]
    DanglingReference(String),

    #[error("Invalid sub-field index {index} for column {column_id} ({available} sub-fields)")]
    InvalidSubFieldIndex {
        column_id: String,
        index: usize,
        available: usize,
    },

    #[error("Unknown formatter: {0}")]
    UnknownFormatter(String),

    #[error("Cycle detected: column {0} is already being computed in this pass")]
    CycleDetected(String),

    #[error("Formula evaluation failed: {0}")]
    FormulaEvaluation(String),

    #[error("Ambiguous migration match for column {column_id}: unmatched sub-fields {unmatched:?}")]
    AmbiguousMigrationMatch {
        column_id: String,
        unmatched: Vec<usize>,
    },

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Column {0} is not an aggregator")]
    NotAnAggregator(String),

    #[error("Store error: {0}")]
    Store(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
