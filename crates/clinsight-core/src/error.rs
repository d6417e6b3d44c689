use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    /// An enumerated policy key holds a value outside its allowed set.
    #[error("invalid policy config: {key} = {value:?} (expected one of: {expected})")]
    Config {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("invalid policy config: uncertain_soft_value = {0} (must be within [0, 1])")]
    SoftValueOutOfRange(f32),

    #[error("unknown policy variant {name:?} (available: {available})")]
    UnknownVariant { name: String, available: String },

    #[error("policy document {path}: {source}")]
    Document {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing column {0:?}")]
    MissingColumn(String),

    #[error("null identifier in column {column:?} at row {row}")]
    NullIdentifier { column: String, row: usize },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
