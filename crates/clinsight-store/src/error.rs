use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("parquet file not found: {0}")]
    ParquetNotFound(PathBuf),

    #[error("csv file not found: {0}")]
    CsvNotFound(PathBuf),

    /// An image path that resolves under none of the known disk layouts.
    #[error("missing image for rel_path={rel_path:?} -> {attempted:?} (searched: {roots:?})")]
    MissingAsset {
        rel_path: String,
        attempted: PathBuf,
        roots: Vec<PathBuf>,
    },

    #[error("missing column {0:?}")]
    MissingColumn(String),

    #[error("column {column:?} has unexpected type {data_type}")]
    ColumnType { column: String, data_type: String },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
