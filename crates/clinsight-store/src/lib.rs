//! Storage layer: Parquet label tables, CheXpert CSV ingest, image path resolution.

mod error;
pub use error::StoreError;

pub mod assets;
pub mod columnar;
pub mod dataset;
pub mod ingest;

pub use assets::ImageLocator;
pub use columnar::{read_parquet, write_parquet};
pub use dataset::LabelledDataset;
pub use ingest::{PathIds, parse_ids_from_path, read_chexpert_csv};
