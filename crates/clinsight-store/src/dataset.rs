//! Labelled training samples read from a resolved label table.
//!
//! Each row contributes its image path, one target and one mask per active
//! finding (from the `y_`/`m_` columns), and optionally a precomputed feature
//! vector from a `FixedSizeList<Float32>` column.

use std::path::Path;

use arrow::array::{Array, FixedSizeListArray, Float32Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use clinsight_core::findings::{mask_column, target_column};
use clinsight_core::table::{PATH_COLUMNS, get_string};
use tracing::info;

use crate::StoreError;
use crate::columnar::read_parquet;

/// In-memory labelled samples. Undefined targets are NaN and always carry mask 0.
#[derive(Debug, Clone, Default)]
pub struct LabelledDataset {
    pub labels: Vec<String>,
    pub rel_paths: Vec<String>,
    pub targets: Vec<Vec<f32>>,
    pub masks: Vec<Vec<f32>>,
    pub embeddings: Option<Vec<Vec<f32>>>,
}

impl LabelledDataset {
    /// Build from resolved batches.
    ///
    /// `labels` minus `drop_labels` become the active findings, in order. Every
    /// active finding needs both its `y_` and `m_` column.
    pub fn from_batches(
        batches: &[RecordBatch],
        labels: &[String],
        drop_labels: &[String],
        embedding_column: Option<&str>,
    ) -> Result<Self, StoreError> {
        let active: Vec<String> = labels
            .iter()
            .filter(|l| !drop_labels.contains(l))
            .cloned()
            .collect();

        let mut ds = Self {
            labels: active,
            embeddings: embedding_column.map(|_| Vec::new()),
            ..Default::default()
        };

        for batch in batches {
            ds.append_batch(batch, embedding_column)?;
        }

        Ok(ds)
    }

    /// Read a resolved Parquet table.
    pub fn load(
        path: &Path,
        labels: &[String],
        drop_labels: &[String],
        embedding_column: Option<&str>,
    ) -> Result<Self, StoreError> {
        let batches = read_parquet(path)?;
        let ds = Self::from_batches(&batches, labels, drop_labels, embedding_column)?;
        info!(
            rows = ds.len(),
            labels = ds.num_labels(),
            path = %path.display(),
            "loaded labelled dataset"
        );
        Ok(ds)
    }

    fn append_batch(
        &mut self,
        batch: &RecordBatch,
        embedding_column: Option<&str>,
    ) -> Result<(), StoreError> {
        let path_col = PATH_COLUMNS
            .iter()
            .find_map(|name| batch.column_by_name(name))
            .ok_or_else(|| StoreError::MissingColumn(PATH_COLUMNS.join(" | ")))?;

        let mut y_cols = Vec::with_capacity(self.labels.len());
        let mut m_cols = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            y_cols.push(f32_column(batch, &target_column(label))?);
            m_cols.push(f32_column(batch, &mask_column(label))?);
        }

        let embeddings = match embedding_column {
            Some(name) => Some(embedding_rows(batch, name)?),
            None => None,
        };

        for row in 0..batch.num_rows() {
            let rel = get_string(path_col.as_ref(), row).ok_or_else(|| {
                StoreError::Other(format!("null image path at row {row}"))
            })?;
            self.rel_paths.push(rel);

            let mut targets = Vec::with_capacity(self.labels.len());
            let mut masks = Vec::with_capacity(self.labels.len());
            for (y, m) in y_cols.iter().zip(&m_cols) {
                let mask = if m.is_null(row) { 0.0 } else { m.value(row) };
                let target = if y.is_null(row) { f32::NAN } else { y.value(row) };
                if mask > 0.0 && target.is_nan() {
                    return Err(StoreError::Other(format!(
                        "row {row}: observed label without a target"
                    )));
                }
                targets.push(target);
                masks.push(mask);
            }
            self.targets.push(targets);
            self.masks.push(masks);
        }

        if let (Some(all), Some(rows)) = (self.embeddings.as_mut(), embeddings) {
            all.extend(rows);
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rel_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rel_paths.is_empty()
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }
}

// ── Arrow extraction helpers ──

fn f32_column(batch: &RecordBatch, name: &str) -> Result<Float32Array, StoreError> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::MissingColumn(name.to_string()))?;
    let casted = cast(col.as_ref(), &DataType::Float32)?;
    casted
        .as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .ok_or_else(|| StoreError::ColumnType {
            column: name.to_string(),
            data_type: col.data_type().to_string(),
        })
}

/// Read a `FixedSizeList<Float32>` column into one vector per row.
fn embedding_rows(batch: &RecordBatch, name: &str) -> Result<Vec<Vec<f32>>, StoreError> {
    let col = batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::MissingColumn(name.to_string()))?;

    let type_err = || StoreError::ColumnType {
        column: name.to_string(),
        data_type: col.data_type().to_string(),
    };

    let fsl = col
        .as_any()
        .downcast_ref::<FixedSizeListArray>()
        .ok_or_else(type_err)?;
    if fsl.value_type() != DataType::Float32 {
        return Err(type_err());
    }

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if fsl.is_null(row) {
            return Err(StoreError::Other(format!(
                "null {name} at row {row}; precompute features for every image"
            )));
        }
        let value = fsl.value(row);
        let values = value
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(type_err)?;
        rows.push(values.values().to_vec());
    }
    Ok(rows)
}
