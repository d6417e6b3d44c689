//! Parquet read/write for label tables.

use std::fs::File;
use std::path::Path;

use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::info;

use crate::StoreError;

/// Read every record batch of a Parquet file.
pub fn read_parquet(path: &Path) -> Result<Vec<RecordBatch>, StoreError> {
    if !path.exists() {
        return Err(StoreError::ParquetNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    info!(rows, path = %path.display(), "read parquet");
    Ok(batches)
}

/// Write batches to a Parquet file, creating parent directories.
///
/// All batches must share a schema. Writing zero batches is an error since
/// there is no schema to write.
pub fn write_parquet(path: &Path, batches: &[RecordBatch]) -> Result<(), StoreError> {
    let first = batches
        .first()
        .ok_or_else(|| StoreError::Other(format!("no batches to write to {}", path.display())))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, first.schema(), None)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.close()?;

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    info!(rows, path = %path.display(), "wrote parquet");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("rel_path", DataType::Utf8, false),
            Field::new("y_Edema", DataType::Float32, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Float32Array::from(vec![Some(1.0), None])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("labels.parquet");
        write_parquet(&path, &[batch(), batch()]).unwrap();

        let batches = read_parquet(&path).unwrap();
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 4);
        let y = batches[0]
            .column_by_name("y_Edema")
            .unwrap()
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap();
        assert!(y.is_null(1));
    }

    #[test]
    fn read_missing_file_errors() {
        let result = read_parquet(Path::new("/nonexistent/labels.parquet"));
        assert!(matches!(result, Err(StoreError::ParquetNotFound(_))));
    }

    #[test]
    fn write_nothing_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = write_parquet(&dir.path().join("empty.parquet"), &[]);
        assert!(result.is_err());
    }
}
