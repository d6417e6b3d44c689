//! CheXpert index CSV ingest.
//!
//! The index has one row per image with a `Path` such as
//! `CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg`, a few
//! demographic columns and one three-valued column per finding (blank when
//! unmentioned). Ingest keeps every column, coerces finding columns to Float32
//! and adds `patient_id`, `study_id` and `rel_path` parsed from `Path`.

use std::fs::File;
use std::io::Seek;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::compute::{CastOptions, cast_with_options};
use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clinsight_core::table::get_string;
use tracing::info;

use crate::StoreError;

const PATH_COLUMN: &str = "Path";
const DERIVED_COLUMNS: [&str; 3] = ["patient_id", "study_id", "rel_path"];

/// Identifiers parsed from a CheXpert image path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathIds {
    pub patient_id: Option<String>,
    pub study_id: Option<String>,
    pub rel_path: String,
}

/// Split `<dataset>/<split>/<patient>/<study>/<view>` into its identifiers.
pub fn parse_ids_from_path(path: &str) -> PathIds {
    let parts: Vec<&str> = path.split('/').collect();
    PathIds {
        patient_id: parts.get(2).map(|s| s.to_string()),
        study_id: parts.get(3).map(|s| s.to_string()),
        rel_path: parts.join("/"),
    }
}

/// Read the CheXpert index CSV into Arrow batches ready to be written as the base table.
pub fn read_chexpert_csv(
    path: &Path,
    label_cols: &[String],
) -> Result<Vec<RecordBatch>, StoreError> {
    if !path.exists() {
        return Err(StoreError::CsvNotFound(path.to_path_buf()));
    }

    let mut file = File::open(path)?;
    let (inferred, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut file, None)?;
    file.rewind()?;

    // Finding columns are read as text and coerced afterwards; an unparsable cell
    // becomes null instead of failing the whole file.
    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|f| {
            if label_cols.iter().any(|l| l == f.name()) {
                Field::new(f.name(), DataType::Utf8, true)
            } else {
                f.as_ref().clone().with_nullable(true)
            }
        })
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let reader = ReaderBuilder::new(schema).with_header(true).build(file)?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(with_chexpert_columns(&batch?, label_cols)?);
    }

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    info!(rows, path = %path.display(), "read chexpert index");
    Ok(batches)
}

/// Coerce finding columns to Float32 and append the parsed id columns.
fn with_chexpert_columns(
    batch: &RecordBatch,
    label_cols: &[String],
) -> Result<RecordBatch, StoreError> {
    let path_col = batch
        .column_by_name(PATH_COLUMN)
        .ok_or_else(|| StoreError::MissingColumn(PATH_COLUMN.to_string()))?;

    let coerce = CastOptions {
        safe: true,
        ..Default::default()
    };
    let schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len() + 3);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len() + 3);

    for (field, col) in schema.fields().iter().zip(batch.columns()) {
        if DERIVED_COLUMNS.contains(&field.name().as_str()) {
            continue;
        }
        if label_cols.iter().any(|l| l == field.name()) {
            fields.push(Field::new(field.name(), DataType::Float32, true));
            columns.push(cast_with_options(col.as_ref(), &DataType::Float32, &coerce)?);
        } else {
            fields.push(field.as_ref().clone());
            columns.push(col.clone());
        }
    }

    let ids: Vec<Option<PathIds>> = (0..batch.num_rows())
        .map(|row| get_string(path_col.as_ref(), row).map(|p| parse_ids_from_path(&p)))
        .collect();

    let patient: StringArray = ids
        .iter()
        .map(|i| i.as_ref().and_then(|i| i.patient_id.clone()))
        .collect();
    let study: StringArray = ids
        .iter()
        .map(|i| i.as_ref().and_then(|i| i.study_id.clone()))
        .collect();
    let rel: StringArray = ids
        .iter()
        .map(|i| i.as_ref().map(|i| i.rel_path.clone()))
        .collect();

    for (name, arr) in DERIVED_COLUMNS.iter().zip([patient, study, rel]) {
        fields.push(Field::new(*name, DataType::Utf8, true));
        columns.push(Arc::new(arr));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float32Array};

    const CSV: &str = "\
Path,Sex,Age,Frontal/Lateral,AP/PA,No Finding,Edema,Cardiomegaly
CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg,Female,68,Frontal,AP,1.0,,
CheXpert-v1.0-small/train/patient00002/study2/view1_frontal.jpg,Female,87,Frontal,AP,,-1.0,0.0
CheXpert-v1.0-small/train/patient00002/study1/view2_lateral.jpg,Female,83,Lateral,,,1.0,
";

    fn labels() -> Vec<String> {
        ["No Finding", "Edema", "Cardiomegaly"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn parses_ids() {
        let ids = parse_ids_from_path("CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg");
        assert_eq!(ids.patient_id.as_deref(), Some("patient00001"));
        assert_eq!(ids.study_id.as_deref(), Some("study1"));
        assert_eq!(
            ids.rel_path,
            "CheXpert-v1.0-small/train/patient00001/study1/view1_frontal.jpg"
        );
    }

    #[test]
    fn short_path_has_no_ids() {
        let ids = parse_ids_from_path("view1.jpg");
        assert_eq!(ids.patient_id, None);
        assert_eq!(ids.study_id, None);
        assert_eq!(ids.rel_path, "view1.jpg");
    }

    #[test]
    fn reads_index_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        std::fs::write(&path, CSV).unwrap();

        let batches = read_chexpert_csv(&path, &labels()).unwrap();
        let batch = &batches[0];
        assert_eq!(batch.num_rows(), 3);

        let edema = batch
            .column_by_name("Edema")
            .unwrap()
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap();
        assert!(edema.is_null(0));
        assert_eq!(edema.value(1), -1.0);
        assert_eq!(edema.value(2), 1.0);

        // Cardiomegaly is blank in the first row; still numeric.
        let cardio = batch.column_by_name("Cardiomegaly").unwrap();
        assert_eq!(cardio.data_type(), &DataType::Float32);

        let patient = batch.column_by_name("patient_id").unwrap();
        assert_eq!(get_string(patient.as_ref(), 1).as_deref(), Some("patient00002"));
        assert!(batch.column_by_name("rel_path").is_some());
        assert!(batch.column_by_name("Sex").is_some());
    }

    #[test]
    fn unparsable_label_becomes_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.csv");
        std::fs::write(
            &path,
            "Path,Edema\na/train/p1/s1/v1.jpg,1.0\na/train/p2/s1/v1.jpg,unsure\na/train/p3/s1/v1.jpg,\n",
        )
        .unwrap();

        let batches = read_chexpert_csv(&path, &["Edema".to_string()]).unwrap();
        let edema = batches[0]
            .column_by_name("Edema")
            .unwrap()
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap();
        assert_eq!(edema.value(0), 1.0);
        assert!(edema.is_null(1));
        assert!(edema.is_null(2));
    }

    #[test]
    fn missing_csv_errors() {
        let result = read_chexpert_csv(Path::new("/nonexistent/train.csv"), &labels());
        assert!(matches!(result, Err(StoreError::CsvNotFound(_))));
    }
}
