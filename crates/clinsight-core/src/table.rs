//! Arrow conversion for raw and resolved label tables.
//!
//! Raw tables carry one row per image: an identifier column (`rel_path`, or the
//! CheXpert index's `Path`) and one numeric-or-null column per finding. Resolved
//! tables keep every raw column and append `y_<finding>` (Float32, null when
//! undefined) and `m_<finding>` (Int8, 0/1) pairs.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float32Array, Int8Array, LargeStringArray, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::PolicyError;
use crate::findings::{mask_column, target_column};
use crate::resolve::{LabelResolver, RawLabelRecord, ResolvedRecord};

/// Identifier columns, in preference order.
pub const PATH_COLUMNS: &[&str] = &["rel_path", "Path"];

/// Extract raw label records from a batch.
///
/// Label columns may be any type castable to Float32 (unparsable strings become
/// missing). Every label column must be present.
pub fn raw_records_from_batch(
    batch: &RecordBatch,
    label_cols: &[String],
) -> Result<Vec<RawLabelRecord>, PolicyError> {
    let (path_name, path_col) = PATH_COLUMNS
        .iter()
        .find_map(|name| batch.column_by_name(name).map(|c| (*name, c)))
        .ok_or_else(|| PolicyError::MissingColumn(PATH_COLUMNS.join(" | ")))?;

    let mut label_arrays: Vec<(&str, Float32Array)> = Vec::with_capacity(label_cols.len());
    for label in label_cols {
        let col = batch
            .column_by_name(label)
            .ok_or_else(|| PolicyError::MissingColumn(label.clone()))?;
        label_arrays.push((label.as_str(), as_f32(col)?));
    }

    let mut records = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let path = get_string(path_col.as_ref(), row).ok_or_else(|| PolicyError::NullIdentifier {
            column: path_name.to_string(),
            row,
        })?;

        let mut record = RawLabelRecord::new(path);
        for (label, values) in &label_arrays {
            let value = (!values.is_null(row)).then(|| values.value(row));
            record.values.insert(label.to_string(), value);
        }
        records.push(record);
    }

    Ok(records)
}

/// Append resolved `y_`/`m_` columns to the raw batch they were resolved from.
///
/// Existing `y_*`/`m_*` columns from an earlier policy are replaced, so a
/// resolved table can be re-resolved under a different variant.
pub fn resolved_batch(
    source: &RecordBatch,
    resolved: &[ResolvedRecord],
    findings: &[String],
) -> Result<RecordBatch, PolicyError> {
    let source_schema = source.schema();
    let mut fields: Vec<Field> = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();

    for (field, col) in source_schema.fields().iter().zip(source.columns()) {
        if field.name().starts_with("y_") || field.name().starts_with("m_") {
            continue;
        }
        fields.push(field.as_ref().clone());
        columns.push(col.clone());
    }

    for finding in findings {
        let targets: Float32Array = resolved
            .iter()
            .map(|r| r.get(finding).and_then(|l| l.target()))
            .collect();
        let masks: Int8Array = resolved
            .iter()
            .map(|r| Some(r.get(finding).map(|l| l.mask() as i8).unwrap_or(0)))
            .collect();

        fields.push(Field::new(target_column(finding), DataType::Float32, true));
        columns.push(Arc::new(targets));
        fields.push(Field::new(mask_column(finding), DataType::Int8, false));
        columns.push(Arc::new(masks));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

impl LabelResolver {
    /// Resolve every row of a raw batch and materialize the `y_`/`m_` columns.
    ///
    /// The resolved records are returned alongside for semantic checks.
    pub fn resolve_batch(&self, batch: &RecordBatch) -> Result<(RecordBatch, Vec<ResolvedRecord>), PolicyError> {
        let raws = raw_records_from_batch(batch, self.label_cols())?;
        let resolved = self.resolve_all(&raws);
        debug!(rows = resolved.len(), policy = %self.config().tag(), "resolved batch");
        let out = resolved_batch(batch, &resolved, &self.output_findings())?;
        Ok((out, resolved))
    }
}

// ── Arrow extraction helpers ──

fn as_f32(col: &ArrayRef) -> Result<Float32Array, PolicyError> {
    let casted = cast(col.as_ref(), &DataType::Float32)?;
    Ok(casted
        .as_any()
        .downcast_ref::<Float32Array>()
        .cloned()
        .unwrap_or_else(|| Float32Array::new_null(col.len())))
}

/// Extract a string value from an Arrow array (handles Utf8 and LargeUtf8).
pub fn get_string(col: &dyn Array, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    col.as_any()
        .downcast_ref::<StringArray>()
        .map(|arr| arr.value(row).to_string())
        .or_else(|| {
            col.as_any()
                .downcast_ref::<LargeStringArray>()
                .map(|arr| arr.value(row).to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::NO_FINDING;
    use crate::policy::{NoFindingMode, NullHandling, PolicyConfig, UncertainHandling};
    use arrow::array::Float64Array;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Raw batch with `rel_path`, `No Finding` and `Edema` (Float64, nullable).
    fn raw_batch(paths: &[&str], nf: &[Option<f64>], edema: &[Option<f64>]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("rel_path", DataType::Utf8, false),
            Field::new("No Finding", DataType::Float64, true),
            Field::new("Edema", DataType::Float64, true),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(paths.to_vec())),
                Arc::new(Float64Array::from(nf.to_vec())),
                Arc::new(Float64Array::from(edema.to_vec())),
            ],
        )
        .unwrap()
    }

    fn f32_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a Float32Array {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<Float32Array>()
            .unwrap()
    }

    fn i8_col<'a>(batch: &'a RecordBatch, name: &str) -> &'a Int8Array {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<Int8Array>()
            .unwrap()
    }

    #[test]
    fn extracts_raw_values_and_nulls() {
        let batch = raw_batch(&["a", "b"], &[Some(1.0), None], &[Some(-1.0), Some(0.0)]);
        let raws = raw_records_from_batch(&batch, &cols(&["No Finding", "Edema"])).unwrap();
        assert_eq!(raws.len(), 2);
        assert_eq!(raws[0].path, "a");
        assert_eq!(raws[0].value(NO_FINDING), Some(1.0));
        assert_eq!(raws[0].value("Edema"), Some(-1.0));
        assert_eq!(raws[1].value(NO_FINDING), None);
    }

    #[test]
    fn absent_label_column_errors() {
        let batch = raw_batch(&["a"], &[Some(1.0)], &[None]);
        let err = raw_records_from_batch(&batch, &cols(&["Edema", "Fracture"])).unwrap_err();
        assert!(matches!(err, PolicyError::MissingColumn(ref c) if c == "Fracture"));
    }

    #[test]
    fn resolve_batch_rejects_misspelled_label() {
        let batch = raw_batch(&["a"], &[None], &[Some(0.0)]);
        let config = PolicyConfig {
            null_handling: NullHandling::Negative,
            uncertain_handling: UncertainHandling::Zero,
            uncertain_soft_value: 0.5,
            no_finding: NoFindingMode::KeepOriginal,
        };
        let resolver = LabelResolver::new(cols(&["No Finding", "Edemma"]), config);
        assert!(matches!(
            resolver.resolve_batch(&batch),
            Err(PolicyError::MissingColumn(_))
        ));
    }

    #[test]
    fn string_label_columns_are_coerced() {
        let schema = Schema::new(vec![
            Field::new("Path", DataType::Utf8, false),
            Field::new("Edema", DataType::Utf8, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from(vec!["a", "b", "c"])),
                Arc::new(StringArray::from(vec![Some("1.0"), Some(""), None])),
            ],
        )
        .unwrap();
        let raws = raw_records_from_batch(&batch, &cols(&["Edema"])).unwrap();
        assert_eq!(raws[0].value("Edema"), Some(1.0));
        assert_eq!(raws[1].value("Edema"), None);
        assert_eq!(raws[2].value("Edema"), None);
    }

    #[test]
    fn missing_path_column_errors() {
        let schema = Schema::new(vec![Field::new("Edema", DataType::Float64, true)]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![Arc::new(Float64Array::from(vec![Some(1.0)]))],
        )
        .unwrap();
        let err = raw_records_from_batch(&batch, &cols(&["Edema"])).unwrap_err();
        assert!(matches!(err, PolicyError::MissingColumn(_)));
    }

    #[test]
    fn resolve_batch_appends_target_and_mask_columns() {
        let batch = raw_batch(
            &["a", "b", "c"],
            &[None, None, None],
            &[Some(1.0), Some(-1.0), None],
        );
        let config = PolicyConfig {
            null_handling: NullHandling::Missing,
            uncertain_handling: UncertainHandling::Ignore,
            uncertain_soft_value: 0.5,
            no_finding: NoFindingMode::Derive {
                require_observed_other_labels: 1,
            },
        };
        let resolver = LabelResolver::new(cols(&["No Finding", "Edema"]), config);
        let (out, _) = resolver.resolve_batch(&batch).unwrap();

        // Raw columns kept, two pairs appended.
        assert_eq!(out.num_columns(), 3 + 4);
        assert!(out.column_by_name("rel_path").is_some());

        let y = f32_col(&out, "y_Edema");
        let m = i8_col(&out, "m_Edema");
        assert_eq!(y.value(0), 1.0);
        assert_eq!(m.value(0), 1);
        assert!(y.is_null(1));
        assert_eq!(m.value(1), 0);
        assert!(y.is_null(2));
        assert_eq!(m.value(2), 0);

        // Derived: positive Edema => NF observed negative; nothing observed => abstain.
        let y_nf = f32_col(&out, "y_No Finding");
        let m_nf = i8_col(&out, "m_No Finding");
        assert_eq!(y_nf.value(0), 0.0);
        assert_eq!(m_nf.value(0), 1);
        assert!(y_nf.is_null(1));
        assert_eq!(m_nf.value(1), 0);
    }

    #[test]
    fn drop_mode_omits_no_finding_columns() {
        let batch = raw_batch(&["a"], &[Some(1.0)], &[Some(0.0)]);
        let config = PolicyConfig {
            null_handling: NullHandling::Negative,
            uncertain_handling: UncertainHandling::Zero,
            uncertain_soft_value: 0.5,
            no_finding: NoFindingMode::Drop,
        };
        let resolver = LabelResolver::new(cols(&["No Finding", "Edema"]), config);
        let (out, _) = resolver.resolve_batch(&batch).unwrap();
        assert!(out.column_by_name("y_No Finding").is_none());
        assert!(out.column_by_name("m_No Finding").is_none());
        assert!(out.column_by_name("y_Edema").is_some());
        // Raw "No Finding" column is untouched.
        assert!(out.column_by_name("No Finding").is_some());
    }

    #[test]
    fn re_resolving_replaces_previous_policy_columns() {
        let batch = raw_batch(&["a"], &[None], &[Some(-1.0)]);
        let labels = cols(&["Edema"]);
        let ones = LabelResolver::new(
            labels.clone(),
            PolicyConfig {
                null_handling: NullHandling::Missing,
                uncertain_handling: UncertainHandling::One,
                uncertain_soft_value: 0.5,
                no_finding: NoFindingMode::KeepOriginal,
            },
        );
        let zeros = LabelResolver::new(
            labels,
            PolicyConfig {
                null_handling: NullHandling::Missing,
                uncertain_handling: UncertainHandling::Zero,
                uncertain_soft_value: 0.5,
                no_finding: NoFindingMode::KeepOriginal,
            },
        );
        let (first, _) = ones.resolve_batch(&batch).unwrap();
        let (second, records) = zeros.resolve_batch(&first).unwrap();
        assert_eq!(second.num_columns(), first.num_columns());
        assert_eq!(f32_col(&second, "y_Edema").value(0), 0.0);
        assert_eq!(records[0].get("Edema").and_then(|l| l.target()), Some(0.0));
    }
}
