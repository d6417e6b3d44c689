//! Tabular log output for resolve reports and training history.

use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float32Array, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clinsight_ai::train::EpochRecord;
use clinsight_core::SemanticReport;
use tracing::{info, warn};

/// Log the semantic summary and a per-finding coverage table.
pub fn log_semantic_report(tag: &str, report: &SemanticReport) -> anyhow::Result<()> {
    info!(
        policy = tag,
        records = report.records,
        nf_contradictions = report.no_finding_contradictions,
        mean_positive = report.mean_positive_per_record,
        "semantic checks"
    );
    if report.no_finding_contradictions > 0 {
        warn!(
            count = report.no_finding_contradictions,
            "records mark No Finding alongside another positive finding"
        );
    }

    let stats = &report.per_finding;
    let prevalence: Float64Array = stats
        .iter()
        .map(|s| (s.observed > 0).then(|| s.positive as f64 / s.observed as f64))
        .collect();

    let table = table(vec![
        (
            "finding",
            DataType::Utf8,
            Arc::new(StringArray::from_iter_values(stats.iter().map(|s| s.finding.as_str()))),
        ),
        (
            "observed",
            DataType::UInt64,
            Arc::new(UInt64Array::from_iter_values(stats.iter().map(|s| s.observed as u64))),
        ),
        (
            "positive",
            DataType::UInt64,
            Arc::new(UInt64Array::from_iter_values(stats.iter().map(|s| s.positive as u64))),
        ),
        ("prevalence", DataType::Float64, Arc::new(prevalence)),
    ])?;
    info!("per-finding coverage ({tag}):\n{}", pretty_format_batches(&[table])?);
    Ok(())
}

/// Log the per-epoch history of a finished run.
pub fn log_history(history: &[EpochRecord]) -> anyhow::Result<()> {
    if history.is_empty() {
        return Ok(());
    }
    let f32_col = |f: fn(&EpochRecord) -> f32| -> ArrayRef {
        Arc::new(history.iter().map(|r| Some(f(r))).collect::<Float32Array>())
    };

    let table = table(vec![
        (
            "epoch",
            DataType::UInt64,
            Arc::new(UInt64Array::from_iter_values(history.iter().map(|r| r.epoch as u64))),
        ),
        ("train_loss", DataType::Float32, f32_col(|r| r.train_loss)),
        ("val_loss", DataType::Float32, f32_col(|r| r.val_loss)),
        ("macro_auroc", DataType::Float32, f32_col(|r| r.macro_auroc)),
        ("lr", DataType::Float32, f32_col(|r| r.lr)),
        (
            "best",
            DataType::Boolean,
            Arc::new(history.iter().map(|r| Some(r.improved)).collect::<BooleanArray>()),
        ),
    ])?;
    info!("history:\n{}", pretty_format_batches(&[table])?);
    Ok(())
}

fn table(columns: Vec<(&str, DataType, ArrayRef)>) -> anyhow::Result<RecordBatch> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, dt, _)| Field::new(*name, dt.clone(), true))
        .collect();
    let arrays = columns.into_iter().map(|(_, _, a)| a).collect();
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinsight_core::validate::FindingStats;

    #[test]
    fn semantic_table_renders() {
        let report = SemanticReport {
            records: 2,
            no_finding_contradictions: 0,
            mean_positive_per_record: 0.5,
            per_finding: vec![
                FindingStats {
                    finding: "Edema".into(),
                    observed: 2,
                    positive: 1,
                },
                FindingStats {
                    finding: "Fracture".into(),
                    observed: 0,
                    positive: 0,
                },
            ],
        };
        log_semantic_report("u_ignore__null_missing__nf_derive", &report).unwrap();
    }

    #[test]
    fn history_table_renders() {
        let history = vec![EpochRecord {
            epoch: 1,
            train_loss: 0.6,
            val_loss: 0.5,
            macro_auroc: f32::NAN,
            lr: 3e-4,
            improved: true,
            elapsed_secs: 1.0,
        }];
        log_history(&history).unwrap();
        log_history(&[]).unwrap();
    }
}
