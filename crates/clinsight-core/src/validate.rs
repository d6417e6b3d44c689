//! Sanity statistics over resolved label records.
//!
//! Read-only and infallible: the report describes whatever the policy produced.

use crate::findings::NO_FINDING;
use crate::resolve::ResolvedRecord;

/// Per-finding coverage in a resolved batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FindingStats {
    pub finding: String,
    /// Records with mask = 1.
    pub observed: usize,
    /// Records with target = 1.0.
    pub positive: usize,
}

/// Summary of a resolved batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticReport {
    pub records: usize,
    /// Records where "No Finding" is an observed positive alongside another observed positive.
    pub no_finding_contradictions: usize,
    /// Mean number of findings with target = 1.0 per record.
    pub mean_positive_per_record: f64,
    pub per_finding: Vec<FindingStats>,
}

/// Compute the semantic report for a batch of resolved records.
///
/// Contradictions can only be non-zero under `keep_original`, which trusts the
/// raw "No Finding" column; derived "No Finding" labels are consistent by
/// construction.
pub fn semantic_checks(records: &[ResolvedRecord]) -> SemanticReport {
    let mut contradictions = 0usize;
    let mut total_positive = 0usize;
    let mut per_finding: Vec<FindingStats> = Vec::new();

    for record in records {
        let mut positives = 0usize;
        let mut other_positive = false;
        let mut nf_positive = false;

        for (name, label) in &record.labels {
            let idx = match per_finding.iter().position(|s| &s.finding == name) {
                Some(i) => i,
                None => {
                    per_finding.push(FindingStats {
                        finding: name.clone(),
                        observed: 0,
                        positive: 0,
                    });
                    per_finding.len() - 1
                }
            };
            let stats = &mut per_finding[idx];

            if label.is_observed() {
                stats.observed += 1;
            }
            if label.target() == Some(1.0) {
                stats.positive += 1;
                positives += 1;
                if name == NO_FINDING {
                    nf_positive = true;
                } else {
                    other_positive = true;
                }
            }
        }

        if nf_positive && other_positive {
            contradictions += 1;
        }
        total_positive += positives;
    }

    let mean_positive_per_record = if records.is_empty() {
        0.0
    } else {
        total_positive as f64 / records.len() as f64
    };

    SemanticReport {
        records: records.len(),
        no_finding_contradictions: contradictions,
        mean_positive_per_record,
        per_finding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::default_label_cols;
    use crate::policy::{NoFindingMode, NullHandling, PolicyConfig, UncertainHandling};
    use crate::resolve::{LabelResolver, RawLabelRecord, ResolvedLabel};

    fn record(labels: &[(&str, ResolvedLabel)]) -> ResolvedRecord {
        ResolvedRecord {
            path: "x".into(),
            labels: labels.iter().map(|(n, l)| (n.to_string(), *l)).collect(),
        }
    }

    #[test]
    fn counts_contradictions() {
        let records = vec![
            record(&[
                (NO_FINDING, ResolvedLabel::Observed(1.0)),
                ("Edema", ResolvedLabel::Observed(1.0)),
            ]),
            record(&[
                (NO_FINDING, ResolvedLabel::Observed(1.0)),
                ("Edema", ResolvedLabel::Observed(0.0)),
            ]),
        ];
        let report = semantic_checks(&records);
        assert_eq!(report.no_finding_contradictions, 1);
    }

    #[test]
    fn mean_positive_counts_no_finding_too() {
        let records = vec![
            record(&[
                (NO_FINDING, ResolvedLabel::Observed(1.0)),
                ("Edema", ResolvedLabel::Observed(1.0)),
            ]),
            record(&[
                (NO_FINDING, ResolvedLabel::Masked),
                ("Edema", ResolvedLabel::Observed(0.0)),
            ]),
        ];
        let report = semantic_checks(&records);
        assert!((report.mean_positive_per_record - 1.0).abs() < 1e-12);
    }

    #[test]
    fn per_finding_stats() {
        let records = vec![
            record(&[("Edema", ResolvedLabel::Observed(1.0))]),
            record(&[("Edema", ResolvedLabel::Masked)]),
            record(&[("Edema", ResolvedLabel::Observed(0.5))]),
        ];
        let report = semantic_checks(&records);
        assert_eq!(
            report.per_finding,
            vec![FindingStats {
                finding: "Edema".into(),
                observed: 2,
                positive: 1,
            }]
        );
    }

    #[test]
    fn empty_batch() {
        let report = semantic_checks(&[]);
        assert_eq!(report.records, 0);
        assert_eq!(report.mean_positive_per_record, 0.0);
        assert!(report.per_finding.is_empty());
    }

    #[test]
    fn derive_policy_reports_no_contradictions() {
        let config = PolicyConfig {
            null_handling: NullHandling::Missing,
            uncertain_handling: UncertainHandling::One,
            uncertain_soft_value: 0.5,
            no_finding: NoFindingMode::Derive {
                require_observed_other_labels: 1,
            },
        };
        let resolver = LabelResolver::new(default_label_cols(), config);
        let raws = vec![
            RawLabelRecord::new("a")
                .with(NO_FINDING, Some(1.0))
                .with("Edema", Some(-1.0)),
            RawLabelRecord::new("b")
                .with(NO_FINDING, Some(1.0))
                .with("Fracture", Some(0.0)),
        ];
        let report = semantic_checks(&resolver.resolve_all(&raws));
        assert_eq!(report.no_finding_contradictions, 0);
        assert_eq!(report.records, 2);
    }
}
