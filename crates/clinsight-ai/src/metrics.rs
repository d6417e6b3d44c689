//! Masked per-finding AUROC.

use ndarray::Array2;
use thiserror::Error;
use tracing::warn;

/// A finding for which AUROC is undefined on the current sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DegenerateMetric {
    #[error("{finding}: only {count} observed entries")]
    TooFewEntries { finding: String, count: usize },

    #[error("{finding}: all {count} observed entries are {class}")]
    SingleClass {
        finding: String,
        count: usize,
        class: &'static str,
    },
}

/// AUROC of one finding over its observed entries.
///
/// Targets at or above 0.5 count as positive. Uses the rank statistic, with
/// tied scores sharing their average rank.
pub fn finding_auroc(
    finding: &str,
    scores: &[f32],
    targets: &[f32],
    masks: &[f32],
) -> Result<f32, DegenerateMetric> {
    let mut entries: Vec<(f32, bool)> = scores
        .iter()
        .zip(targets)
        .zip(masks)
        .filter(|&(_, &m)| m > 0.0)
        .map(|((&s, &t), _)| (s, t >= 0.5))
        .collect();

    let n = entries.len();
    if n < 2 {
        return Err(DegenerateMetric::TooFewEntries {
            finding: finding.to_string(),
            count: n,
        });
    }

    let n_pos = entries.iter().filter(|(_, p)| *p).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(DegenerateMetric::SingleClass {
            finding: finding.to_string(),
            count: n,
            class: if n_pos == 0 { "negative" } else { "positive" },
        });
    }

    entries.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Sum of 1-based ranks of the positives, averaging across ties.
    let mut pos_rank_sum = 0.0f64;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && entries[j + 1].0 == entries[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        let tied_pos = entries[i..=j].iter().filter(|(_, p)| *p).count();
        pos_rank_sum += avg_rank * tied_pos as f64;
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let u = pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0;
    Ok((u / (n_pos * n_neg as f64)) as f32)
}

/// Per-finding AUROC (NaN where degenerate) and the macro average over the
/// non-degenerate findings. The macro is NaN when every finding is degenerate.
pub fn masked_auroc(
    scores: &Array2<f32>,
    targets: &Array2<f32>,
    masks: &Array2<f32>,
    finding_names: &[String],
) -> (Vec<(String, f32)>, f32) {
    let mut per_finding = Vec::with_capacity(finding_names.len());
    let mut valid = Vec::new();

    for (j, name) in finding_names.iter().enumerate() {
        let column = |grid: &Array2<f32>| grid.column(j).to_vec();
        let auc = match finding_auroc(name, &column(scores), &column(targets), &column(masks)) {
            Ok(auc) => {
                valid.push(auc);
                auc
            }
            Err(err) => {
                warn!(finding = %name, %err, "auroc undefined");
                f32::NAN
            }
        };
        per_finding.push((name.clone(), auc));
    }

    let macro_avg = if valid.is_empty() {
        f32::NAN
    } else {
        valid.iter().sum::<f32>() / valid.len() as f32
    };
    (per_finding, macro_avg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn perfect_ranking_is_one() {
        let auc = finding_auroc("x", &[0.1, 0.2, 0.8, 0.9], &[0.0, 0.0, 1.0, 1.0], &[1.0; 4]).unwrap();
        assert_eq!(auc, 1.0);
    }

    #[test]
    fn inverted_ranking_is_zero() {
        let auc = finding_auroc("x", &[0.9, 0.1], &[0.0, 1.0], &[1.0; 2]).unwrap();
        assert_eq!(auc, 0.0);
    }

    #[test]
    fn ties_count_half() {
        let auc = finding_auroc("x", &[0.5, 0.5], &[1.0, 0.0], &[1.0; 2]).unwrap();
        assert!((auc - 0.5).abs() < 1e-6);
    }

    #[test]
    fn masked_entries_excluded() {
        // The masked entry would invert the ranking if it counted.
        let auc = finding_auroc(
            "x",
            &[0.1, 0.9, 5.0],
            &[0.0, 1.0, f32::NAN],
            &[1.0, 1.0, 0.0],
        )
        .unwrap();
        assert_eq!(auc, 1.0);
    }

    #[test]
    fn soft_targets_binarized_at_half() {
        let auc = finding_auroc("x", &[0.2, 0.7], &[0.0, 0.5], &[1.0; 2]).unwrap();
        assert_eq!(auc, 1.0);
    }

    #[test]
    fn single_class_is_degenerate() {
        let err = finding_auroc("Fracture", &[0.1, 0.2], &[0.0, 0.0], &[1.0; 2]).unwrap_err();
        assert!(matches!(err, DegenerateMetric::SingleClass { class: "negative", .. }));
    }

    #[test]
    fn too_few_entries_is_degenerate() {
        let err = finding_auroc("x", &[0.1, 0.2], &[1.0, 0.0], &[1.0, 0.0]).unwrap_err();
        assert_eq!(
            err,
            DegenerateMetric::TooFewEntries {
                finding: "x".into(),
                count: 1
            }
        );
    }

    #[test]
    fn macro_skips_degenerate_findings() {
        let scores = array![[0.1, 0.3], [0.9, 0.4]];
        let targets = array![[0.0, 0.0], [1.0, 0.0]];
        let masks = Array2::ones((2, 2));
        let (per, macro_avg) = masked_auroc(&scores, &targets, &masks, &names(&["Edema", "Fracture"]));
        assert_eq!(per[0], ("Edema".to_string(), 1.0));
        assert!(per[1].1.is_nan());
        assert_eq!(macro_avg, 1.0);
    }

    #[test]
    fn macro_nan_when_all_degenerate() {
        let (per, macro_avg) = masked_auroc(&array![[0.3]], &array![[1.0]], &array![[1.0]], &names(&["Edema"]));
        assert!(per[0].1.is_nan());
        assert!(macro_avg.is_nan());
    }

    #[test]
    fn empty_batch_is_degenerate_everywhere() {
        let empty = Array2::zeros((0, 2));
        let (per, macro_avg) = masked_auroc(&empty, &empty, &empty, &names(&["Edema", "Fracture"]));
        assert_eq!(per.len(), 2);
        assert!(per.iter().all(|(_, auc)| auc.is_nan()));
        assert!(macro_avg.is_nan());
    }
}
