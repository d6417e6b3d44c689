//! Label policy resolution.
//!
//! Turns three-valued CheXpert labels into per-finding training targets and
//! loss masks under a [`PolicyConfig`]. Findings resolve independently; the
//! "No Finding" label is then kept, dropped or derived from the others.
//!
//! Resolution is a pure function of the raw record and the policy: the same
//! record may be resolved under any number of policies concurrently.

use std::collections::HashMap;

use crate::findings::{NO_FINDING, UNCERTAIN};
use crate::policy::{NoFindingMode, NullHandling, PolicyConfig, PolicyDocument, UncertainHandling};
use crate::PolicyError;

/// One raw row of the CheXpert index: image path plus raw finding values.
///
/// A finding absent from `values`, or present as `None`/NaN, is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLabelRecord {
    pub path: String,
    pub values: HashMap<String, Option<f32>>,
}

impl RawLabelRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            values: HashMap::new(),
        }
    }

    /// Builder-style insert of a raw value.
    pub fn with(mut self, finding: &str, value: Option<f32>) -> Self {
        self.values.insert(finding.to_string(), value);
        self
    }

    /// Raw value of a finding, with NaN folded into missing.
    pub fn value(&self, finding: &str) -> Option<f32> {
        self.values
            .get(finding)
            .copied()
            .flatten()
            .filter(|v| !v.is_nan())
    }
}

/// Resolved target/mask pair for one (record, finding).
///
/// A masked-out label carries no target, so the loss can never read one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedLabel {
    /// `mask = 1` with a target in `[0, 1]`.
    Observed(f32),
    /// `mask = 0`, target undefined.
    Masked,
}

impl ResolvedLabel {
    pub fn target(&self) -> Option<f32> {
        match self {
            Self::Observed(t) => Some(*t),
            Self::Masked => None,
        }
    }

    pub fn mask(&self) -> u8 {
        match self {
            Self::Observed(_) => 1,
            Self::Masked => 0,
        }
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Self::Observed(_))
    }

    /// Observed with exactly the given target.
    pub fn is_observed_as(&self, target: f32) -> bool {
        matches!(self, Self::Observed(t) if *t == target)
    }
}

/// A raw record resolved under one policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    pub path: String,
    /// One entry per resolved finding, in label-column order.
    pub labels: Vec<(String, ResolvedLabel)>,
}

impl ResolvedRecord {
    pub fn get(&self, finding: &str) -> Option<ResolvedLabel> {
        self.labels
            .iter()
            .find(|(name, _)| name == finding)
            .map(|(_, label)| *label)
    }

    pub fn findings(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|(name, _)| name.as_str())
    }
}

/// Resolve a single raw value (null step, then uncertain step).
pub fn resolve_value(raw: Option<f32>, config: &PolicyConfig) -> ResolvedLabel {
    let value = match (raw.filter(|v| !v.is_nan()), config.null_handling) {
        (Some(v), _) => v,
        (None, NullHandling::Negative) => 0.0,
        (None, NullHandling::Missing) => return ResolvedLabel::Masked,
    };

    if value == UNCERTAIN {
        return match config.uncertain_handling {
            UncertainHandling::Ignore => ResolvedLabel::Masked,
            UncertainHandling::Zero => ResolvedLabel::Observed(0.0),
            UncertainHandling::One => ResolvedLabel::Observed(1.0),
            UncertainHandling::Soft => ResolvedLabel::Observed(config.uncertain_soft_value),
        };
    }

    ResolvedLabel::Observed(value)
}

/// Derive "No Finding" from the resolved state of every other finding.
///
/// A positive elsewhere always yields an observed negative, regardless of how
/// many other findings were observed. Without a positive, "No Finding" is an
/// observed positive only when at least `require_observed` other findings are
/// observed and all of them are negative; otherwise it abstains.
pub fn derive_no_finding<'a>(
    others: impl IntoIterator<Item = &'a ResolvedLabel>,
    require_observed: usize,
) -> ResolvedLabel {
    let mut any_pos = false;
    let mut observed_count = 0usize;
    let mut all_zero_or_masked = true;

    for label in others {
        match label {
            ResolvedLabel::Observed(t) => {
                observed_count += 1;
                if *t == 1.0 {
                    any_pos = true;
                }
                if *t != 0.0 {
                    all_zero_or_masked = false;
                }
            }
            ResolvedLabel::Masked => {}
        }
    }

    if any_pos {
        ResolvedLabel::Observed(0.0)
    } else if observed_count >= require_observed && all_zero_or_masked {
        ResolvedLabel::Observed(1.0)
    } else {
        ResolvedLabel::Masked
    }
}

/// Resolve a raw record under a policy.
///
/// `label_cols` fixes the finding order of the output. In `derive` mode,
/// "No Finding" is appended if `label_cols` does not list it.
pub fn resolve(raw: &RawLabelRecord, label_cols: &[String], config: &PolicyConfig) -> ResolvedRecord {
    let mut labels: Vec<(String, ResolvedLabel)> = label_cols
        .iter()
        .map(|finding| (finding.clone(), resolve_value(raw.value(finding), config)))
        .collect();

    match config.no_finding {
        NoFindingMode::KeepOriginal => {}
        NoFindingMode::Drop => labels.retain(|(name, _)| name != NO_FINDING),
        NoFindingMode::Derive {
            require_observed_other_labels,
        } => {
            let derived = derive_no_finding(
                labels
                    .iter()
                    .filter(|(name, _)| name != NO_FINDING)
                    .map(|(_, label)| label),
                require_observed_other_labels,
            );
            match labels.iter_mut().find(|(name, _)| name == NO_FINDING) {
                Some((_, slot)) => *slot = derived,
                None => labels.push((NO_FINDING.to_string(), derived)),
            }
        }
    }

    ResolvedRecord {
        path: raw.path.clone(),
        labels,
    }
}

/// A validated policy bound to its label columns.
#[derive(Debug, Clone)]
pub struct LabelResolver {
    label_cols: Vec<String>,
    config: PolicyConfig,
}

impl LabelResolver {
    pub fn new(label_cols: Vec<String>, config: PolicyConfig) -> Self {
        Self { label_cols, config }
    }

    /// Build a resolver for a named variant. Config errors surface here,
    /// before any record is touched.
    pub fn from_document(doc: &PolicyDocument, variant: &str) -> Result<Self, PolicyError> {
        let config = doc.variant(variant)?;
        Ok(Self::new(doc.label_cols.clone(), config))
    }

    pub fn label_cols(&self) -> &[String] {
        &self.label_cols
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn resolve(&self, raw: &RawLabelRecord) -> ResolvedRecord {
        resolve(raw, &self.label_cols, &self.config)
    }

    pub fn resolve_all(&self, raws: &[RawLabelRecord]) -> Vec<ResolvedRecord> {
        raws.iter().map(|r| self.resolve(r)).collect()
    }

    /// Findings present in the resolved output, in output order.
    pub fn output_findings(&self) -> Vec<String> {
        let mut out: Vec<String> = self.label_cols.clone();
        match self.config.no_finding {
            NoFindingMode::KeepOriginal => {}
            NoFindingMode::Drop => out.retain(|l| l != NO_FINDING),
            NoFindingMode::Derive { .. } => {
                if !out.iter().any(|l| l == NO_FINDING) {
                    out.push(NO_FINDING.to_string());
                }
            }
        }
        out
    }
}
