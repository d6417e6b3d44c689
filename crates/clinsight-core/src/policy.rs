//! Label policy configuration.
//!
//! A policy document names the label columns and a set of variants, each of
//! which decides how missing, uncertain and "No Finding" labels become
//! training targets:
//!
//! ```json
//! {
//!   "label_cols": ["No Finding", "Edema", "..."],
//!   "variants": {
//!     "u_ignore": {
//!       "null_handling": "missing",
//!       "uncertain_handling": "ignore",
//!       "no_finding": { "mode": "derive", "require_observed_other_labels": 1 }
//!     }
//!   }
//! }
//! ```
//!
//! Variants are deserialized as raw strings ([`VariantSpec`]) and validated into
//! a typed [`PolicyConfig`] up front, so an unrecognized value fails before any
//! record is resolved.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::PolicyError;
use crate::findings::default_label_cols;

/// How a blank (missing) raw label is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullHandling {
    /// Missing stays unobserved (mask 0).
    Missing,
    /// Missing becomes an observed negative.
    Negative,
}

/// How an uncertain (`-1.0`) raw label is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncertainHandling {
    /// Uncertain is masked out of the loss.
    Ignore,
    Zero,
    One,
    /// Uncertain becomes [`PolicyConfig::uncertain_soft_value`].
    Soft,
}

/// What happens to the aggregate "No Finding" label after per-finding resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoFindingMode {
    /// Keep the direct resolution of the raw column.
    KeepOriginal,
    /// Remove "No Finding" from the resolved output.
    Drop,
    /// Synthesize "No Finding" from the resolved state of every other finding.
    Derive { require_observed_other_labels: usize },
}

impl NullHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Negative => "negative",
        }
    }
}

impl UncertainHandling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Zero => "zero",
            Self::One => "one",
            Self::Soft => "soft",
        }
    }
}

impl NoFindingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepOriginal => "keep_original",
            Self::Drop => "drop",
            Self::Derive { .. } => "derive",
        }
    }
}

impl FromStr for NullHandling {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(Self::Missing),
            "negative" => Ok(Self::Negative),
            other => Err(PolicyError::Config {
                key: "null_handling",
                value: other.to_string(),
                expected: "missing, negative",
            }),
        }
    }
}

impl FromStr for UncertainHandling {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(Self::Ignore),
            "zero" => Ok(Self::Zero),
            "one" => Ok(Self::One),
            "soft" => Ok(Self::Soft),
            other => Err(PolicyError::Config {
                key: "uncertain_handling",
                value: other.to_string(),
                expected: "ignore, zero, one, soft",
            }),
        }
    }
}

impl fmt::Display for NullHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for UncertainHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for NoFindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated label policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyConfig {
    pub null_handling: NullHandling,
    pub uncertain_handling: UncertainHandling,
    /// Target assigned to uncertain labels under [`UncertainHandling::Soft`].
    pub uncertain_soft_value: f32,
    pub no_finding: NoFindingMode,
}

impl PolicyConfig {
    /// Validate a raw variant. Fails on the first unrecognized key value.
    pub fn from_spec(spec: &VariantSpec) -> Result<Self, PolicyError> {
        let null_handling: NullHandling = spec.null_handling.parse()?;
        let uncertain_handling: UncertainHandling = spec.uncertain_handling.parse()?;

        if !(0.0..=1.0).contains(&spec.uncertain_soft_value) {
            return Err(PolicyError::SoftValueOutOfRange(spec.uncertain_soft_value));
        }

        let no_finding = match spec.no_finding.mode.as_str() {
            "keep_original" => NoFindingMode::KeepOriginal,
            "drop" => NoFindingMode::Drop,
            "derive" => NoFindingMode::Derive {
                require_observed_other_labels: spec.no_finding.require_observed_other_labels,
            },
            other => {
                return Err(PolicyError::Config {
                    key: "no_finding.mode",
                    value: other.to_string(),
                    expected: "keep_original, drop, derive",
                });
            }
        };

        Ok(Self {
            null_handling,
            uncertain_handling,
            uncertain_soft_value: spec.uncertain_soft_value,
            no_finding,
        })
    }

    /// Short tag used in artifact file names, e.g. `u_ignore__null_missing__nf_derive`.
    pub fn tag(&self) -> String {
        format!(
            "u_{}__null_{}__nf_{}",
            self.uncertain_handling, self.null_handling, self.no_finding
        )
    }
}

fn default_soft_value() -> f32 {
    0.5
}

fn default_no_finding_mode() -> String {
    "keep_original".to_string()
}

fn default_require_observed() -> usize {
    1
}

/// A policy variant exactly as written in the policy document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub null_handling: String,
    pub uncertain_handling: String,
    #[serde(default = "default_soft_value")]
    pub uncertain_soft_value: f32,
    #[serde(default)]
    pub no_finding: NoFindingSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoFindingSpec {
    #[serde(default = "default_no_finding_mode")]
    pub mode: String,
    #[serde(default = "default_require_observed")]
    pub require_observed_other_labels: usize,
}

impl Default for NoFindingSpec {
    fn default() -> Self {
        Self {
            mode: default_no_finding_mode(),
            require_observed_other_labels: default_require_observed(),
        }
    }
}

/// Label columns plus named policy variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default = "default_label_cols")]
    pub label_cols: Vec<String>,
    #[serde(default)]
    pub variants: BTreeMap<String, VariantSpec>,
}

impl PolicyDocument {
    /// Read a policy document from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        let doc: Self = serde_json::from_str(&text).map_err(|source| PolicyError::Document {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            labels = doc.label_cols.len(),
            variants = doc.variants.len(),
            "loaded policy document"
        );
        Ok(doc)
    }

    /// Validated config for a named variant.
    pub fn variant(&self, name: &str) -> Result<PolicyConfig, PolicyError> {
        let spec = self
            .variants
            .get(name)
            .ok_or_else(|| PolicyError::UnknownVariant {
                name: name.to_string(),
                available: self.variant_names().join(", "),
            })?;
        PolicyConfig::from_spec(spec)
    }

    pub fn variant_names(&self) -> Vec<&str> {
        self.variants.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "label_cols": ["No Finding", "Edema", "Cardiomegaly"],
        "variants": {
            "u_ignore": {
                "null_handling": "missing",
                "uncertain_handling": "ignore",
                "no_finding": { "mode": "derive", "require_observed_other_labels": 2 }
            },
            "u_soft": {
                "null_handling": "negative",
                "uncertain_handling": "soft",
                "uncertain_soft_value": 0.3
            },
            "broken": {
                "null_handling": "zero",
                "uncertain_handling": "ignore"
            }
        }
    }"#;

    fn doc() -> PolicyDocument {
        serde_json::from_str(DOC).unwrap()
    }

    #[test]
    fn parses_derive_variant() {
        let cfg = doc().variant("u_ignore").unwrap();
        assert_eq!(cfg.null_handling, NullHandling::Missing);
        assert_eq!(cfg.uncertain_handling, UncertainHandling::Ignore);
        assert_eq!(
            cfg.no_finding,
            NoFindingMode::Derive {
                require_observed_other_labels: 2
            }
        );
    }

    #[test]
    fn defaults_fill_optional_keys() {
        let cfg = doc().variant("u_soft").unwrap();
        assert_eq!(cfg.uncertain_soft_value, 0.3);
        assert_eq!(cfg.no_finding, NoFindingMode::KeepOriginal);
    }

    #[test]
    fn unknown_null_handling_names_the_key() {
        let err = doc().variant("broken").unwrap_err();
        match &err {
            PolicyError::Config { key, value, .. } => {
                assert_eq!(*key, "null_handling");
                assert_eq!(value, "zero");
            }
            other => panic!("expected Config error, got {other:?}"),
        }
        assert!(err.to_string().contains("null_handling"));
    }

    #[test]
    fn unknown_uncertain_handling() {
        let spec = VariantSpec {
            null_handling: "missing".into(),
            uncertain_handling: "half".into(),
            uncertain_soft_value: 0.5,
            no_finding: NoFindingSpec::default(),
        };
        let err = PolicyConfig::from_spec(&spec).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Config {
                key: "uncertain_handling",
                ..
            }
        ));
    }

    #[test]
    fn unknown_no_finding_mode() {
        let spec = VariantSpec {
            null_handling: "missing".into(),
            uncertain_handling: "zero".into(),
            uncertain_soft_value: 0.5,
            no_finding: NoFindingSpec {
                mode: "infer".into(),
                require_observed_other_labels: 1,
            },
        };
        let err = PolicyConfig::from_spec(&spec).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Config {
                key: "no_finding.mode",
                ..
            }
        ));
    }

    #[test]
    fn soft_value_out_of_range() {
        let spec = VariantSpec {
            null_handling: "missing".into(),
            uncertain_handling: "soft".into(),
            uncertain_soft_value: 1.5,
            no_finding: NoFindingSpec::default(),
        };
        assert!(matches!(
            PolicyConfig::from_spec(&spec),
            Err(PolicyError::SoftValueOutOfRange(_))
        ));
    }

    #[test]
    fn unknown_variant_lists_available() {
        let err = doc().variant("nope").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("u_ignore"));
        assert!(msg.contains("u_soft"));
    }

    #[test]
    fn label_cols_default_to_catalogue() {
        let doc: PolicyDocument = serde_json::from_str(r#"{ "variants": {} }"#).unwrap();
        assert_eq!(doc.label_cols.len(), 14);
    }

    #[test]
    fn tag_names_all_three_choices() {
        let cfg = doc().variant("u_ignore").unwrap();
        assert_eq!(cfg.tag(), "u_ignore__null_missing__nf_derive");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("label_policy.json");
        std::fs::write(&path, DOC).unwrap();
        let doc = PolicyDocument::load(&path).unwrap();
        assert_eq!(doc.variant_names(), vec!["broken", "u_ignore", "u_soft"]);
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = PolicyDocument::load(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
