//! CheXpert finding catalogue and resolved-column naming.
//!
//! The 14 findings appear in the CheXpert index CSV in this order. Raw values
//! are three-valued: `1.0` positive, `0.0` negative, `-1.0` uncertain, or blank.

/// The aggregate "no abnormality" finding, derived from the others in `derive` mode.
pub const NO_FINDING: &str = "No Finding";

/// Raw value CheXpert uses for an uncertain radiologist label.
pub const UNCERTAIN: f32 = -1.0;

/// All CheXpert findings in index-CSV column order.
pub const CHEXPERT_LABELS: [&str; 14] = [
    "No Finding",
    "Enlarged Cardiomediastinum",
    "Cardiomegaly",
    "Lung Opacity",
    "Lung Lesion",
    "Edema",
    "Consolidation",
    "Pneumonia",
    "Atelectasis",
    "Pneumothorax",
    "Pleural Effusion",
    "Pleural Other",
    "Fracture",
    "Support Devices",
];

/// Owned copy of [`CHEXPERT_LABELS`], for configs that default to the full catalogue.
pub fn default_label_cols() -> Vec<String> {
    CHEXPERT_LABELS.iter().map(|s| s.to_string()).collect()
}

/// Name of the resolved target column for a finding (`y_<finding>`).
pub fn target_column(finding: &str) -> String {
    format!("y_{finding}")
}

/// Name of the resolved mask column for a finding (`m_<finding>`).
pub fn mask_column(finding: &str) -> String {
    format!("m_{finding}")
}

/// Findings other than [`NO_FINDING`], preserving order.
pub fn other_findings(label_cols: &[String]) -> impl Iterator<Item = &str> {
    label_cols
        .iter()
        .map(|s| s.as_str())
        .filter(|l| *l != NO_FINDING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_starts_with_no_finding() {
        assert_eq!(CHEXPERT_LABELS.len(), 14);
        assert_eq!(CHEXPERT_LABELS[0], NO_FINDING);
    }

    #[test]
    fn column_names() {
        assert_eq!(target_column("Edema"), "y_Edema");
        assert_eq!(mask_column("No Finding"), "m_No Finding");
    }

    #[test]
    fn other_findings_skips_no_finding() {
        let cols = default_label_cols();
        let others: Vec<_> = other_findings(&cols).collect();
        assert_eq!(others.len(), 13);
        assert!(!others.contains(&NO_FINDING));
        assert_eq!(others[0], "Enlarged Cardiomediastinum");
    }
}
