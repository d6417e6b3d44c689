//! Core types for clinsight: the CheXpert finding catalogue, label policies and
//! their resolution into training targets and loss masks.

mod error;
pub mod findings;
pub mod policy;
pub mod resolve;
pub mod table;
pub mod validate;

pub use error::PolicyError;
pub use findings::{CHEXPERT_LABELS, NO_FINDING};
pub use policy::{NoFindingMode, NullHandling, PolicyConfig, PolicyDocument, UncertainHandling};
pub use resolve::{LabelResolver, RawLabelRecord, ResolvedLabel, ResolvedRecord, resolve};
pub use validate::{SemanticReport, semantic_checks};
