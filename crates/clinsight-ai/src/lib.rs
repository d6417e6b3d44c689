//! Learning layer: image features, masked multi-label objective and metrics,
//! partial-freeze encoder and the training loop.

pub mod checkpoint;
pub mod features;
pub mod freeze;
pub mod metrics;
pub mod model;
pub mod objective;
pub mod optim;
pub mod schedule;
pub mod train;

#[cfg(feature = "onnx")]
pub mod vision;
#[cfg(feature = "onnx")]
pub use vision::OnnxVisionEncoder;

pub use features::{FeatureExtractor, FeatureSource, ImageArray, ImageFeatures, PrecomputedFeatures};
pub use metrics::{DegenerateMetric, masked_auroc};
pub use model::{ChestXrayClassifier, Encoder, EncoderShape, MultiLabelHead};
pub use objective::{masked_loss, masked_loss_with_grad};
pub use train::{StopReason, TerminalState, TrainConfig, Trainer, run_training};
