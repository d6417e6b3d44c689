//! Masked multi-label training loop.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Initializing → TrainingEpoch → Validating → CheckpointIfImproved ─┬→ TrainingEpoch
//!                                                                   └→ Stopped
//! ```
//!
//! A frozen encoder trains only the head. Otherwise the encoder
//! trains at `encoder_lr` alongside the head at `head_lr`, optionally from
//! block `unfreeze_from_block` onward and starting from a frozen-encoder checkpoint.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clinsight_core::NO_FINDING;
use clinsight_core::findings::default_label_cols;
use clinsight_store::LabelledDataset;
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::{CheckpointMeta, load_checkpoint, save_checkpoint};
use crate::features::{FeatureSource, PrecomputedFeatures};
use crate::metrics::masked_auroc;
use crate::model::{ChestXrayClassifier, EncoderShape};
use crate::objective::{masked_loss, masked_loss_with_grad};
use crate::optim::{AdamW, build_optimizer};
use crate::schedule::CosineAnnealing;

/// Training configuration. Every field has a default, so a JSON file only
/// needs the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Resolved label table (Parquet with `y_`/`m_` columns).
    pub data_path: PathBuf,
    pub labels: Vec<String>,
    pub drop_labels: Vec<String>,
    /// Precomputed feature column; when unset, images are decoded and encoded.
    pub embedding_column: Option<String>,
    pub image_root: PathBuf,
    pub img_data: Option<PathBuf>,
    pub model_dir: PathBuf,
    pub num_workers: usize,
    pub skip_missing_assets: bool,

    pub freeze_encoder: bool,
    pub unfreeze_from_block: Option<usize>,
    pub init_checkpoint: Option<PathBuf>,
    pub hidden_dim: usize,
    pub num_blocks: usize,
    pub dropout: f32,

    pub num_epochs: usize,
    pub batch_size: usize,
    pub head_lr: f32,
    pub encoder_lr: f32,
    pub min_lr: f32,
    pub val_fraction: f32,
    pub seed: u64,
    pub max_samples: Option<usize>,
    pub patience: usize,

    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/processed/chexpert_u_ignore.parquet"),
            labels: default_label_cols(),
            drop_labels: vec![NO_FINDING.to_string()],
            embedding_column: None,
            image_root: PathBuf::from("data/raw"),
            img_data: None,
            model_dir: PathBuf::from("models/vision-encoder"),
            num_workers: 1,
            skip_missing_assets: false,
            freeze_encoder: true,
            unfreeze_from_block: None,
            init_checkpoint: None,
            hidden_dim: 256,
            num_blocks: 4,
            dropout: 0.1,
            num_epochs: 100,
            batch_size: 64,
            head_lr: 3e-4,
            encoder_lr: 1e-5,
            min_lr: crate::schedule::DEFAULT_MIN_LR,
            val_fraction: 0.1,
            seed: 42,
            max_samples: None,
            patience: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading training config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing training config {}", path.display()))?;
        Ok(config)
    }

    /// Reject values the loop cannot run with, naming the offending key.
    pub fn validate(&self) -> anyhow::Result<()> {
        fn check(ok: bool, key: &str, value: impl fmt::Display, expected: &str) -> anyhow::Result<()> {
            anyhow::ensure!(ok, "invalid training config: {key} = {value} (expected {expected})");
            Ok(())
        }
        check(self.num_epochs > 0, "num_epochs", self.num_epochs, "at least 1")?;
        check(self.batch_size > 0, "batch_size", self.batch_size, "at least 1")?;
        check(self.patience > 0, "patience", self.patience, "at least 1")?;
        check(
            self.val_fraction > 0.0 && self.val_fraction < 1.0,
            "val_fraction",
            self.val_fraction,
            "a value in (0, 1)",
        )?;
        check(
            (0.0..1.0).contains(&self.dropout),
            "dropout",
            self.dropout,
            "a value in [0, 1)",
        )?;
        check(self.head_lr >= 0.0, "head_lr", self.head_lr, "non-negative")?;
        check(self.encoder_lr >= 0.0, "encoder_lr", self.encoder_lr, "non-negative")?;
        check(self.min_lr >= 0.0, "min_lr", self.min_lr, "non-negative")?;
        check(self.hidden_dim > 0, "hidden_dim", self.hidden_dim, "at least 1")?;
        check(
            !self.active_labels().is_empty(),
            "drop_labels",
            format!("{:?}", self.drop_labels),
            "to leave at least one label",
        )?;
        Ok(())
    }

    pub fn active_labels(&self) -> Vec<String> {
        self.labels
            .iter()
            .filter(|l| !self.drop_labels.contains(l))
            .cloned()
            .collect()
    }

    /// `frozen` for head-only training, `finetuned` otherwise.
    pub fn tag(&self) -> &'static str {
        if self.freeze_encoder { "frozen" } else { "finetuned" }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(format!("chexpert_{}_best.arrow", self.tag()))
    }
}

/// Seeded train/validation split, after optional subsampling.
///
/// At least one sample goes to validation and at least one to training.
pub fn split_indices(
    n: usize,
    val_fraction: f32,
    seed: u64,
    max_samples: Option<usize>,
) -> anyhow::Result<(Vec<usize>, Vec<usize>)> {
    let mut pool: Vec<usize> = (0..n).collect();
    if let Some(max) = max_samples
        && max < n
    {
        pool.shuffle(&mut StdRng::seed_from_u64(seed));
        pool.truncate(max);
        info!(samples = max, "subsampled dataset");
    }

    let total = pool.len();
    anyhow::ensure!(total >= 2, "need at least 2 samples to split, have {total}");

    let n_val = ((total as f32 * val_fraction) as usize).clamp(1, total - 1);
    let n_train = total - n_val;
    pool.shuffle(&mut StdRng::seed_from_u64(seed));
    let val = pool.split_off(n_train);
    Ok((pool, val))
}

/// Split `indices` into batches, shuffling first when an RNG is given.
pub fn make_batches(indices: &[usize], batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Vec<usize>> {
    let mut order = indices.to_vec();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    order.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
}

/// Loss and metrics from one validation pass.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub loss: f32,
    pub per_label: Vec<(String, f32)>,
    pub macro_auroc: f32,
}

#[derive(Debug, Clone)]
pub enum TrainState {
    Initializing,
    TrainingEpoch {
        epoch: usize,
    },
    Validating {
        epoch: usize,
        train_loss: f32,
        started: Instant,
    },
    CheckpointIfImproved {
        epoch: usize,
        train_loss: f32,
        started: Instant,
        outcome: ValidationOutcome,
    },
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No strict improvement for `patience` consecutive epochs.
    EarlyStopping { epoch: usize },
    /// Ran every configured epoch.
    EpochBudget,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EarlyStopping { epoch } => write!(f, "early stopping at epoch {epoch}"),
            Self::EpochBudget => write!(f, "epoch budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: f32,
    pub macro_auroc: f32,
    pub lr: f32,
    pub improved: bool,
    pub elapsed_secs: f64,
}

/// What a finished run reports.
#[derive(Debug, Clone)]
pub struct TerminalState {
    pub best_val_loss: f32,
    pub best_checkpoint_path: Option<PathBuf>,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
    pub history: Vec<EpochRecord>,
}

/// Rows whose features loaded, as `[rows, dim]` and `[rows, labels]` tensors.
struct Batch {
    features: Array2<f32>,
    targets: Array2<f32>,
    masks: Array2<f32>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.features.nrows() == 0
    }
}

/// Stack per-batch tensors; an empty list gives `[0, cols]`.
fn stack_rows(parts: &[Array2<f32>], cols: usize) -> anyhow::Result<Array2<f32>> {
    if parts.is_empty() {
        return Ok(Array2::zeros((0, cols)));
    }
    let views: Vec<ArrayView2<'_, f32>> = parts.iter().map(|a| a.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

pub struct Trainer {
    config: TrainConfig,
    dataset: LabelledDataset,
    features: Box<dyn FeatureSource>,
    model: ChestXrayClassifier,
    optimizer: AdamW,
    scheduler: CosineAnnealing,
    train_idx: Vec<usize>,
    val_idx: Vec<usize>,
    rng: StdRng,
    best_val: f32,
    best_checkpoint: Option<PathBuf>,
    wait: usize,
    history: Vec<EpochRecord>,
}

impl Trainer {
    /// Build the model, apply the freeze policy, load the initial checkpoint
    /// and set up the optimizer and schedule.
    pub fn new(
        config: TrainConfig,
        dataset: LabelledDataset,
        features: Box<dyn FeatureSource>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        anyhow::ensure!(
            dataset.labels == config.active_labels(),
            "dataset labels {:?} do not match configured labels {:?}",
            dataset.labels,
            config.active_labels()
        );
        anyhow::ensure!(features.dim() > 0, "feature source reports dimension 0");

        let (train_idx, val_idx) =
            split_indices(dataset.len(), config.val_fraction, config.seed, config.max_samples)?;
        info!(train = train_idx.len(), val = val_idx.len(), "split dataset");

        let mut rng = StdRng::seed_from_u64(config.seed);
        let shape = EncoderShape {
            in_dim: features.dim(),
            hidden_dim: config.hidden_dim,
            num_blocks: config.num_blocks,
        };
        let mut model = ChestXrayClassifier::new(shape, dataset.num_labels(), config.dropout, &mut rng);

        if let Some(init) = &config.init_checkpoint {
            let meta = load_checkpoint(init, &mut model)?;
            info!(from = %init.display(), epoch = meta.epoch, val_loss = meta.val_loss, "initialised from checkpoint");
        }

        if config.freeze_encoder {
            model.encoder.freeze_all();
        } else {
            model.encoder.unfreeze_from(config.unfreeze_from_block.unwrap_or(0));
        }

        let optimizer = build_optimizer(&model, config.freeze_encoder, config.head_lr, config.encoder_lr);
        let scheduler = CosineAnnealing::new(config.num_epochs, config.min_lr);

        Ok(Self {
            config,
            dataset,
            features,
            model,
            optimizer,
            scheduler,
            train_idx,
            val_idx,
            rng,
            best_val: f32::INFINITY,
            best_checkpoint: None,
            wait: 0,
            history: Vec::new(),
        })
    }

    pub fn model(&self) -> &ChestXrayClassifier {
        &self.model
    }

    /// Drive the state machine until it stops.
    pub fn run(mut self) -> anyhow::Result<TerminalState> {
        let mut state = TrainState::Initializing;
        loop {
            state = match state {
                TrainState::Stopped(reason) => {
                    info!(best_val_loss = self.best_val, reason = %reason, "training complete");
                    if let Some(path) = &self.best_checkpoint {
                        info!(path = %path.display(), "best checkpoint");
                    }
                    return Ok(TerminalState {
                        best_val_loss: self.best_val,
                        best_checkpoint_path: self.best_checkpoint,
                        epochs_run: self.history.len(),
                        stop_reason: reason,
                        history: self.history,
                    });
                }
                other => self.step(other)?,
            };
        }
    }

    fn step(&mut self, state: TrainState) -> anyhow::Result<TrainState> {
        Ok(match state {
            TrainState::Initializing => {
                let labels = self.dataset.labels.join(", ");
                let mode = if self.config.freeze_encoder {
                    "head only (encoder frozen)"
                } else {
                    "fine-tune"
                };
                info!(mode, labels = self.dataset.num_labels(), "starting training");
                info!("active labels: {labels}");
                info!("encoder: {}", self.model.encoder);
                info!("head: {}", self.model.head);
                info!(
                    head_lr = self.config.head_lr,
                    encoder_lr = self.config.encoder_lr,
                    epochs = self.config.num_epochs,
                    patience = self.config.patience,
                    "cosine annealing schedule"
                );
                TrainState::TrainingEpoch { epoch: 1 }
            }

            TrainState::TrainingEpoch { epoch } => {
                let started = Instant::now();
                let train_loss = self.train_one_epoch()?;
                self.scheduler.step(&mut self.optimizer);
                TrainState::Validating {
                    epoch,
                    train_loss,
                    started,
                }
            }

            TrainState::Validating {
                epoch,
                train_loss,
                started,
            } => TrainState::CheckpointIfImproved {
                epoch,
                train_loss,
                started,
                outcome: self.evaluate()?,
            },

            TrainState::CheckpointIfImproved {
                epoch,
                train_loss,
                started,
                outcome,
            } => self.checkpoint_if_improved(epoch, train_loss, started, outcome)?,

            stopped @ TrainState::Stopped(_) => stopped,
        })
    }

    fn load_batch(&mut self, rows: &[usize]) -> anyhow::Result<Batch> {
        let dim = self.features.dim();
        let num_labels = self.dataset.labels.len();
        let loaded = self.features.load(rows)?;

        let mut features = Vec::with_capacity(rows.len() * dim);
        let mut targets = Vec::with_capacity(rows.len() * num_labels);
        let mut masks = Vec::with_capacity(rows.len() * num_labels);
        let mut n = 0usize;
        for (&row, f) in rows.iter().zip(loaded) {
            let Some(f) = f else { continue };
            anyhow::ensure!(f.len() == dim, "row {row}: feature length {} != {dim}", f.len());
            features.extend(f);
            targets.extend_from_slice(&self.dataset.targets[row]);
            masks.extend_from_slice(&self.dataset.masks[row]);
            n += 1;
        }
        Ok(Batch {
            features: Array2::from_shape_vec((n, dim), features)?,
            targets: Array2::from_shape_vec((n, num_labels), targets)?,
            masks: Array2::from_shape_vec((n, num_labels), masks)?,
        })
    }

    fn train_one_epoch(&mut self) -> anyhow::Result<f32> {
        let batches = make_batches(&self.train_idx, self.config.batch_size, Some(&mut self.rng));
        let mut running = 0.0f32;
        let mut n_batches = 0usize;

        for rows in &batches {
            let batch = self.load_batch(rows)?;
            if batch.is_empty() {
                continue;
            }
            self.model.zero_grad();
            let (logits, trace) = self.model.forward_train(&batch.features, &mut self.rng);
            let (loss, grad) = masked_loss_with_grad(&logits, &batch.targets, &batch.masks);
            self.model.backward(&trace, &grad);
            self.optimizer.step(&mut self.model);

            running += loss;
            n_batches += 1;
        }
        Ok(running / n_batches.max(1) as f32)
    }

    fn evaluate(&mut self) -> anyhow::Result<ValidationOutcome> {
        let batches = make_batches(&self.val_idx, self.config.batch_size, None);
        let mut running = 0.0f32;
        let mut n_batches = 0usize;
        let mut all_logits = Vec::with_capacity(batches.len());
        let mut all_targets = Vec::with_capacity(batches.len());
        let mut all_masks = Vec::with_capacity(batches.len());

        for rows in &batches {
            let batch = self.load_batch(rows)?;
            if batch.is_empty() {
                continue;
            }
            let logits = self.model.predict(&batch.features);
            running += masked_loss(&logits, &batch.targets, &batch.masks);
            n_batches += 1;
            all_logits.push(logits);
            all_targets.push(batch.targets);
            all_masks.push(batch.masks);
        }

        // NaN never compares below the best loss, so an empty pass is not an improvement.
        let loss = if n_batches == 0 {
            warn!(rows = self.val_idx.len(), "validation pass produced no samples");
            f32::NAN
        } else {
            running / n_batches as f32
        };

        let num_labels = self.dataset.labels.len();
        let (per_label, macro_auroc) = masked_auroc(
            &stack_rows(&all_logits, num_labels)?,
            &stack_rows(&all_targets, num_labels)?,
            &stack_rows(&all_masks, num_labels)?,
            &self.dataset.labels,
        );
        Ok(ValidationOutcome {
            loss,
            per_label,
            macro_auroc,
        })
    }

    fn checkpoint_if_improved(
        &mut self,
        epoch: usize,
        train_loss: f32,
        started: Instant,
        outcome: ValidationOutcome,
    ) -> anyhow::Result<TrainState> {
        let improved = outcome.loss < self.best_val;
        if improved {
            self.best_val = outcome.loss;
            self.wait = 0;
            let path = self.config.checkpoint_path();
            let meta = CheckpointMeta {
                epoch,
                val_loss: outcome.loss,
                tag: self.config.tag().to_string(),
                shape: self.model.encoder.shape(),
                num_labels: self.model.head.num_labels(),
            };
            save_checkpoint(&path, &self.model, &meta)?;
            self.best_checkpoint = Some(path);
        } else {
            self.wait += 1;
        }

        let lr = self.optimizer.groups()[0].lr;
        let elapsed_secs = started.elapsed().as_secs_f64();
        let num_epochs = self.config.num_epochs;
        info!(
            "Epoch {epoch:03}/{num_epochs} | Train: {train_loss:.4} | Val: {:.4} | AUROC: {:.4} | LR: {lr:.2e} | {elapsed_secs:.1}s{}",
            outcome.loss,
            outcome.macro_auroc,
            if improved { " *best*" } else { "" }
        );

        if epoch % 5 == 1 || improved || epoch == num_epochs {
            info!("  Per-label AUROC:");
            for (name, auc) in &outcome.per_label {
                if auc.is_nan() {
                    info!("    {name:<30} N/A");
                } else {
                    info!("    {name:<30} {auc:.4}");
                }
            }
        }

        self.history.push(EpochRecord {
            epoch,
            train_loss,
            val_loss: outcome.loss,
            macro_auroc: outcome.macro_auroc,
            lr,
            improved,
            elapsed_secs,
        });

        Ok(if self.wait >= self.config.patience {
            warn!(epoch, patience = self.config.patience, "early stopping triggered");
            TrainState::Stopped(StopReason::EarlyStopping { epoch })
        } else if epoch >= num_epochs {
            TrainState::Stopped(StopReason::EpochBudget)
        } else {
            TrainState::TrainingEpoch { epoch: epoch + 1 }
        })
    }
}

/// Load the configured dataset and feature source, then train.
pub fn run_training(config: TrainConfig) -> anyhow::Result<TerminalState> {
    config.validate()?;
    let dataset = LabelledDataset::load(
        &config.data_path,
        &config.labels,
        &config.drop_labels,
        config.embedding_column.as_deref(),
    )?;
    info!(rows = dataset.len(), labels = dataset.num_labels(), "dataset ready");

    let features = feature_source(&config, &dataset)?;
    Trainer::new(config, dataset, features)?.run()
}

fn feature_source(config: &TrainConfig, dataset: &LabelledDataset) -> anyhow::Result<Box<dyn FeatureSource>> {
    if let Some(rows) = dataset.embeddings.clone() {
        return Ok(Box::new(PrecomputedFeatures::new(rows)?));
    }
    image_feature_source(config, dataset)
}

#[cfg(feature = "onnx")]
fn image_feature_source(config: &TrainConfig, dataset: &LabelledDataset) -> anyhow::Result<Box<dyn FeatureSource>> {
    use crate::features::ImageFeatures;
    use crate::vision::{OnnxVisionEncoder, decode_grayscale};
    use clinsight_store::ImageLocator;

    let mut encoder = OnnxVisionEncoder::new(&config.model_dir);
    encoder.load()?;

    let mut locator = ImageLocator::new(&config.image_root);
    if let Some(img_data) = &config.img_data {
        locator = locator.with_img_data(img_data);
    }

    Ok(Box::new(
        ImageFeatures::new(locator, dataset.rel_paths.clone(), encoder, decode_grayscale)
            .with_workers(config.num_workers)
            .skip_missing_assets(config.skip_missing_assets),
    ))
}

#[cfg(not(feature = "onnx"))]
fn image_feature_source(_config: &TrainConfig, _dataset: &LabelledDataset) -> anyhow::Result<Box<dyn FeatureSource>> {
    anyhow::bail!(
        "no embedding_column configured and image features need the `onnx` feature; \
         rebuild with --features onnx or precompute embeddings"
    )
}
