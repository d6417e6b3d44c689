use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use clinsight_ai::TrainConfig;
use clinsight_core::findings::default_label_cols;
use clinsight_core::{LabelResolver, PolicyDocument};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(feature = "onnx")]
mod embed;
mod report;

#[derive(Parser)]
#[command(name = "clinsight")]
#[command(about = "CheXpert label policies and masked multi-label training")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert the CheXpert index CSV into the base Parquet table
    Ingest {
        /// CheXpert index CSV (e.g. train.csv)
        #[arg(long)]
        csv: PathBuf,

        /// Output Parquet path
        #[arg(long, default_value = "data/processed/chexpert/base.parquet")]
        out: PathBuf,
    },

    /// Resolve raw labels under one or more policy variants
    Resolve {
        /// Base Parquet table from `ingest`
        #[arg(long)]
        input: PathBuf,

        /// Policy document (JSON with `label_cols` and `variants`)
        #[arg(long, env = "CLINSIGHT_POLICY")]
        policy: PathBuf,

        /// Variant to resolve; repeat for several. All variants when omitted.
        #[arg(long)]
        variant: Vec<String>,

        /// Directory for `dataset_<tag>.parquet` outputs
        #[arg(long, default_value = "data/processed/chexpert")]
        out_dir: PathBuf,
    },

    /// Precompute image features into an `embedding` column
    #[cfg(feature = "onnx")]
    Embed(embed::EmbedArgs),

    /// Train the masked multi-label classifier
    Train(TrainArgs),
}

/// Command-line overrides applied on top of the config file.
#[derive(Args)]
struct TrainArgs {
    /// JSON training config; every key is optional
    #[arg(short, long, env = "CLINSIGHT_TRAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Resolved label table
    #[arg(long)]
    data: Option<PathBuf>,

    /// Train encoder and head instead of the head alone
    #[arg(long)]
    finetune: bool,

    /// Unfreeze encoder blocks from this index onward (implies --finetune)
    #[arg(long)]
    unfreeze_from: Option<usize>,

    /// Initialise from a checkpoint (e.g. the frozen-encoder best)
    #[arg(long)]
    init_checkpoint: Option<PathBuf>,

    /// Use precomputed features from this column
    #[arg(long)]
    embedding_column: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    max_samples: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    skip_missing_assets: bool,

    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl TrainArgs {
    fn into_config(self) -> anyhow::Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load(path)?,
            None => TrainConfig::default(),
        };
        if let Some(v) = self.data {
            config.data_path = v;
        }
        if self.finetune || self.unfreeze_from.is_some() {
            config.freeze_encoder = false;
        }
        if self.unfreeze_from.is_some() {
            config.unfreeze_from_block = self.unfreeze_from;
        }
        if self.init_checkpoint.is_some() {
            config.init_checkpoint = self.init_checkpoint;
        }
        if self.embedding_column.is_some() {
            config.embedding_column = self.embedding_column;
        }
        if let Some(v) = self.epochs {
            config.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if self.max_samples.is_some() {
            config.max_samples = self.max_samples;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if self.skip_missing_assets {
            config.skip_missing_assets = true;
        }
        if let Some(v) = self.checkpoint_dir {
            config.checkpoint_dir = v;
        }
        if let Some(v) = self.log_dir {
            config.log_dir = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { csv, out } => {
            init_logging(None)?;
            cmd_ingest(&csv, &out)
        }
        Commands::Resolve {
            input,
            policy,
            variant,
            out_dir,
        } => {
            init_logging(None)?;
            cmd_resolve(&input, &policy, &variant, &out_dir)
        }
        #[cfg(feature = "onnx")]
        Commands::Embed(args) => {
            init_logging(None)?;
            embed::run(args)
        }
        Commands::Train(args) => {
            let config = args.into_config()?;
            let log_path = train_log_path(&config.log_dir, config.tag());
            init_logging(Some(&log_path))?;
            info!("log file: {}", log_path.display());
            cmd_train(config)
        }
    }
}

/// `<log_dir>/train_<tag>_<YYYYmmdd_HHMMSS>.log`
fn train_log_path(log_dir: &Path, tag: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    log_dir.join(format!("train_{tag}_{stamp}.log"))
}

/// Console logging at INFO, optionally teed to a file.
fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = File::create(path).with_context(|| format!("creating log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(LevelFilter::INFO)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn cmd_ingest(csv: &Path, out: &Path) -> anyhow::Result<()> {
    let labels = default_label_cols();
    let batches = clinsight_store::read_chexpert_csv(csv, &labels)?;
    clinsight_store::write_parquet(out, &batches)?;

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    info!(rows, out = %out.display(), "base table written");
    Ok(())
}

fn cmd_resolve(input: &Path, policy: &Path, variants: &[String], out_dir: &Path) -> anyhow::Result<()> {
    let doc = PolicyDocument::load(policy)?;
    let names: Vec<String> = if variants.is_empty() {
        doc.variant_names().into_iter().map(String::from).collect()
    } else {
        variants.to_vec()
    };
    anyhow::ensure!(!names.is_empty(), "policy {} defines no variants", policy.display());

    let batches = clinsight_store::read_parquet(input)?;

    for name in &names {
        let resolver = LabelResolver::from_document(&doc, name)?;
        let tag = resolver.config().tag();
        info!(variant = %name, tag = %tag, "resolving");

        let mut resolved_batches = Vec::with_capacity(batches.len());
        let mut records = Vec::new();
        for batch in &batches {
            let (out, resolved) = resolver.resolve_batch(batch)?;
            resolved_batches.push(out);
            records.extend(resolved);
        }

        let out = out_dir.join(format!("dataset_{tag}.parquet"));
        clinsight_store::write_parquet(&out, &resolved_batches)?;

        let semantic = clinsight_core::semantic_checks(&records);
        report::log_semantic_report(&tag, &semantic)?;
        info!(out = %out.display(), "resolved table written");
    }
    Ok(())
}

fn cmd_train(config: TrainConfig) -> anyhow::Result<()> {
    info!(
        data = %config.data_path.display(),
        tag = config.tag(),
        "training config: {}",
        serde_json::to_string(&config)?
    );
    let result = clinsight_ai::run_training(config)?;

    report::log_history(&result.history)?;
    info!(
        best_val_loss = result.best_val_loss,
        epochs = result.epochs_run,
        reason = %result.stop_reason,
        "Training complete. Best Val Loss: {:.4}",
        result.best_val_loss
    );
    match &result.best_checkpoint_path {
        Some(path) => info!("Best checkpoint: {}", path.display()),
        None => info!("No checkpoint written"),
    }
    Ok(())
}
