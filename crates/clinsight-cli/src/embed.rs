//! Feature precompute: reads a label table, encodes each image with the ONNX
//! vision backbone and writes the table back with a `FixedSizeList<Float32>`
//! feature column.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use arrow::array::{Array, ArrayRef, BooleanArray, FixedSizeListBuilder, Float32Builder};
use arrow::compute::filter_record_batch;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use clap::Args;
use clinsight_ai::features::{FeatureExtractor, FeatureSource, ImageFeatures};
use clinsight_ai::vision::{OnnxVisionEncoder, decode_grayscale};
use clinsight_core::table::{PATH_COLUMNS, get_string};
use clinsight_store::ImageLocator;
use tracing::{info, warn};

#[derive(Args)]
pub struct EmbedArgs {
    /// Label table to extend (base or resolved)
    #[arg(long)]
    input: PathBuf,

    /// Output Parquet path
    #[arg(long)]
    out: PathBuf,

    /// Dataset root used to resolve image paths
    #[arg(long, default_value = "data/raw")]
    image_root: PathBuf,

    /// Separate image directory, if different from the dataset root
    #[arg(long)]
    img_data: Option<PathBuf>,

    /// Directory containing model.onnx
    #[arg(long, default_value = "models/vision-encoder", env = "CLINSIGHT_VISION_MODEL")]
    model_dir: PathBuf,

    /// Name of the feature column to write
    #[arg(long, default_value = "embedding")]
    column: String,

    #[arg(long, default_value = "32")]
    batch_size: usize,

    #[arg(long, default_value = "4")]
    workers: usize,

    /// Drop rows whose image cannot be found instead of failing
    #[arg(long)]
    skip_missing_assets: bool,
}

pub fn run(args: EmbedArgs) -> anyhow::Result<()> {
    let start = Instant::now();

    let source_batches = clinsight_store::read_parquet(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let total_rows: usize = source_batches.iter().map(|b| b.num_rows()).sum();
    anyhow::ensure!(total_rows > 0, "{} has no rows", args.input.display());

    let mut encoder = OnnxVisionEncoder::new(&args.model_dir);
    encoder.load()?;
    let dim = encoder.dim();

    let mut locator = ImageLocator::new(&args.image_root);
    if let Some(img_data) = &args.img_data {
        locator = locator.with_img_data(img_data);
    }

    let rel_paths = collect_rel_paths(&source_batches)?;
    let mut features = ImageFeatures::new(locator, rel_paths, encoder, decode_grayscale)
        .with_workers(args.workers)
        .skip_missing_assets(args.skip_missing_assets)
        .with_cache_limit(0);

    let mut output_batches = Vec::with_capacity(source_batches.len());
    let mut offset = 0usize;
    let mut skipped = 0usize;

    for batch in &source_batches {
        let n = batch.num_rows();
        let mut vectors = Vec::with_capacity(n);
        for chunk_start in (0..n).step_by(args.batch_size.max(1)) {
            let chunk_end = (chunk_start + args.batch_size.max(1)).min(n);
            let rows: Vec<usize> = (offset + chunk_start..offset + chunk_end).collect();
            vectors.extend(features.load(&rows)?);
            info!(done = offset + chunk_end, total = total_rows, "embedded");
        }

        let keep = BooleanArray::from(vectors.iter().map(Option::is_some).collect::<Vec<_>>());
        skipped += keep.len() - keep.true_count();
        let kept = filter_record_batch(batch, &keep)?;
        output_batches.push(with_feature_column(&kept, &args.column, dim, vectors.into_iter().flatten())?);
        offset += n;
    }

    if skipped > 0 {
        warn!(skipped, "rows dropped for missing images");
    }
    clinsight_store::write_parquet(&args.out, &output_batches)?;

    info!(
        rows = total_rows - skipped,
        dim,
        out = %args.out.display(),
        elapsed_secs = start.elapsed().as_secs_f64(),
        "feature table written"
    );
    Ok(())
}

fn collect_rel_paths(batches: &[RecordBatch]) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for batch in batches {
        let col = PATH_COLUMNS
            .iter()
            .find_map(|name| batch.column_by_name(name))
            .with_context(|| format!("no image path column (tried {PATH_COLUMNS:?})"))?;
        for row in 0..col.len() {
            out.push(get_string(col.as_ref(), row).with_context(|| format!("null image path at row {row}"))?);
        }
    }
    Ok(out)
}

/// Append (or replace) the feature column.
fn with_feature_column(
    batch: &RecordBatch,
    column: &str,
    dim: usize,
    vectors: impl Iterator<Item = Vec<f32>>,
) -> anyhow::Result<RecordBatch> {
    let mut builder = FixedSizeListBuilder::new(Float32Builder::new(), dim as i32);
    for v in vectors {
        anyhow::ensure!(v.len() == dim, "feature vector has {} values, expected {dim}", v.len());
        builder.values().append_slice(&v);
        builder.append(true);
    }

    let source_schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(source_schema.fields().len() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(source_schema.fields().len() + 1);
    for (field, col) in source_schema.fields().iter().zip(batch.columns()) {
        if field.name() != column {
            fields.push(field.as_ref().clone());
            columns.push(col.clone());
        }
    }
    fields.push(Field::new(
        column,
        DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim as i32),
        true,
    ));
    columns.push(Arc::new(builder.finish()));

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}
