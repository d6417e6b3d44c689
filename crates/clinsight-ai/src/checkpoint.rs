//! Model checkpoints as Arrow IPC files.
//!
//! One row per parameter tensor: `name`, `group`, `trainable`, `values`.
//! Run details (epoch, validation loss, tag, model shape) live in the schema
//! metadata.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use arrow::array::{Array, BooleanArray, Float32Array, Float32Builder, ListArray, ListBuilder, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use ndarray::Array2;
use tracing::info;

use crate::model::{ChestXrayClassifier, EncoderShape};

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub val_loss: f32,
    pub tag: String,
    pub shape: EncoderShape,
    pub num_labels: usize,
}

impl CheckpointMeta {
    fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("epoch".to_string(), self.epoch.to_string()),
            ("val_loss".to_string(), self.val_loss.to_string()),
            ("tag".to_string(), self.tag.clone()),
            ("in_dim".to_string(), self.shape.in_dim.to_string()),
            ("hidden_dim".to_string(), self.shape.hidden_dim.to_string()),
            ("num_blocks".to_string(), self.shape.num_blocks.to_string()),
            ("num_labels".to_string(), self.num_labels.to_string()),
        ])
    }

    fn from_metadata(md: &HashMap<String, String>) -> anyhow::Result<Self> {
        fn field<T: std::str::FromStr>(md: &HashMap<String, String>, key: &str) -> anyhow::Result<T> {
            md.get(key)
                .with_context(|| format!("checkpoint metadata missing {key:?}"))?
                .parse()
                .map_err(|_| anyhow::anyhow!("checkpoint metadata {key:?} is malformed"))
        }
        Ok(Self {
            epoch: field(md, "epoch")?,
            val_loss: field(md, "val_loss")?,
            tag: md.get("tag").cloned().unwrap_or_default(),
            shape: EncoderShape {
                in_dim: field(md, "in_dim")?,
                hidden_dim: field(md, "hidden_dim")?,
                num_blocks: field(md, "num_blocks")?,
            },
            num_labels: field(md, "num_labels")?,
        })
    }
}

fn checkpoint_schema(meta: &CheckpointMeta) -> Schema {
    Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("group", DataType::Utf8, false),
        Field::new("trainable", DataType::Boolean, false),
        Field::new(
            "values",
            DataType::List(Arc::new(Field::new("item", DataType::Float32, true))),
            true,
        ),
    ])
    .with_metadata(meta.to_metadata())
}

/// Write every parameter of `model` to `path`, creating parent directories.
pub fn save_checkpoint(path: &Path, model: &ChestXrayClassifier, meta: &CheckpointMeta) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let mut names = Vec::new();
    let mut groups = Vec::new();
    let mut trainable = Vec::new();
    let mut values = ListBuilder::new(Float32Builder::new());
    for g in model.param_groups() {
        for p in &g.params {
            names.push(p.name.clone());
            groups.push(g.name.clone());
            trainable.push(p.requires_grad);
            values.values().extend(p.data.iter().map(|&v| Some(v)));
            values.append(true);
        }
    }

    let schema = Arc::new(checkpoint_schema(meta));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(names)),
            Arc::new(StringArray::from(groups)),
            Arc::new(BooleanArray::from(trainable)),
            Arc::new(values.finish()),
        ],
    )?;

    let file = File::create(path).with_context(|| format!("creating checkpoint {}", path.display()))?;
    let mut writer = FileWriter::try_new(file, &schema)?;
    writer.write(&batch)?;
    writer.finish()?;

    info!(path = %path.display(), epoch = meta.epoch, val_loss = meta.val_loss, "saved checkpoint");
    Ok(())
}

/// Load parameter values into `model`. Shapes must match; trainable flags on
/// the model are left as they are.
pub fn load_checkpoint(path: &Path, model: &mut ChestXrayClassifier) -> anyhow::Result<CheckpointMeta> {
    let file = File::open(path).with_context(|| format!("opening checkpoint {}", path.display()))?;
    let reader = FileReader::try_new(file, None)?;
    let meta = CheckpointMeta::from_metadata(reader.schema().metadata())?;

    anyhow::ensure!(
        meta.shape == model.encoder.shape() && meta.num_labels == model.head.num_labels(),
        "checkpoint {} has shape {:?} with {} labels, model has {:?} with {} labels",
        path.display(),
        meta.shape,
        meta.num_labels,
        model.encoder.shape(),
        model.head.num_labels()
    );

    let mut stored: HashMap<String, Vec<f32>> = HashMap::new();
    for batch in reader {
        let batch = batch?;
        let names = column::<StringArray>(&batch, "name")?;
        let values = column::<ListArray>(&batch, "values")?;
        for row in 0..batch.num_rows() {
            let list = values.value(row);
            let floats = list
                .as_any()
                .downcast_ref::<Float32Array>()
                .context("checkpoint values are not Float32")?;
            stored.insert(names.value(row).to_string(), floats.values().to_vec());
        }
    }

    for g in model.param_groups_mut() {
        for p in &mut g.params {
            let data = stored
                .remove(&p.name)
                .with_context(|| format!("checkpoint {} has no parameter {:?}", path.display(), p.name))?;
            anyhow::ensure!(
                data.len() == p.len(),
                "parameter {:?}: checkpoint has {} values, model expects {}",
                p.name,
                data.len(),
                p.len()
            );
            p.data = Array2::from_shape_vec(p.data.raw_dim(), data)?;
        }
    }

    info!(path = %path.display(), epoch = meta.epoch, tag = %meta.tag, "loaded checkpoint");
    Ok(meta)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> anyhow::Result<&'a T> {
    batch
        .column_by_name(name)
        .with_context(|| format!("checkpoint missing column {name:?}"))?
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("checkpoint column {name:?} has unexpected type"))
}
