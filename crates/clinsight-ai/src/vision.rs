//! ONNX Runtime vision backbone for chest radiographs.
//!
//! The model directory must contain `model.onnx` taking `[batch, 3, 224, 224]`
//! float input and producing either pooled `[batch, dim]` features or token
//! features `[batch, tokens, dim]`, in which case the first (class) token is used.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use crate::features::{FeatureExtractor, ImageArray};

pub const INPUT_SIZE: u32 = 224;
const CHANNELS: usize = 3;
const PIXEL_MEAN: f32 = 0.5;
const PIXEL_STD: f32 = 0.25;

/// Vision feature extractor backed by an ONNX model.
///
/// Construction is cheap; the session is created by [`load`](Self::load),
/// which may be called any number of times.
pub struct OnnxVisionEncoder {
    model_path: PathBuf,
    session: Option<Session>,
    dim: usize,
}

impl OnnxVisionEncoder {
    pub fn new(model_dir: &Path) -> Self {
        Self {
            model_path: model_dir.join("model.onnx"),
            session: None,
            dim: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn load(&mut self) -> anyhow::Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        anyhow::ensure!(
            self.model_path.exists(),
            "model.onnx not found at {}",
            self.model_path.display()
        );

        let session = Session::builder()?.commit_from_file(&self.model_path)?;
        self.dim = infer_dim(session.outputs()[0].dtype()).unwrap_or(768);
        info!(dim = self.dim, model = %self.model_path.display(), "loaded vision encoder");
        self.session = Some(session);
        Ok(())
    }

    fn session(&mut self) -> anyhow::Result<&mut Session> {
        self.load()?;
        self.session
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("vision session unavailable after load"))
    }
}

impl FeatureExtractor for OnnxVisionEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn extract_batch(&mut self, images: &[ImageArray]) -> anyhow::Result<Vec<Vec<f32>>> {
        if images.is_empty() {
            return Ok(vec![]);
        }
        let batch_size = images.len();
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;

        let mut input = Vec::with_capacity(batch_size * CHANNELS * plane);
        for img in images {
            input.extend(preprocess(img)?);
        }

        let shape = [batch_size as i64, CHANNELS as i64, INPUT_SIZE as i64, INPUT_SIZE as i64];
        let tensor = Tensor::from_array((shape, input.into_boxed_slice()))?;

        let session = self.session()?;
        let outputs = session.run(ort::inputs![tensor])?;
        let (output_shape, output_data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: &[i64] = output_shape;

        let (stride, dim) = match dims {
            [b, d] if *b as usize == batch_size => (*d as usize, *d as usize),
            [b, t, d] if *b as usize == batch_size => ((*t * *d) as usize, *d as usize),
            _ => anyhow::bail!("unexpected output shape: {dims:?} for batch of {batch_size}"),
        };

        // Class token (or pooled vector) is the first `dim` values of each sample.
        Ok((0..batch_size)
            .map(|i| output_data[i * stride..i * stride + dim].to_vec())
            .collect())
    }
}

/// Resize to 224×224, normalise and replicate the gray plane into 3 channels.
pub fn preprocess(img: &ImageArray) -> anyhow::Result<Vec<f32>> {
    let gray = image::GrayImage::from_raw(img.width, img.height, img.data.clone()).ok_or_else(|| {
        anyhow::anyhow!(
            "image buffer of {} bytes does not match {}x{}",
            img.data.len(),
            img.width,
            img.height
        )
    })?;
    let resized = image::imageops::resize(&gray, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let plane: Vec<f32> = resized
        .as_raw()
        .iter()
        .map(|&p| (p as f32 / 255.0 - PIXEL_MEAN) / PIXEL_STD)
        .collect();

    let mut out = Vec::with_capacity(plane.len() * CHANNELS);
    for _ in 0..CHANNELS {
        out.extend_from_slice(&plane);
    }
    Ok(out)
}

/// Decode any supported image file to 8-bit grayscale.
pub fn decode_grayscale(path: &Path) -> anyhow::Result<ImageArray> {
    let gray = image::open(path)?.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(ImageArray {
        width,
        height,
        data: gray.into_raw(),
    })
}

fn infer_dim(output_type: &ort::value::ValueType) -> Option<usize> {
    match output_type {
        ort::value::ValueType::Tensor { shape, .. } => shape
            .last()
            .and_then(|&d| if d > 0 { Some(d as usize) } else { None }),
        _ => None,
    }
}
