//! Feature sources feeding the trainer.
//!
//! The trainer asks for feature vectors by dataset row. Vectors come either
//! from a precomputed embedding column or from decoding images on disk and
//! running them through a [`FeatureExtractor`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clinsight_store::{ImageLocator, StoreError};
use tracing::{debug, warn};

/// A decoded 8-bit grayscale image, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageArray {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Maps decoded images to fixed-length feature vectors.
pub trait FeatureExtractor {
    fn dim(&self) -> usize;

    fn extract_batch(&mut self, images: &[ImageArray]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Feature vectors by dataset row. `None` marks a row skipped for this batch.
pub trait FeatureSource {
    fn dim(&self) -> usize;

    fn load(&mut self, rows: &[usize]) -> anyhow::Result<Vec<Option<Vec<f32>>>>;
}

/// Features read up front from the label table.
pub struct PrecomputedFeatures {
    rows: Vec<Vec<f32>>,
    dim: usize,
}

impl PrecomputedFeatures {
    pub fn new(rows: Vec<Vec<f32>>) -> anyhow::Result<Self> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != dim) {
            anyhow::bail!("feature row {bad} has {} values, expected {dim}", rows[bad].len());
        }
        Ok(Self { rows, dim })
    }
}

impl FeatureSource for PrecomputedFeatures {
    fn dim(&self) -> usize {
        self.dim
    }

    fn load(&mut self, rows: &[usize]) -> anyhow::Result<Vec<Option<Vec<f32>>>> {
        rows.iter()
            .map(|&r| {
                self.rows
                    .get(r)
                    .cloned()
                    .map(Some)
                    .with_context(|| format!("no precomputed features for row {r}"))
            })
            .collect()
    }
}

pub type DecodeFn = fn(&Path) -> anyhow::Result<ImageArray>;

/// Locates, decodes and extracts features for image rows.
///
/// Decoding fans out over `num_workers` scoped threads, each writing into the
/// slot of its own sample. Extracted vectors are cached per row, since the
/// extractor itself is not trained. The cache holds at most `cache_limit`
/// rows; once full, further rows are extracted on every load.
pub struct ImageFeatures<E> {
    locator: ImageLocator,
    rel_paths: Vec<String>,
    extractor: E,
    decode: DecodeFn,
    num_workers: usize,
    skip_missing: bool,
    cache_limit: usize,
    cache: HashMap<usize, Vec<f32>>,
}

impl<E: FeatureExtractor> ImageFeatures<E> {
    pub fn new(locator: ImageLocator, rel_paths: Vec<String>, extractor: E, decode: DecodeFn) -> Self {
        Self {
            locator,
            rel_paths,
            extractor,
            decode,
            num_workers: 1,
            skip_missing: false,
            cache_limit: usize::MAX,
            cache: HashMap::new(),
        }
    }

    /// Cap the number of cached rows. 0 disables caching, for single-pass use.
    pub fn with_cache_limit(mut self, rows: usize) -> Self {
        self.cache_limit = rows;
        self
    }

    pub fn cached_rows(&self) -> usize {
        self.cache.len()
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Drop rows whose image is missing instead of failing the run.
    pub fn skip_missing_assets(mut self, skip: bool) -> Self {
        self.skip_missing = skip;
        self
    }

    fn locate(&self, row: usize) -> anyhow::Result<Result<PathBuf, StoreError>> {
        let rel = self
            .rel_paths
            .get(row)
            .with_context(|| format!("no image path for row {row}"))?;
        Ok(self.locator.resolve(rel))
    }

    /// Decode every pending row, `num_workers` at a time.
    fn decode_rows(&self, pending: &[(usize, PathBuf)]) -> Vec<anyhow::Result<ImageArray>> {
        let mut slots: Vec<Option<anyhow::Result<ImageArray>>> = pending.iter().map(|_| None).collect();
        let chunk = pending.len().div_ceil(self.num_workers).max(1);
        let decode = self.decode;

        std::thread::scope(|s| {
            for (slot_chunk, work) in slots.chunks_mut(chunk).zip(pending.chunks(chunk)) {
                s.spawn(move || {
                    for (slot, (_, path)) in slot_chunk.iter_mut().zip(work) {
                        *slot = Some(decode(path).with_context(|| format!("decoding {}", path.display())));
                    }
                });
            }
        });

        slots
            .into_iter()
            .map(|s| s.unwrap_or_else(|| Err(anyhow::anyhow!("decode worker produced no result"))))
            .collect()
    }
}

impl<E: FeatureExtractor> FeatureSource for ImageFeatures<E> {
    fn dim(&self) -> usize {
        self.extractor.dim()
    }

    fn load(&mut self, rows: &[usize]) -> anyhow::Result<Vec<Option<Vec<f32>>>> {
        let mut pending = Vec::new();
        let mut fresh: HashMap<usize, Vec<f32>> = HashMap::new();
        for &row in rows {
            if self.cache.contains_key(&row) || pending.iter().any(|(r, _)| *r == row) {
                continue;
            }
            match self.locate(row)? {
                Ok(path) => pending.push((row, path)),
                Err(err @ StoreError::MissingAsset { .. }) if self.skip_missing => {
                    warn!(row, error = %err, "skipping sample with missing image");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !pending.is_empty() {
            let decoded = self.decode_rows(&pending);
            let mut images = Vec::with_capacity(decoded.len());
            for img in decoded {
                images.push(img?);
            }
            let features = self.extractor.extract_batch(&images)?;
            anyhow::ensure!(
                features.len() == images.len(),
                "extractor returned {} vectors for {} images",
                features.len(),
                images.len()
            );
            debug!(decoded = images.len(), "extracted image features");
            fresh = pending.into_iter().map(|(row, _)| row).zip(features).collect();
        }

        let out = rows
            .iter()
            .map(|r| fresh.get(r).or_else(|| self.cache.get(r)).cloned())
            .collect();

        let room = self.cache_limit.saturating_sub(self.cache.len());
        self.cache.extend(fresh.into_iter().take(room));
        Ok(out)
    }
}
