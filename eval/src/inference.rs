// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Batched inference over the test set
//!
//! Implements:
//! - Per-backbone input preprocessing
//! - An ordered batch source over the test samples
//! - The classifier wrapper that drives prediction
//! - Derivation of predicted labels and their probabilities

use crate::config::WorkerConfig;
use crate::datasets::{load_image, TestSample, TARGET_SIZE};
use crate::error::{EvalError, Result};
use crate::gallery::SaliencyMap;
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A batch of preprocessed images in NHWC layout
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub data: Vec<f32>,
    /// `[n, height, width, channels]`
    pub shape: [usize; 4],
}

impl Batch {
    /// Stack equally sized preprocessed images
    pub fn from_images(images: Vec<Vec<f32>>, height: usize, width: usize) -> Self {
        let n = images.len();
        let data: Vec<f32> = images.into_iter().flatten().collect();
        Self {
            data,
            shape: [n, height, width, 3],
        }
    }

    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }
}

/// A trained model able to score a batch.
///
/// Returns one probability distribution per image, in batch order.
pub trait Classifier: Send + Sync {
    fn predict(&self, batch: &Batch) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Class activation map of `filter_index` at `layer_idx` for one
    /// preprocessed HWC image. Models without gradient access leave this
    /// unimplemented.
    fn class_activation_map(
        &self,
        layer_idx: usize,
        filter_index: usize,
        seed_input: &[f32],
        width: u32,
        height: u32,
    ) -> anyhow::Result<SaliencyMap> {
        let _ = (layer_idx, filter_index, seed_input, width, height);
        anyhow::bail!("class activation maps are not supported by this model")
    }
}

/// Input normalization expected by a pretrained backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preprocess {
    /// Scale to `[-1, 1]`
    Tf,
    /// RGB to BGR, subtract ImageNet channel means
    Caffe,
    /// Scale to `[0, 1]`, normalize by ImageNet mean and std
    Torch,
}

const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];
const TORCH_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const TORCH_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl Preprocess {
    /// Preprocessing for a backbone name, case-insensitive
    pub fn for_base_model(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "mobilenet" | "mobilenetv2" | "inceptionv3" | "inceptionresnetv2" | "xception"
            | "nasnetmobile" | "nasnetlarge" => Some(Preprocess::Tf),
            "resnet50" | "vgg16" | "vgg19" => Some(Preprocess::Caffe),
            "densenet121" | "densenet169" | "densenet201" => Some(Preprocess::Torch),
            _ => None,
        }
    }

    /// Normalize one pixel given as `[r, g, b]` in `0..=255`
    pub fn pixel(&self, rgb: [f32; 3]) -> [f32; 3] {
        match self {
            Preprocess::Tf => rgb.map(|v| v / 127.5 - 1.0),
            Preprocess::Caffe => [
                rgb[2] - CAFFE_MEAN_BGR[0],
                rgb[1] - CAFFE_MEAN_BGR[1],
                rgb[0] - CAFFE_MEAN_BGR[2],
            ],
            Preprocess::Torch => {
                let mut out = [0.0; 3];
                for c in 0..3 {
                    out[c] = (rgb[c] / 255.0 - TORCH_MEAN[c]) / TORCH_STD[c];
                }
                out
            }
        }
    }

    /// Normalize an RGB image into a flat HWC buffer
    pub fn apply(&self, img: &RgbImage) -> Vec<f32> {
        let mut out = Vec::with_capacity((img.width() * img.height() * 3) as usize);
        for p in img.pixels() {
            let rgb = [p[0] as f32, p[1] as f32, p[2] as f32];
            out.extend_from_slice(&self.pixel(rgb));
        }
        out
    }
}

/// Ordered, batched view over the test samples
pub struct BatchSource {
    samples: Vec<TestSample>,
    image_dir: PathBuf,
    batch_size: usize,
    n_classes: usize,
    preprocess: Preprocess,
}

impl BatchSource {
    pub fn new(
        samples: Vec<TestSample>,
        image_dir: &Path,
        batch_size: usize,
        n_classes: usize,
        preprocess: Preprocess,
    ) -> Self {
        Self {
            samples,
            image_dir: image_dir.to_path_buf(),
            batch_size: batch_size.max(1),
            n_classes,
            preprocess,
        }
    }

    /// Number of batches
    pub fn len(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Load, resize and preprocess batch `index`
    pub fn batch(&self, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.samples.len());
        let size = TARGET_SIZE as usize;

        let images = self.samples[start..end]
            .iter()
            .map(|sample| {
                let img = load_image(&self.image_dir.join(&sample.image_id), TARGET_SIZE)?;
                Ok(self.preprocess.apply(&img))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Batch::from_images(images, size, size))
    }
}

/// Classifier wrapper tying a backbone's preprocessing to a loaded model
pub struct ImageClassifier {
    base_model_name: String,
    n_classes: usize,
    preprocess: Preprocess,
    model: Option<Arc<dyn Classifier>>,
}

impl ImageClassifier {
    pub fn new(base_model_name: &str, n_classes: usize) -> Result<Self> {
        let preprocess = Preprocess::for_base_model(base_model_name)
            .ok_or_else(|| EvalError::UnknownBaseModel(base_model_name.to_string()))?;
        Ok(Self {
            base_model_name: base_model_name.to_string(),
            n_classes,
            preprocess,
            model: None,
        })
    }

    pub fn base_model_name(&self) -> &str {
        &self.base_model_name
    }

    pub fn set_model(&mut self, model: Arc<dyn Classifier>) {
        self.model = Some(model);
    }

    /// The loaded model, an error until [`set_model`](Self::set_model) ran
    pub fn model(&self) -> Result<&dyn Classifier> {
        self.model
            .as_deref()
            .ok_or_else(|| EvalError::external("inference", anyhow::anyhow!("no model set on classifier")))
    }

    pub fn get_preprocess_input(&self) -> Preprocess {
        self.preprocess
    }

    /// Predict every batch of `source` exactly once, in order.
    ///
    /// With more than one worker, groups of `workers` batches are loaded
    /// concurrently; forward passes always run in batch order.
    pub fn predict_generator(
        &self,
        source: &BatchSource,
        workers: WorkerConfig,
        verbose: bool,
    ) -> Result<Vec<Vec<f32>>> {
        let model = self.model()?;

        let n_batches = source.len();
        let n_workers = workers.effective_workers();
        let pb = progress_bar(n_batches as u64, verbose);

        let pool = if n_workers > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n_workers)
                    .build()
                    .map_err(|e| EvalError::external("worker pool", e.into()))?,
            )
        } else {
            None
        };

        let mut distributions = Vec::with_capacity(source.n_samples());
        let indices: Vec<usize> = (0..n_batches).collect();

        for group in indices.chunks(n_workers) {
            let batches: Vec<Batch> = match &pool {
                Some(pool) => pool.install(|| {
                    group
                        .par_iter()
                        .map(|&idx| source.batch(idx))
                        .collect::<Result<Vec<_>>>()
                })?,
                None => group
                    .iter()
                    .map(|&idx| source.batch(idx))
                    .collect::<Result<Vec<_>>>()?,
            };

            for batch in &batches {
                let probs = model
                    .predict(batch)
                    .map_err(|e| EvalError::external("inference", e))?;
                check_shape(&probs, batch.len(), self.n_classes)?;
                distributions.extend(probs);
                pb.inc(1);
            }
            tracing::debug!("Predicted {}/{} samples", distributions.len(), source.n_samples());
        }

        pb.finish_and_clear();
        Ok(distributions)
    }
}

fn check_shape(probs: &[Vec<f32>], expected_rows: usize, n_classes: usize) -> Result<()> {
    if probs.len() != expected_rows {
        return Err(EvalError::ShapeMismatch(format!(
            "model returned {} rows for a batch of {}",
            probs.len(),
            expected_rows
        )));
    }
    if let Some(row) = probs.iter().find(|row| row.len() != n_classes) {
        return Err(EvalError::ShapeMismatch(format!(
            "distribution of length {}, expected {}",
            row.len(),
            n_classes
        )));
    }
    Ok(())
}

fn progress_bar(len: u64, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} batches ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Index of the first maximum
pub fn argmax(dist: &[f32]) -> usize {
    let mut best = 0;
    for (idx, value) in dist.iter().enumerate() {
        if *value > dist[best] {
            best = idx;
        }
    }
    best
}

/// Predicted labels and their probabilities, derived from distributions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub distributions: Vec<Vec<f32>>,
    pub y_pred: Vec<usize>,
    pub y_pred_prob: Vec<f32>,
}

impl Predictions {
    pub fn from_distributions(distributions: Vec<Vec<f32>>) -> Self {
        let y_pred: Vec<usize> = distributions.iter().map(|d| argmax(d)).collect();
        let y_pred_prob = distributions
            .iter()
            .zip(&y_pred)
            .map(|(dist, &idx)| dist.get(idx).copied().unwrap_or(0.0))
            .collect();
        Self {
            distributions,
            y_pred,
            y_pred_prob,
        }
    }

    pub fn len(&self) -> usize {
        self.y_pred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_pred.is_empty()
    }
}
