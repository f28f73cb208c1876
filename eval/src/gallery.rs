// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Correct / wrong example extraction and saliency overlays

use crate::datasets::{ClassMapping, TestSample};
use crate::error::{EvalError, Result};
use crate::figures::jet;
use crate::inference::Classifier;
use image::RgbImage;

/// Layer whose activations drive the class activation map
pub const SALIENCY_LAYER_IDX: usize = 89;

/// Opacity of the saliency map drawn over the image
pub const OVERLAY_ALPHA: f32 = 0.7;

/// Default maximum number of gallery rows
pub const N_PLOT: usize = 20;

/// A class given either by index or by its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelQuery {
    Index(usize),
    Name(String),
}

impl LabelQuery {
    /// Resolve to a class index through the class mapping
    pub fn resolve(&self, mapping: &ClassMapping) -> Result<usize> {
        match self {
            LabelQuery::Index(idx) if *idx < mapping.n_classes() => Ok(*idx),
            LabelQuery::Index(idx) => Err(EvalError::UnknownLabel(format!(
                "index {} out of range 0..{}",
                idx,
                mapping.n_classes()
            ))),
            LabelQuery::Name(name) => mapping
                .index_of(name)
                .ok_or_else(|| EvalError::UnknownLabel(format!("class name {:?}", name))),
        }
    }
}

impl From<usize> for LabelQuery {
    fn from(idx: usize) -> Self {
        LabelQuery::Index(idx)
    }
}

impl From<&str> for LabelQuery {
    fn from(name: &str) -> Self {
        LabelQuery::Name(name.to_string())
    }
}

impl From<String> for LabelQuery {
    fn from(name: String) -> Self {
        LabelQuery::Name(name)
    }
}

/// A test example with its position in the test set and its resized image
#[derive(Debug, Clone)]
pub struct ExampleImage {
    pub index: usize,
    pub image: RgbImage,
    pub sample: TestSample,
}

/// Positions of samples of `label`, split into correctly and wrongly predicted
pub fn partition_indices(y_true: &[usize], y_pred: &[usize], label: usize) -> (Vec<usize>, Vec<usize>) {
    let mut correct = Vec::new();
    let mut wrong = Vec::new();
    for (i, (&t, &p)) in y_true.iter().zip(y_pred).enumerate() {
        if t != label {
            continue;
        }
        if t == p {
            correct.push(i);
        } else {
            wrong.push(i);
        }
    }
    (correct, wrong)
}

/// Caption of a gallery tile
pub fn tile_caption(mapping: &ClassMapping, true_label: usize, pred_label: usize, prob: f32) -> String {
    format!(
        "true: {}, predicted: {} ({})",
        mapping.name(true_label).unwrap_or("?"),
        mapping.name(pred_label).unwrap_or("?"),
        round2(prob)
    )
}

fn round2(v: f32) -> f64 {
    (v as f64 * 100.0).round() / 100.0
}

/// Pixel importance for one image, row-major, same size as the image
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    pub width: u32,
    pub height: u32,
    pub values: Vec<f32>,
}

/// Class activation map routine
pub trait Saliency {
    /// Map for `filter_index` given a preprocessed HWC `seed_input`
    fn visualize_cam(
        &self,
        model: &dyn Classifier,
        layer_idx: usize,
        filter_index: usize,
        seed_input: &[f32],
        width: u32,
        height: u32,
    ) -> anyhow::Result<SaliencyMap>;
}

/// Saliency computed by the model itself
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSaliency;

impl Saliency for ModelSaliency {
    fn visualize_cam(
        &self,
        model: &dyn Classifier,
        layer_idx: usize,
        filter_index: usize,
        seed_input: &[f32],
        width: u32,
        height: u32,
    ) -> anyhow::Result<SaliencyMap> {
        model.class_activation_map(layer_idx, filter_index, seed_input, width, height)
    }
}

/// Colorize `map` with jet and alpha-blend it over `img`
pub fn overlay(img: &RgbImage, map: &SaliencyMap, alpha: f32) -> Result<RgbImage> {
    let (w, h) = img.dimensions();
    if map.width != w || map.height != h || map.values.len() != (w * h) as usize {
        return Err(EvalError::ShapeMismatch(format!(
            "saliency map {}x{} ({} values) for image {}x{}",
            map.width,
            map.height,
            map.values.len(),
            w,
            h
        )));
    }

    let (lo, hi) = map
        .values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = hi - lo;

    let mut out = img.clone();
    for (i, pixel) in out.pixels_mut().enumerate() {
        let t = if span > 0.0 { (map.values[i] - lo) / span } else { 0.0 };
        let (r, g, b) = jet(t as f64);
        for (c, heat) in [r, g, b].into_iter().enumerate() {
            let base = pixel[c] as f32;
            pixel[c] = ((1.0 - alpha) * base + alpha * heat as f32).round() as u8;
        }
    }
    Ok(out)
}
