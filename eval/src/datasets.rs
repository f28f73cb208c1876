// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Test set and class mapping loading for classifier evaluation

use crate::error::{EvalError, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Side length images are resized to before inference and display
pub const TARGET_SIZE: u32 = 224;

/// A single test example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSample {
    /// Image path relative to the image directory
    pub image_id: String,
    /// Ground truth class index
    pub label: usize,
    /// Any further fields of the raw record
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestSample {
    pub fn new(image_id: impl Into<String>, label: usize) -> Self {
        Self {
            image_id: image_id.into(),
            label,
            extra: serde_json::Map::new(),
        }
    }
}

/// Class index to human readable name, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMapping {
    names: Vec<String>,
    inverse: HashMap<String, usize>,
}

impl ClassMapping {
    /// Build from an ordered list of class names
    pub fn from_names(names: Vec<String>) -> Self {
        let inverse = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self { names, inverse }
    }

    /// Build from the on-disk `{"0": "cat", "1": "dog"}` form.
    ///
    /// Keys must cover `0..n` without gaps. Non-string values are
    /// stringified.
    pub fn from_json_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let n_classes = map.len();
        let mut names = Vec::with_capacity(n_classes);

        for idx in 0..n_classes {
            let value = map.get(&idx.to_string()).ok_or_else(|| {
                EvalError::InvalidClassMapping(format!(
                    "missing class index {} (expected keys 0..{})",
                    idx, n_classes
                ))
            })?;
            let name = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            names.push(name);
        }

        Ok(Self::from_names(names))
    }

    /// Load `class_mapping.json`
    pub fn load(path: &Path) -> Result<Self> {
        let map: serde_json::Map<String, serde_json::Value> = load_json(path)?;
        Self::from_json_map(&map)
    }

    pub fn n_classes(&self) -> usize {
        self.names.len()
    }

    /// Class names ordered by index
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Inverse lookup; with duplicate names the highest index wins
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.inverse.get(name).copied()
    }
}

/// The ordered test split of a job
#[derive(Debug, Clone)]
pub struct TestSet {
    pub samples: Vec<TestSample>,
}

impl TestSet {
    /// Load `test_samples.json`
    pub fn load(path: &Path) -> Result<Self> {
        let samples: Vec<TestSample> = load_json(path)?;
        Ok(Self { samples })
    }

    /// Reject labels that fall outside the class mapping
    pub fn validate(&self, n_classes: usize) -> Result<()> {
        for sample in &self.samples {
            if sample.label >= n_classes {
                return Err(EvalError::LabelOutOfRange {
                    image_id: sample.image_id.clone(),
                    label: sample.label,
                    n_classes,
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ground truth labels in sample order
    pub fn y_true(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// Number of samples per class index
    pub fn label_distribution(&self, n_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; n_classes];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label) {
                *count += 1;
            }
        }
        counts
    }
}

/// Read and deserialize a JSON input file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(EvalError::MissingInput(path.to_path_buf()));
    }
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|source| EvalError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Load an image as RGB and resize it to `size` x `size`
pub fn load_image(path: &Path, size: u32) -> Result<RgbImage> {
    let img = image::open(path).map_err(|source| EvalError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.resize_exact(size, size, FilterType::Nearest).to_rgb8())
}
