// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Checkpoint discovery and best-model selection
//!
//! Checkpoints are written by the trainer as
//! `<prefix>_<model>_<epoch>_<val_acc>...<ext>`, e.g.
//! `model_mobilenet_03_0.743.hdf5`. The accuracy token is the first five
//! characters of the fourth `_`-delimited field; the checkpoint with the
//! greatest token is considered best.

use crate::error::{EvalError, Result};
use crate::inference::Classifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Loads a checkpoint file into a usable inference model
pub trait ModelLoader {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Classifier>>;
}

/// Where the accuracy token lives in a checkpoint filename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointNameFormat {
    pub delimiter: char,
    /// Zero-based field index after splitting on `delimiter`
    pub field: usize,
    /// Number of leading characters of the field that form the token
    pub token_len: usize,
}

impl CheckpointNameFormat {
    /// Naming used by the trainer since the first release
    pub const V1: Self = Self {
        delimiter: '_',
        field: 3,
        token_len: 5,
    };

    /// Extract the accuracy token from a file name
    pub fn parse_token(&self, file_name: &str) -> Result<String> {
        let field = file_name.split(self.delimiter).nth(self.field).ok_or_else(|| {
            EvalError::CheckpointName {
                name: file_name.to_string(),
                format: self.to_string(),
                reason: format!("fewer than {} fields", self.field + 1),
            }
        })?;

        let token: String = field.chars().take(self.token_len).collect();
        if token.is_empty() {
            return Err(EvalError::CheckpointName {
                name: file_name.to_string(),
                format: self.to_string(),
                reason: "empty accuracy field".to_string(),
            });
        }
        Ok(token)
    }
}

impl Default for CheckpointNameFormat {
    fn default() -> Self {
        Self::V1
    }
}

impl fmt::Display for CheckpointNameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {} of {:?}-delimited name, first {} chars",
            self.field + 1,
            self.delimiter,
            self.token_len
        )
    }
}

/// A checkpoint file together with its parsed accuracy token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCandidate {
    pub path: PathBuf,
    pub token: String,
}

impl CheckpointCandidate {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The token read as a number, when it is one
    pub fn accuracy(&self) -> Option<f64> {
        self.token.parse().ok()
    }
}

/// Recursively list checkpoint files with the given extension, in path order
pub fn find_checkpoints(models_dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(models_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    files
}

/// Parse every file name; any name off the contract is an error
pub fn parse_candidates(
    files: &[PathBuf],
    format: &CheckpointNameFormat,
) -> Result<Vec<CheckpointCandidate>> {
    files
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(CheckpointCandidate {
                path: path.clone(),
                token: format.parse_token(&name)?,
            })
        })
        .collect()
}

/// Index of the candidate with the greatest token; ties go to the earliest
pub fn select_best(candidates: &[CheckpointCandidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, candidate) in candidates.iter().enumerate() {
        match best {
            Some(b) if candidates[b].token >= candidate.token => {}
            _ => best = Some(idx),
        }
    }
    best
}

/// Find and rank the checkpoints under `<job_dir>/models`
pub fn resolve_best_checkpoint(
    job_dir: &Path,
    extension: &str,
    format: &CheckpointNameFormat,
) -> Result<CheckpointCandidate> {
    let models_dir = job_dir.join("models");
    let files = find_checkpoints(&models_dir, extension);
    let candidates = parse_candidates(&files, format)?;
    let best = select_best(&candidates).ok_or(EvalError::NoCheckpoints(models_dir))?;
    Ok(candidates[best].clone())
}

/// SHA-256 of a file, hex encoded
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// The selected checkpoint and the model loaded from it
pub struct BestModel {
    pub checkpoint: CheckpointCandidate,
    pub sha256: String,
    pub model: Arc<dyn Classifier>,
}

impl BestModel {
    /// Resolve the best checkpoint of a job and load it
    pub fn load(
        job_dir: &Path,
        extension: &str,
        loader: &dyn ModelLoader,
    ) -> Result<Self> {
        tracing::info!("****** Load model ******");

        let checkpoint =
            resolve_best_checkpoint(job_dir, extension, &CheckpointNameFormat::V1)?;
        let path = checkpoint.path.canonicalize()?;
        let sha256 = sha256_file(&path)?;
        let model = loader
            .load(&path)
            .map_err(|e| EvalError::external("model load", e))?;

        tracing::info!("loaded {}", path.display());

        Ok(Self {
            checkpoint: CheckpointCandidate {
                path,
                token: checkpoint.token,
            },
            sha256,
            model,
        })
    }

    /// File name without the checkpoint extension
    pub fn stem(&self, extension: &str) -> String {
        let name = self.checkpoint.file_name();
        let suffix = format!(".{}", extension);
        match name.split_once(&suffix) {
            Some((stem, _)) => stem.to_string(),
            None => name,
        }
    }
}

impl fmt::Debug for BestModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BestModel")
            .field("checkpoint", &self.checkpoint)
            .field("sha256", &self.sha256)
            .finish_non_exhaustive()
    }
}
