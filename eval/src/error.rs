// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error types for the evaluation pipeline

use crate::config::ExecutionMode;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for evaluation operations.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Error type for evaluation operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EvalError {
    /// A required input file is missing from the job directory.
    #[error("Missing input file: {}", .0.display())]
    MissingInput(PathBuf),

    /// An input file could not be parsed.
    #[error("Failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No checkpoint files were found under the models directory.
    #[error("No checkpoints found under {}", .0.display())]
    NoCheckpoints(PathBuf),

    /// A checkpoint filename does not follow the naming contract.
    #[error("Checkpoint name {name:?} does not match {format}: {reason}")]
    CheckpointName {
        name: String,
        format: String,
        reason: String,
    },

    /// The class mapping does not cover `0..n_classes` contiguously.
    #[error("Invalid class mapping: {0}")]
    InvalidClassMapping(String),

    /// A test sample carries a label outside `0..n_classes`.
    #[error("Sample {image_id} has label {label}, expected < {n_classes}")]
    LabelOutOfRange {
        image_id: String,
        label: usize,
        n_classes: usize,
    },

    /// An operation was invoked in the wrong execution mode.
    #[error("{operation} is only possible in {required} mode (current: {current})")]
    WrongMode {
        operation: &'static str,
        required: ExecutionMode,
        current: ExecutionMode,
    },

    /// The base model name has no known preprocessing.
    #[error("Unknown base model: {0}")]
    UnknownBaseModel(String),

    /// A class name or index could not be resolved.
    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    /// Predictions were requested before inference ran.
    #[error("No predictions available, run inference first")]
    PredictionsMissing,

    /// A collaborator returned data of the wrong shape.
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Image decoding or encoding failed.
    #[error("Image error for {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An external collaborator (model runtime, saliency, notebook tooling) failed.
    #[error("{stage} failed")]
    External {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl EvalError {
    /// Wrap a collaborator failure without altering it.
    pub fn external(stage: &'static str, source: anyhow::Error) -> Self {
        EvalError::External { stage, source }
    }

    /// Build a mode-violation error.
    pub fn wrong_mode(
        operation: &'static str,
        required: ExecutionMode,
        current: ExecutionMode,
    ) -> Self {
        EvalError::WrongMode {
            operation,
            required,
            current,
        }
    }
}
