// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Configuration for the evaluation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Default number of images per inference batch
pub const BATCH_SIZE: usize = 16;

/// Default pretrained backbone
pub const BASE_MODEL_NAME: &str = "MobileNet";

/// Class-count ceiling above which class-sensitive plots are skipped
pub const MAX_N_CLASSES: usize = 20;

/// How results are surfaced, fixed for the lifetime of an evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Figures are shown as they are produced, no report is written
    #[default]
    Interactive,
    /// No figures are shown; an evaluation directory and report are produced
    Batch,
}

impl ExecutionMode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, ExecutionMode::Interactive)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Interactive => write!(f, "interactive"),
            ExecutionMode::Batch => write!(f, "batch"),
        }
    }
}

/// Parallelism for batch loading, resolved by the caller and injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether batches may be prepared on a worker pool
    pub multiprocessing: bool,
    /// Number of worker threads when `multiprocessing` is set
    pub workers: usize,
}

impl WorkerConfig {
    /// Single-threaded execution
    pub fn sequential() -> Self {
        Self {
            multiprocessing: false,
            workers: 1,
        }
    }

    /// Effective number of workers (always at least one)
    pub fn effective_workers(&self) -> usize {
        if self.multiprocessing {
            self.workers.max(1)
        } else {
            1
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::sequential()
    }
}

/// Process serving the checkpoint, started as `<program> <args...> <checkpoint>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelServerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("model-server"),
            args: Vec::new(),
        }
    }
}

/// Notebook report settings (batch mode only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Notebook template executed to build the report
    pub template: PathBuf,
    /// Jupyter kernel used to execute the template
    pub kernel_name: String,
    /// Evaluator binary the notebook runs in interactive mode
    pub evaluator_program: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            template: PathBuf::from(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/notebooks/evaluation_template.ipynb"
            )),
            kernel_name: "image-atm".to_string(),
            evaluator_program: PathBuf::from("classifier-eval"),
        }
    }
}

/// Configuration for an evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Directory holding the test images
    pub image_dir: PathBuf,
    /// Job directory with samples, class mapping and models
    pub job_dir: PathBuf,
    /// Images per inference batch
    pub batch_size: usize,
    /// Name of the pretrained backbone, selects preprocessing
    pub base_model_name: String,
    /// Interactive or batch execution
    pub mode: ExecutionMode,
    /// Batch-loading parallelism
    pub workers: WorkerConfig,
    /// File extension of checkpoint files under `<job_dir>/models`
    pub checkpoint_extension: String,
    /// Model server the checkpoint is loaded into
    pub model_server: ModelServerConfig,
    /// Notebook report settings
    pub report: ReportConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("images"),
            job_dir: PathBuf::from("job"),
            batch_size: BATCH_SIZE,
            base_model_name: BASE_MODEL_NAME.to_string(),
            mode: ExecutionMode::default(),
            workers: WorkerConfig::default(),
            checkpoint_extension: "hdf5".to_string(),
            model_server: ModelServerConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

/// Font sizes and figure dimensions derived from the number of classes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotParams {
    pub fontsize_title: f64,
    pub fontsize_label: f64,
    pub fontsize_ticks: f64,
    n_classes: usize,
}

impl PlotParams {
    pub fn for_classes(n_classes: usize) -> Self {
        let small = n_classes < 4;
        Self {
            fontsize_title: if small { 16.0 } else { 18.0 },
            fontsize_label: if small { 12.0 } else { 14.0 },
            fontsize_ticks: if small { 9.0 } else { 12.0 },
            n_classes,
        }
    }

    /// Figure size (inches) of the distribution bar chart
    pub fn distribution_figsize(&self) -> (f64, f64) {
        (8.0, 5.0)
    }

    /// Figure size (inches) of the classification report heat-map
    pub fn report_figsize(&self) -> (f64, f64) {
        let n = self.n_classes as f64;
        ((n * 0.5).max(5.0), (n * 0.8).max(8.0))
    }

    /// Figure size (inches) of either confusion matrix
    pub fn confusion_figsize(&self) -> (f64, f64) {
        let n = self.n_classes as f64;
        ((n * 0.9).max(9.0), (n * 0.9).max(8.0))
    }
}
