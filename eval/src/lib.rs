// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation of trained image classifiers
//!
//! This crate provides:
//! - Best checkpoint selection by the accuracy encoded in its filename
//! - Batched, order-preserving inference over a test set
//! - Classification metrics (accuracy, precision, recall, F1, confusion matrices)
//! - Figures: test set distribution, classification report, confusion matrices
//! - Correct / wrong example galleries with saliency overlays
//! - Notebook-based HTML and PDF reports for batch runs

pub mod checkpoint;
pub mod config;
pub mod datasets;
pub mod error;
pub mod evaluator;
pub mod figures;
pub mod gallery;
pub mod inference;
pub mod metrics;
pub mod report;
pub mod results;
pub mod server;

pub use checkpoint::{BestModel, CheckpointCandidate, CheckpointNameFormat, ModelLoader};
pub use config::{EvaluationConfig, ExecutionMode, PlotParams, WorkerConfig};
pub use datasets::{ClassMapping, TestSample, TestSet};
pub use error::{EvalError, Result};
pub use evaluator::{Collaborators, Evaluator, RunOutcome};
pub use figures::{CollectingSink, Figure, FigureKind, FigureSink, SvgDirectorySink};
pub use gallery::{ExampleImage, LabelQuery, ModelSaliency, Saliency, SaliencyMap};
pub use inference::{Batch, BatchSource, Classifier, ImageClassifier, Predictions, Preprocess};
pub use metrics::{ClassificationReport, ConfusionMatrix};
pub use report::{NbconvertExporter, NotebookExporter, NotebookRunner, PapermillRunner, ReportArtifacts};
pub use results::EvaluationResults;
pub use server::ModelServerLoader;
