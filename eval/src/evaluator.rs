// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation of a trained image classifier
//!
//! Orchestrates:
//! - Test set and class mapping loading
//! - Best checkpoint selection and model loading
//! - Batched inference
//! - Metric figures and example galleries (interactive mode)
//! - Notebook report generation (batch mode)

use crate::checkpoint::{BestModel, ModelLoader};
use crate::config::{EvaluationConfig, ExecutionMode, PlotParams, MAX_N_CLASSES};
use crate::datasets::{load_image, ClassMapping, TestSet, TARGET_SIZE};
use crate::error::{EvalError, Result};
use crate::figures::{bar_chart, gallery, CollectingSink, Figure, FigureKind, FigureSink, Fonts, Heatmap, Tile};
use crate::gallery::{
    overlay, partition_indices, tile_caption, ExampleImage, LabelQuery, ModelSaliency, Saliency,
    OVERLAY_ALPHA, SALIENCY_LAYER_IDX,
};
use crate::inference::{BatchSource, ImageClassifier, Predictions};
use crate::metrics::{
    accuracy_score, precision_confusion_matrix, recall_confusion_matrix, ClassificationReport,
    ConfusionMatrix, REPORT_MEASURES,
};
use crate::report::{
    NbconvertExporter, NotebookExporter, NotebookParameters, NotebookRunner, PapermillRunner,
    ReportArtifacts, ReportBuilder,
};
use crate::results::{CheckpointInfo, EvaluationResults};
use chrono::Utc;
use std::path::{Path, PathBuf};

pub const SAMPLES_FILE: &str = "test_samples.json";
pub const CLASS_MAPPING_FILE: &str = "class_mapping.json";

/// Rows per class in the overview galleries
const OVERVIEW_N_PLOT: usize = 3;

/// Pluggable parts of an evaluation
pub struct Collaborators {
    pub figure_sink: Box<dyn FigureSink>,
    pub saliency: Box<dyn Saliency>,
    pub notebook_runner: Box<dyn NotebookRunner>,
    pub notebook_exporter: Box<dyn NotebookExporter>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            figure_sink: Box::new(CollectingSink::default()),
            saliency: Box::new(ModelSaliency),
            notebook_runner: Box::new(PapermillRunner::default()),
            notebook_exporter: Box::new(NbconvertExporter::default()),
        }
    }
}

/// What a run produced
#[derive(Debug)]
pub enum RunOutcome {
    /// Figures were shown; the computed results are returned
    Interactive(Box<EvaluationResults>),
    /// The notebook report was built
    Batch(ReportArtifacts),
}

/// Evaluates the best checkpoint of a training job on its test set
pub struct Evaluator {
    config: EvaluationConfig,
    image_dir: PathBuf,
    job_dir: PathBuf,
    samples_test: TestSet,
    class_mapping: ClassMapping,
    y_true: Vec<usize>,
    plot_params: PlotParams,
    best_model: BestModel,
    evaluation_dir: Option<PathBuf>,
    classifier: ImageClassifier,
    predictions: Option<Predictions>,
    figures: Vec<Figure>,
    collaborators: Collaborators,
}

impl Evaluator {
    /// Load the test set, the class mapping and the best model of the job.
    ///
    /// In batch mode the evaluation directory is created as well.
    pub fn new(
        config: EvaluationConfig,
        loader: &dyn ModelLoader,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let image_dir = absolute(&config.image_dir);
        let job_dir = absolute(&config.job_dir);

        let samples_test = TestSet::load(&job_dir.join(SAMPLES_FILE))?;
        let class_mapping = ClassMapping::load(&job_dir.join(CLASS_MAPPING_FILE))?;
        let n_classes = class_mapping.n_classes();
        samples_test.validate(n_classes)?;

        tracing::info!(
            "Test set loaded: {} samples, {} classes",
            samples_test.len(),
            n_classes
        );

        let mut classifier = ImageClassifier::new(&config.base_model_name, n_classes)?;
        let best_model = BestModel::load(&job_dir, &config.checkpoint_extension, loader)?;
        classifier.set_model(best_model.model.clone());

        let evaluation_dir = match config.mode {
            ExecutionMode::Batch => {
                let dir = job_dir.join(format!(
                    "evaluation_{}",
                    best_model.stem(&config.checkpoint_extension)
                ));
                std::fs::create_dir_all(&dir)?;
                tracing::info!("Evaluation directory: {}", dir.display());
                Some(dir)
            }
            ExecutionMode::Interactive => None,
        };

        Ok(Self {
            y_true: samples_test.y_true(),
            plot_params: PlotParams::for_classes(n_classes),
            config,
            image_dir,
            job_dir,
            samples_test,
            class_mapping,
            best_model,
            evaluation_dir,
            classifier,
            predictions: None,
            figures: Vec::new(),
            collaborators,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.config.mode
    }

    pub fn n_classes(&self) -> usize {
        self.class_mapping.n_classes()
    }

    pub fn classes(&self) -> &[String] {
        self.class_mapping.names()
    }

    pub fn class_mapping(&self) -> &ClassMapping {
        &self.class_mapping
    }

    pub fn test_set(&self) -> &TestSet {
        &self.samples_test
    }

    pub fn y_true(&self) -> &[usize] {
        &self.y_true
    }

    pub fn best_model(&self) -> &BestModel {
        &self.best_model
    }

    /// `<job_dir>/evaluation_<checkpoint stem>`, batch mode only
    pub fn evaluation_dir(&self) -> Option<&Path> {
        self.evaluation_dir.as_deref()
    }

    pub fn predictions(&self) -> Option<&Predictions> {
        self.predictions.as_ref()
    }

    /// Every figure shown so far, in order
    pub fn figures(&self) -> &[Figure] {
        &self.figures
    }

    /// Run the model over the whole test set, in order
    pub fn make_prediction_on_test_set(&mut self) -> Result<&Predictions> {
        tracing::info!("****** Make prediction on test set ******");

        let source = BatchSource::new(
            self.samples_test.samples.clone(),
            &self.image_dir,
            self.config.batch_size,
            self.n_classes(),
            self.classifier.get_preprocess_input(),
        );
        let distributions = self
            .classifier
            .predict_generator(&source, self.config.workers, true)?;

        let predictions = Predictions::from_distributions(distributions);
        tracing::info!(
            "Predicted {} samples, accuracy {:.4}",
            predictions.len(),
            accuracy_score(&self.y_true, &predictions.y_pred)
        );
        let predictions = &*self.predictions.insert(predictions);
        Ok(predictions)
    }

    fn require_predictions(&self) -> Result<&Predictions> {
        self.predictions.as_ref().ok_or(EvalError::PredictionsMissing)
    }

    fn require_interactive(&self, operation: &'static str) -> Result<()> {
        if self.config.mode.is_interactive() {
            Ok(())
        } else {
            Err(EvalError::wrong_mode(
                operation,
                ExecutionMode::Interactive,
                self.config.mode,
            ))
        }
    }

    /// True when the plot must be skipped because there are too many classes
    fn too_many_classes(&self) -> bool {
        if self.n_classes() > MAX_N_CLASSES {
            tracing::info!("Plotting only for max {} classes", MAX_N_CLASSES);
            return true;
        }
        false
    }

    fn fonts(&self) -> Fonts {
        Fonts::from(&self.plot_params)
    }

    fn show(&mut self, figure: Figure) -> Result<Option<&Figure>> {
        self.collaborators
            .figure_sink
            .show(&figure)
            .map_err(|e| EvalError::external("figure display", e))?;
        self.figures.push(figure);
        Ok(self.figures.last())
    }

    /// Bar chart of the number of test images per class
    pub fn plot_test_set_distribution(&mut self) -> Result<Option<&Figure>> {
        self.require_interactive("plot_test_set_distribution")?;
        if self.too_many_classes() {
            return Ok(None);
        }

        let counts = self.samples_test.label_distribution(self.n_classes());
        let figure = bar_chart(
            &format!("Number of images in test set: {}", self.samples_test.len()),
            "Label",
            "Number of images",
            self.classes(),
            &counts,
            self.plot_params.distribution_figsize(),
            self.fonts(),
        );
        self.show(figure)
    }

    /// Heat-map of per-class precision, recall and F1 plus averages
    pub fn plot_classification_report(&mut self) -> Result<Option<&Figure>> {
        self.require_interactive("plot_classification_report")?;
        if self.too_many_classes() {
            return Ok(None);
        }

        let y_pred = &self.require_predictions()?.y_pred;
        let report = ClassificationReport::from_predictions(&self.y_true, y_pred, self.classes());

        let rows = report.rows();
        let y_labels: Vec<String> = rows.iter().map(|(name, _)| name.clone()).collect();
        let values: Vec<Vec<f64>> = rows.iter().map(|(_, v)| v.to_vec()).collect();
        let x_labels: Vec<String> = REPORT_MEASURES.iter().map(|m| m.to_string()).collect();
        let title = format!(
            "Accuracy on prediction test set: {}",
            percent(report.accuracy)
        );

        let figure = Heatmap {
            kind: FigureKind::ClassificationReport,
            title: &title,
            xlabel: "Measures",
            ylabel: "Classes",
            x_labels: &x_labels,
            y_labels: &y_labels,
            values: &values,
            figsize: self.plot_params.report_figsize(),
        }
        .render(self.fonts());
        self.show(figure)
    }

    /// Row-normalized confusion matrix.
    ///
    /// With `precision` set, rows are predicted labels and columns true labels.
    pub fn plot_confusion_matrix(&mut self, precision: bool) -> Result<Option<&Figure>> {
        self.require_interactive("plot_confusion_matrix")?;
        if self.too_many_classes() {
            return Ok(None);
        }

        let y_pred = &self.require_predictions()?.y_pred;
        let n_classes = self.n_classes();
        let (values, title, xlabel, ylabel) = if precision {
            (
                precision_confusion_matrix(&self.y_true, y_pred, n_classes),
                "Confusion matrix (precision)",
                "True label",
                "Predicted label",
            )
        } else {
            (
                recall_confusion_matrix(&self.y_true, y_pred, n_classes),
                "Confusion matrix (recall)",
                "Predicted label",
                "True label",
            )
        };

        let figure = Heatmap {
            kind: FigureKind::ConfusionMatrix,
            title,
            xlabel,
            ylabel,
            x_labels: self.classes(),
            y_labels: self.classes(),
            values: &values,
            figsize: self.plot_params.confusion_figsize(),
        }
        .render(self.fonts());
        self.show(figure)
    }

    /// Test examples of one class, split into correctly and wrongly predicted
    pub fn get_correct_wrong_examples(
        &self,
        label: impl Into<LabelQuery>,
    ) -> Result<(Vec<ExampleImage>, Vec<ExampleImage>)> {
        let label = label.into().resolve(&self.class_mapping)?;
        let y_pred = &self.require_predictions()?.y_pred;

        let (correct, wrong) = partition_indices(&self.y_true, y_pred, label);
        Ok((self.load_examples(&correct)?, self.load_examples(&wrong)?))
    }

    fn load_examples(&self, indices: &[usize]) -> Result<Vec<ExampleImage>> {
        indices
            .iter()
            .map(|&index| {
                let sample = &self.samples_test.samples[index];
                let image = load_image(&self.image_dir.join(&sample.image_id), TARGET_SIZE)?;
                Ok(ExampleImage {
                    index,
                    image,
                    sample: sample.clone(),
                })
            })
            .collect()
    }

    /// Gallery of up to `n_plot` examples (see [`N_PLOT`] for the usual
    /// value), with a saliency overlay column when `show_heatmap` is set.
    ///
    /// An empty list shows nothing and returns `Ok(None)`.
    ///
    /// [`N_PLOT`]: crate::gallery::N_PLOT
    pub fn visualize_images(
        &mut self,
        image_list: &[ExampleImage],
        title: &str,
        show_heatmap: bool,
        n_plot: usize,
    ) -> Result<Option<&Figure>> {
        if image_list.is_empty() {
            tracing::info!("Empty list.");
            return Ok(None);
        }
        self.require_interactive("visualize_images")?;

        let predictions = self.require_predictions()?;
        let model = self.classifier.model()?;
        let preprocess = self.classifier.get_preprocess_input();

        let mut rows = Vec::new();
        for example in image_list.iter().take(n_plot) {
            let i = example.index;
            let (y_true, y_pred) = (self.y_true[i], predictions.y_pred[i]);
            let caption = tile_caption(&self.class_mapping, y_true, y_pred, predictions.y_pred_prob[i]);

            let mut row = vec![Tile {
                caption: Some(caption),
                image: example.image.clone(),
            }];

            if show_heatmap {
                let (width, height) = example.image.dimensions();
                let seed_input = preprocess.apply(&example.image);
                let map = self
                    .collaborators
                    .saliency
                    .visualize_cam(
                        model,
                        SALIENCY_LAYER_IDX,
                        y_pred,
                        &seed_input,
                        width,
                        height,
                    )
                    .map_err(|e| EvalError::external("saliency", e))?;
                row.push(Tile {
                    caption: None,
                    image: overlay(&example.image, &map, OVERLAY_ALPHA)?,
                });
            }
            rows.push(row);
        }

        let figure = gallery(title, &rows, self.fonts())
            .map_err(|e| EvalError::external("gallery rendering", e.into()))?;
        self.show(figure)
    }

    /// Correct and wrong galleries with saliency for every class
    pub fn plot_correct_wrong_examples(&mut self) -> Result<()> {
        self.require_interactive("plot_correct_wrong_examples")?;
        if self.too_many_classes() {
            return Ok(());
        }

        for label in 0..self.n_classes() {
            let name = self.classes()[label].clone();
            let (correct, wrong) = self.get_correct_wrong_examples(label)?;
            let correct_title = format!("Label: \"{}\" (correct predicted)", name);
            let wrong_title = format!("Label: \"{}\" (wrong predicted)", name);
            self.visualize_images(&correct, &correct_title, true, OVERVIEW_N_PLOT)?;
            self.visualize_images(&wrong, &wrong_title, true, OVERVIEW_N_PLOT)?;
        }
        Ok(())
    }

    /// Execute the notebook template and export it, batch mode only
    pub fn create_report(&self, report_html: bool, report_pdf: bool) -> Result<ReportArtifacts> {
        let evaluation_dir = match (&self.evaluation_dir, self.config.mode) {
            (Some(dir), ExecutionMode::Batch) => dir,
            _ => {
                return Err(EvalError::wrong_mode(
                    "create_report",
                    ExecutionMode::Batch,
                    self.config.mode,
                ))
            }
        };

        tracing::info!("****** Create Jupyter Notebook (this may take a while) ******");
        ReportBuilder {
            evaluation_dir,
            template: &self.config.report.template,
            kernel_name: &self.config.report.kernel_name,
            parameters: self.notebook_parameters(),
            runner: self.collaborators.notebook_runner.as_ref(),
            exporter: self.collaborators.notebook_exporter.as_ref(),
        }
        .build(report_html, report_pdf)
    }

    /// The run's settings as seen by the notebook's own evaluation
    fn notebook_parameters(&self) -> NotebookParameters {
        NotebookParameters {
            image_dir: self.image_dir.clone(),
            job_dir: self.job_dir.clone(),
            evaluator_program: self.config.report.evaluator_program.clone(),
            model_server: self.config.model_server.program.clone(),
            model_server_args: self.config.model_server.args.clone(),
            base_model_name: self.config.base_model_name.clone(),
            batch_size: self.config.batch_size,
            workers: self.config.workers.effective_workers(),
            checkpoint_extension: self.config.checkpoint_extension.clone(),
        }
    }

    /// Summary of the evaluation computed from the current predictions
    pub fn results(&self) -> Result<EvaluationResults> {
        let y_pred = &self.require_predictions()?.y_pred;
        let n_classes = self.n_classes();
        let report = ClassificationReport::from_predictions(&self.y_true, y_pred, self.classes());

        Ok(EvaluationResults {
            checkpoint: CheckpointInfo {
                path: self.best_model.checkpoint.path.clone(),
                accuracy_token: self.best_model.checkpoint.token.clone(),
                sha256: self.best_model.sha256.clone(),
            },
            base_model_name: self.classifier.base_model_name().to_string(),
            n_samples: self.samples_test.len(),
            classes: self.classes().to_vec(),
            label_distribution: self.samples_test.label_distribution(n_classes),
            accuracy: report.accuracy,
            report,
            confusion_matrix: ConfusionMatrix::from_labels(&self.y_true, y_pred, n_classes),
            recall_matrix: recall_confusion_matrix(&self.y_true, y_pred, n_classes),
            precision_matrix: precision_confusion_matrix(&self.y_true, y_pred, n_classes),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Run the evaluation for the configured mode.
    ///
    /// Interactive: predict, then show every figure. Batch: build the report,
    /// whose notebook runs the interactive evaluation itself.
    pub fn run(&mut self, report_html: bool, report_pdf: bool) -> Result<RunOutcome> {
        match self.config.mode {
            ExecutionMode::Interactive => {
                self.make_prediction_on_test_set()?;

                tracing::info!("****** Plot distribution on test set ******");
                self.plot_test_set_distribution()?;

                tracing::info!("****** Plot classification report ******");
                self.plot_classification_report()?;

                tracing::info!("****** Plot confusion matrix (recall) ******");
                self.plot_confusion_matrix(false)?;

                tracing::info!("****** Plot confusion matrix (precision) ******");
                self.plot_confusion_matrix(true)?;

                tracing::info!("****** Plot correct and wrong examples ******");
                self.plot_correct_wrong_examples()?;

                Ok(RunOutcome::Interactive(Box::new(self.results()?)))
            }
            ExecutionMode::Batch => Ok(RunOutcome::Batch(self.create_report(report_html, report_pdf)?)),
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Accuracy as a percentage rounded to two decimals, always with a fraction
fn percent(accuracy: f64) -> String {
    let value = (accuracy * 10000.0).round() / 100.0;
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_formatting() {
        assert_eq!(percent(0.7), "70.0");
        assert_eq!(percent(0.12345), "12.35");
        assert_eq!(percent(1.0), "100.0");
        assert_eq!(percent(0.0), "0.0");
    }

    #[test]
    fn test_default_collaborators() {
        let c = Collaborators::default();
        let figure = Figure {
            kind: FigureKind::Gallery,
            title: "t".to_string(),
            data: crate::figures::FigureData::Gallery { rows: 0, cols: 0 },
            svg: String::new(),
        };
        let mut sink = c.figure_sink;
        assert!(sink.show(&figure).is_ok());
    }

    #[test]
    fn test_absolute_keeps_missing_paths() {
        let path = absolute(Path::new("surely/missing/dir"));
        assert!(path.is_absolute());
        assert!(path.ends_with("surely/missing/dir"));
    }
}
