// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! End-to-end evaluation runs against temporary job directories

use classifier_eval::config::{EvaluationConfig, ExecutionMode, ModelServerConfig, WorkerConfig};
use classifier_eval::evaluator::{Collaborators, Evaluator, RunOutcome};
use classifier_eval::figures::{FigureData, FigureKind};
use classifier_eval::gallery::{Saliency, SaliencyMap};
use classifier_eval::inference::{Batch, Classifier};
use classifier_eval::report::{ExportFormat, NotebookExporter, NotebookParameters, NotebookRunner};
use classifier_eval::{EvalError, ModelLoader};
use image::RgbImage;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Red channel step encoding the class the fake model predicts
const COLOR_STEP: f32 = 50.0;

/// Predicts the class encoded in the red channel of the first pixel
struct ColorModel {
    n_classes: usize,
}

impl Classifier for ColorModel {
    fn predict(&self, batch: &Batch) -> anyhow::Result<Vec<Vec<f32>>> {
        let stride = batch.shape[1] * batch.shape[2] * batch.shape[3];
        Ok(batch
            .data
            .chunks(stride)
            .map(|img| {
                let red = (img[0] + 1.0) * 127.5;
                let class = (red / COLOR_STEP).round() as usize % self.n_classes;
                let mut dist = vec![0.1 / (self.n_classes - 1) as f32; self.n_classes];
                dist[class] = 0.9;
                dist
            })
            .collect())
    }
}

#[derive(Default)]
struct FakeLoader {
    loaded: Mutex<Vec<PathBuf>>,
}

impl ModelLoader for FakeLoader {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Classifier>> {
        self.loaded.lock().unwrap().push(path.to_path_buf());
        let job_dir = path.ancestors().find(|p| p.join("class_mapping.json").is_file()).unwrap();
        let mapping: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(job_dir.join("class_mapping.json"))?)?;
        Ok(Arc::new(ColorModel {
            n_classes: mapping.len(),
        }))
    }
}

/// Horizontal ramp, records the requested class of every call
#[derive(Clone, Default)]
struct RampSaliency {
    calls: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl Saliency for RampSaliency {
    fn visualize_cam(
        &self,
        _model: &dyn Classifier,
        layer_idx: usize,
        filter_index: usize,
        seed_input: &[f32],
        width: u32,
        height: u32,
    ) -> anyhow::Result<SaliencyMap> {
        assert_eq!(seed_input.len(), (width * height * 3) as usize);
        self.calls.lock().unwrap().push((layer_idx, filter_index));
        Ok(SaliencyMap {
            width,
            height,
            values: (0..width * height).map(|i| (i % width) as f32).collect(),
        })
    }
}

#[derive(Clone, Default)]
struct NotebookRecorder {
    executed: Arc<Mutex<Vec<(PathBuf, NotebookParameters, String)>>>,
    exported: Arc<Mutex<Vec<(ExportFormat, PathBuf)>>>,
}

impl NotebookRunner for NotebookRecorder {
    fn execute(
        &self,
        _template: &Path,
        output: &Path,
        parameters: &NotebookParameters,
        kernel_name: &str,
    ) -> anyhow::Result<()> {
        self.executed.lock().unwrap().push((
            output.to_path_buf(),
            parameters.clone(),
            kernel_name.to_string(),
        ));
        Ok(())
    }
}

impl NotebookExporter for NotebookRecorder {
    fn export(&self, _notebook: &Path, format: ExportFormat, output: &Path) -> anyhow::Result<()> {
        self.exported.lock().unwrap().push((format, output.to_path_buf()));
        Ok(())
    }
}

struct Job {
    _root: TempDir,
    image_dir: PathBuf,
    job_dir: PathBuf,
}

/// `n_samples` images over `n_classes`; the first `n_correct` are predicted
/// correctly, the rest as the next class.
fn create_job(n_samples: usize, n_classes: usize, n_correct: usize) -> Job {
    let root = tempfile::tempdir().unwrap();
    let image_dir = root.path().join("images");
    let job_dir = root.path().join("job");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::create_dir_all(job_dir.join("models/late")).unwrap();

    let mut samples = Vec::new();
    for i in 0..n_samples {
        let label = i % n_classes;
        let pred = if i < n_correct { label } else { (label + 1) % n_classes };
        let name = format!("img_{i:03}.png");
        let red = (pred as f32 * COLOR_STEP) as u8;
        RgbImage::from_pixel(4, 4, image::Rgb([red, 10, 20]))
            .save(image_dir.join(&name))
            .unwrap();
        samples.push(json!({"image_id": name, "label": label, "source": "camera"}));
    }
    std::fs::write(job_dir.join("test_samples.json"), json!(samples).to_string()).unwrap();

    let mapping: serde_json::Map<String, serde_json::Value> = (0..n_classes)
        .map(|i| (i.to_string(), json!(format!("class_{i}"))))
        .collect();
    std::fs::write(job_dir.join("class_mapping.json"), json!(mapping).to_string()).unwrap();

    std::fs::write(job_dir.join("models/model_ep01_valacc_0.72_x.hdf5"), b"first").unwrap();
    std::fs::write(job_dir.join("models/late/model_ep02_valacc_0.85_x.hdf5"), b"second").unwrap();
    std::fs::write(job_dir.join("models/notes.txt"), b"not a checkpoint").unwrap();

    Job {
        _root: root,
        image_dir,
        job_dir,
    }
}

fn config(job: &Job, mode: ExecutionMode) -> EvaluationConfig {
    EvaluationConfig {
        image_dir: job.image_dir.clone(),
        job_dir: job.job_dir.clone(),
        batch_size: 16,
        mode,
        workers: WorkerConfig {
            multiprocessing: true,
            workers: 3,
        },
        ..EvaluationConfig::default()
    }
}

fn collaborators(saliency: &RampSaliency, notebooks: &NotebookRecorder) -> Collaborators {
    Collaborators {
        saliency: Box::new(saliency.clone()),
        notebook_runner: Box::new(notebooks.clone()),
        notebook_exporter: Box::new(notebooks.clone()),
        ..Collaborators::default()
    }
}

#[test]
fn test_interactive_run_selects_best_checkpoint_and_scores() {
    let job = create_job(100, 4, 70);
    let loader = FakeLoader::default();
    let saliency = RampSaliency::default();
    let notebooks = NotebookRecorder::default();

    let mut evaluator = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &loader,
        collaborators(&saliency, &notebooks),
    )
    .unwrap();

    let loaded = loader.loaded.lock().unwrap().clone();
    assert_eq!(loaded.len(), 1);
    assert!(loaded[0].ends_with("late/model_ep02_valacc_0.85_x.hdf5"));
    assert_eq!(evaluator.best_model().checkpoint.token, "0.85");
    assert_eq!(evaluator.evaluation_dir(), None);

    let results = match evaluator.run(false, false).unwrap() {
        RunOutcome::Interactive(results) => results,
        RunOutcome::Batch(_) => panic!("interactive run built a report"),
    };

    assert!((results.accuracy - 0.70).abs() < 1e-9);
    assert_eq!(results.n_samples, 100);
    assert_eq!(results.label_distribution, vec![25, 25, 25, 25]);
    assert_eq!(results.label_distribution.iter().sum::<usize>(), results.n_samples);
    assert_eq!(results.confusion_matrix.trace(), 70);
    assert_eq!(results.checkpoint.accuracy_token, "0.85");
    assert_eq!(results.checkpoint.sha256.len(), 64);

    // distribution, report, two confusion matrices, then a correct and a
    // wrong gallery for each of the four classes
    let kinds: Vec<FigureKind> = evaluator.figures().iter().map(|f| f.kind).collect();
    assert_eq!(kinds.len(), 12);
    assert_eq!(kinds[0], FigureKind::Distribution);
    assert_eq!(kinds[1], FigureKind::ClassificationReport);
    assert_eq!(kinds[2], FigureKind::ConfusionMatrix);
    assert_eq!(kinds[3], FigureKind::ConfusionMatrix);
    assert!(kinds[4..].iter().all(|k| *k == FigureKind::Gallery));

    assert_eq!(evaluator.figures()[0].title, "Number of images in test set: 100");
    assert_eq!(evaluator.figures()[1].title, "Accuracy on prediction test set: 70.0");
    assert_eq!(evaluator.figures()[2].title, "Confusion matrix (recall)");
    assert_eq!(evaluator.figures()[3].title, "Confusion matrix (precision)");
    assert_eq!(evaluator.figures()[4].title, "Label: \"class_0\" (correct predicted)");
    assert_eq!(evaluator.figures()[5].title, "Label: \"class_0\" (wrong predicted)");

    for figure in &evaluator.figures()[4..] {
        assert_eq!(figure.data, FigureData::Gallery { rows: 3, cols: 2 });
    }

    let calls = saliency.calls.lock().unwrap();
    assert_eq!(calls.len(), 8 * 3);
    assert!(calls.iter().all(|(layer, _)| *layer == 89));
    // the wrong gallery of class 0 asks for the predicted class 1
    assert_eq!(calls[3..6].iter().map(|c| c.1).collect::<Vec<_>>(), vec![1, 1, 1]);

    assert!(notebooks.executed.lock().unwrap().is_empty());
}

#[test]
fn test_confusion_rows_normalized() {
    let job = create_job(100, 4, 70);
    let mut evaluator = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .unwrap();
    evaluator.make_prediction_on_test_set().unwrap();
    let results = evaluator.results().unwrap();

    for row in results.recall_matrix.iter().chain(&results.precision_matrix) {
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}

#[test]
fn test_label_index_and_name_agree() {
    let job = create_job(40, 4, 30);
    let mut evaluator = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .unwrap();

    assert!(matches!(
        evaluator.get_correct_wrong_examples(1usize),
        Err(EvalError::PredictionsMissing)
    ));

    evaluator.make_prediction_on_test_set().unwrap();

    let indices = |(correct, wrong): (Vec<classifier_eval::ExampleImage>, Vec<classifier_eval::ExampleImage>)| {
        (
            correct.iter().map(|e| e.index).collect::<Vec<_>>(),
            wrong.iter().map(|e| e.index).collect::<Vec<_>>(),
        )
    };
    let by_index = indices(evaluator.get_correct_wrong_examples(1usize).unwrap());
    let by_name = indices(evaluator.get_correct_wrong_examples("class_1").unwrap());

    assert_eq!(by_index, by_name);
    assert_eq!(by_index.0, vec![1, 5, 9, 13, 17, 21, 25, 29]);
    assert_eq!(by_index.1, vec![33, 37]);

    let (correct, _) = evaluator.get_correct_wrong_examples(1usize).unwrap();
    assert_eq!(correct[0].image.dimensions(), (224, 224));
    assert_eq!(correct[0].sample.extra["source"], "camera");

    assert!(matches!(
        evaluator.get_correct_wrong_examples("class_9"),
        Err(EvalError::UnknownLabel(_))
    ));
    assert!(matches!(
        evaluator.get_correct_wrong_examples(4usize),
        Err(EvalError::UnknownLabel(_))
    ));
}

#[test]
fn test_visualize_images_bounds() {
    let job = create_job(40, 4, 30);
    let mut evaluator = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .unwrap();
    evaluator.make_prediction_on_test_set().unwrap();

    assert!(evaluator.visualize_images(&[], "x", true, 20).unwrap().is_none());
    assert!(evaluator.figures().is_empty());

    let (correct, _) = evaluator.get_correct_wrong_examples(0usize).unwrap();
    let figure = evaluator
        .visualize_images(&correct, "first two", false, 2)
        .unwrap()
        .unwrap();
    assert_eq!(figure.data, FigureData::Gallery { rows: 2, cols: 1 });
    assert!(figure.svg.contains("true: class_0, predicted: class_0 (0.9)"));
    assert_eq!(evaluator.figures().len(), 1);
}

/// Records the message of every event emitted on the current thread
#[derive(Clone, Default)]
struct MessageLog {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MessageLog {
    fn count(&self, text: &str) -> usize {
        self.messages.lock().unwrap().iter().filter(|m| m.as_str() == text).count()
    }
}

struct MessageVisitor<'a>(&'a mut Option<String>);

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for MessageLog {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = None;
        event.record(&mut MessageVisitor(&mut message));
        if let Some(message) = message {
            self.messages.lock().unwrap().push(message);
        }
    }
}

const CLASS_CEILING_MESSAGE: &str = "Plotting only for max 20 classes";

#[test]
fn test_many_classes_produce_no_figures() {
    let job = create_job(25, 25, 25);
    let log = MessageLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());

    tracing::subscriber::with_default(subscriber, || {
        let mut evaluator = Evaluator::new(
            config(&job, ExecutionMode::Interactive),
            &FakeLoader::default(),
            Collaborators::default(),
        )
        .unwrap();
        assert_eq!(log.count(CLASS_CEILING_MESSAGE), 0);

        // distribution, report, both matrices and the example galleries
        let outcome = evaluator.run(false, false).unwrap();
        assert!(matches!(outcome, RunOutcome::Interactive(_)));
        assert!(evaluator.figures().is_empty());
        assert_eq!(log.count(CLASS_CEILING_MESSAGE), 5);

        let gated_plots: [fn(&mut Evaluator) -> bool; 5] = [
            |e| e.plot_test_set_distribution().unwrap().is_none(),
            |e| e.plot_classification_report().unwrap().is_none(),
            |e| e.plot_confusion_matrix(false).unwrap().is_none(),
            |e| e.plot_confusion_matrix(true).unwrap().is_none(),
            |e| e.plot_correct_wrong_examples().is_ok(),
        ];
        for skipped in gated_plots {
            let before = log.count(CLASS_CEILING_MESSAGE);
            assert!(skipped(&mut evaluator));
            assert_eq!(log.count(CLASS_CEILING_MESSAGE), before + 1);
        }

        assert!(evaluator.figures().is_empty());
        assert_eq!(log.count(CLASS_CEILING_MESSAGE), 10);
    });
}

#[test]
fn test_batch_run_builds_report() {
    let job = create_job(8, 2, 8);
    let saliency = RampSaliency::default();
    let notebooks = NotebookRecorder::default();

    let mut batch_config = EvaluationConfig {
        base_model_name: "ResNet50".to_string(),
        batch_size: 8,
        model_server: ModelServerConfig {
            program: PathBuf::from("python"),
            args: vec!["serve.py".to_string(), "--device=cpu".to_string()],
        },
        ..config(&job, ExecutionMode::Batch)
    };
    batch_config.report.evaluator_program = PathBuf::from("/opt/bin/classifier-eval");

    let mut evaluator = Evaluator::new(
        batch_config,
        &FakeLoader::default(),
        collaborators(&saliency, &notebooks),
    )
    .unwrap();

    let evaluation_dir = job
        .job_dir
        .canonicalize()
        .unwrap()
        .join("evaluation_model_ep02_valacc_0.85_x");
    assert_eq!(evaluator.evaluation_dir(), Some(evaluation_dir.as_path()));
    assert!(evaluation_dir.is_dir());

    let artifacts = match evaluator.run(true, true).unwrap() {
        RunOutcome::Batch(artifacts) => artifacts,
        RunOutcome::Interactive(_) => panic!("batch run produced figures"),
    };

    assert_eq!(artifacts.notebook, evaluation_dir.join("evaluation_report.ipynb"));
    assert_eq!(artifacts.html, Some(evaluation_dir.join("evaluation_report.html")));
    assert_eq!(artifacts.pdf, Some(evaluation_dir.join("evaluation_report.pdf")));

    let executed = notebooks.executed.lock().unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].2, "image-atm");
    let parameters = &executed[0].1;
    assert_eq!(parameters.job_dir, job.job_dir.canonicalize().unwrap());
    assert_eq!(parameters.image_dir, job.image_dir.canonicalize().unwrap());
    assert_eq!(parameters.evaluator_program, PathBuf::from("/opt/bin/classifier-eval"));
    assert_eq!(parameters.model_server, PathBuf::from("python"));
    assert_eq!(parameters.model_server_args, vec!["serve.py", "--device=cpu"]);
    assert_eq!(parameters.base_model_name, "ResNet50");
    assert_eq!(parameters.batch_size, 8);
    assert_eq!(parameters.workers, 3);
    assert_eq!(parameters.checkpoint_extension, "hdf5");
    let pairs = parameters.pairs();
    assert!(pairs.contains(&("model_server_args", r#"["serve.py","--device=cpu"]"#.to_string())));
    assert!(pairs.contains(&("base_model_name", "ResNet50".to_string())));
    assert_eq!(notebooks.exported.lock().unwrap().len(), 2);

    assert!(evaluator.figures().is_empty());
    assert!(evaluator.predictions().is_none());
}

#[test]
fn test_wrong_mode_fails_fast() {
    let job = create_job(8, 2, 8);

    let mut batch = Evaluator::new(
        config(&job, ExecutionMode::Batch),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .unwrap();
    assert!(matches!(
        batch.plot_test_set_distribution(),
        Err(EvalError::WrongMode {
            required: ExecutionMode::Interactive,
            current: ExecutionMode::Batch,
            ..
        })
    ));
    assert!(matches!(batch.plot_correct_wrong_examples(), Err(EvalError::WrongMode { .. })));

    let interactive = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .unwrap();
    assert!(matches!(
        interactive.create_report(true, false),
        Err(EvalError::WrongMode {
            required: ExecutionMode::Batch,
            ..
        })
    ));
}

#[test]
fn test_setup_errors() {
    let job = create_job(8, 2, 8);

    std::fs::write(job.job_dir.join("models/late/broken.hdf5"), b"?").unwrap();
    let err = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, EvalError::CheckpointName { .. }));

    std::fs::remove_dir_all(job.job_dir.join("models")).unwrap();
    let err = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, EvalError::NoCheckpoints(_)));

    std::fs::remove_file(job.job_dir.join("test_samples.json")).unwrap();
    let err = Evaluator::new(
        config(&job, ExecutionMode::Interactive),
        &FakeLoader::default(),
        Collaborators::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, EvalError::MissingInput(_)));
}
