// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Classifier evaluation CLI
//!
//! Usage:
//!   classifier-eval --image-dir ./images --job-dir ./job --model-server ./serve.py
//!   classifier-eval --image-dir ./images --job-dir ./job --model-server ./serve.py --mode batch --report-html

use anyhow::{Context, Result};
use clap::Parser;
use classifier_eval::config::{
    EvaluationConfig, ExecutionMode, ModelServerConfig, ReportConfig, WorkerConfig,
};
use classifier_eval::evaluator::{Collaborators, Evaluator, RunOutcome};
use classifier_eval::figures::SvgDirectorySink;
use classifier_eval::results::EvaluationResults;
use classifier_eval::server::ModelServerLoader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "classifier-eval")]
#[command(about = "Evaluate the best checkpoint of an image classification job")]
#[command(version)]
struct Args {
    /// Directory holding the test images
    #[arg(short, long)]
    image_dir: PathBuf,

    /// Job directory with test_samples.json, class_mapping.json and models/
    #[arg(short, long)]
    job_dir: PathBuf,

    /// Execution mode (interactive, batch)
    #[arg(short, long, value_enum, default_value = "interactive")]
    mode: Mode,

    /// Images per inference batch
    #[arg(short, long, default_value_t = classifier_eval::config::BATCH_SIZE)]
    batch_size: usize,

    /// Pretrained backbone the model was built on
    #[arg(long, default_value = classifier_eval::config::BASE_MODEL_NAME)]
    base_model: String,

    /// Threads loading batches (1 = sequential)
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Checkpoint file extension
    #[arg(long, default_value = "hdf5")]
    checkpoint_ext: String,

    /// Model server program, started with the checkpoint path as last argument
    #[arg(long)]
    model_server: PathBuf,

    /// Extra arguments for the model server (repeatable)
    #[arg(long = "model-server-arg", allow_hyphen_values = true)]
    model_server_args: Vec<String>,

    /// Directory receiving figures as SVG (interactive mode)
    #[arg(long, default_value = "eval/figures")]
    figures_dir: PathBuf,

    /// Output directory for results (interactive mode)
    #[arg(short, long, default_value = "eval/results")]
    output: PathBuf,

    /// Output format (json, markdown, both)
    #[arg(short, long, default_value = "both")]
    format: String,

    /// Export the executed report notebook to HTML (batch mode)
    #[arg(long)]
    report_html: bool,

    /// Export the executed report notebook to PDF (batch mode)
    #[arg(long)]
    report_pdf: bool,

    /// Notebook template for the report
    #[arg(long)]
    template: Option<PathBuf>,

    /// Jupyter kernel executing the report
    #[arg(long)]
    kernel: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Interactive,
    Batch,
}

impl From<Mode> for ExecutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Interactive => ExecutionMode::Interactive,
            Mode::Batch => ExecutionMode::Batch,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Classifier Evaluation");
    tracing::info!("=====================");
    tracing::info!("Job: {}", args.job_dir.display());
    tracing::info!("Images: {}", args.image_dir.display());
    tracing::info!("Mode: {}", ExecutionMode::from(args.mode));

    let mut report = ReportConfig::default();
    if let Some(template) = args.template.clone() {
        report.template = template;
    }
    if let Some(kernel) = args.kernel.clone() {
        report.kernel_name = kernel;
    }
    // the report notebook re-runs this very binary
    if let Ok(exe) = std::env::current_exe() {
        report.evaluator_program = exe;
    }

    let config = EvaluationConfig {
        image_dir: args.image_dir.clone(),
        job_dir: args.job_dir.clone(),
        batch_size: args.batch_size,
        base_model_name: args.base_model.clone(),
        mode: args.mode.into(),
        workers: WorkerConfig {
            multiprocessing: args.workers > 1,
            workers: args.workers,
        },
        checkpoint_extension: args.checkpoint_ext.clone(),
        model_server: ModelServerConfig {
            program: args.model_server.clone(),
            args: args.model_server_args.clone(),
        },
        report,
    };

    let mut collaborators = Collaborators::default();
    if config.mode.is_interactive() {
        collaborators.figure_sink = Box::new(
            SvgDirectorySink::new(&args.figures_dir)
                .with_context(|| format!("Cannot create {}", args.figures_dir.display()))?,
        );
    }

    let loader = ModelServerLoader::new(&config.model_server.program, config.model_server.args.clone());
    let mut evaluator = Evaluator::new(config, &loader, collaborators)
        .context("Failed to set up the evaluation")?;

    match evaluator.run(args.report_html, args.report_pdf)? {
        RunOutcome::Interactive(results) => {
            print_summary(&results, evaluator.figures().len());
            save_outputs(&args, &results)?;
        }
        RunOutcome::Batch(artifacts) => {
            println!("\nNotebook: {}", artifacts.notebook.display());
            if let Some(html) = artifacts.html {
                println!("HTML report: {}", html.display());
            }
            if let Some(pdf) = artifacts.pdf {
                println!("PDF report: {}", pdf.display());
            }
        }
    }

    println!("\nEvaluation complete!");

    Ok(())
}

fn print_summary(results: &EvaluationResults, n_figures: usize) {
    println!("\n{}", "=".repeat(70));
    println!("EVALUATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!(
        "\nCheckpoint: {} (token {})",
        results.checkpoint.path.display(),
        results.checkpoint.accuracy_token
    );
    println!("Samples: {}, classes: {}", results.n_samples, results.classes.len());
    println!("Accuracy: {:.4}", results.accuracy);
    println!("\nPer-class metrics:");
    println!("{:-<70}", "");
    println!("{:<30} {:>9} {:>9} {:>9} {:>9}", "Class", "Precision", "Recall", "F1", "Support");
    println!("{:-<70}", "");
    for class in &results.report.per_class {
        println!(
            "{:<30} {:>9.4} {:>9.4} {:>9.4} {:>9}",
            class.name,
            class.metrics.precision,
            class.metrics.recall,
            class.metrics.f1_score,
            class.metrics.support
        );
    }
    println!("{:-<70}", "");
    println!("Figures shown: {}", n_figures);
}

fn save_outputs(args: &Args, results: &EvaluationResults) -> Result<()> {
    std::fs::create_dir_all(&args.output)?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");

    if args.format == "json" || args.format == "both" {
        let json_path = args.output.join(format!("eval_{}.json", timestamp));
        results.save(&json_path)?;
        println!("\nJSON results saved to: {}", json_path.display());
    }

    if args.format == "markdown" || args.format == "both" {
        let md_path = args.output.join(format!("eval_{}.md", timestamp));
        std::fs::write(&md_path, results.generate_report())?;
        println!("Markdown report saved to: {}", md_path.display());
    }

    let csv_path = args.output.join(format!("confusion_{}.csv", timestamp));
    results.write_confusion_csv(&csv_path)?;
    println!("Confusion matrix saved to: {}", csv_path.display());

    Ok(())
}
