// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Notebook-based evaluation report (batch mode)
//!
//! Executes the evaluation notebook template against a job and exports the
//! executed notebook. Execution and export are delegated to Jupyter tooling.

use crate::error::{EvalError, Result};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const NOTEBOOK_FILE: &str = "evaluation_report.ipynb";
pub const HTML_FILE: &str = "evaluation_report.html";
pub const PDF_FILE: &str = "evaluation_report.pdf";

/// Values injected into the template's `parameters` cell.
///
/// Besides the two directories, the notebook receives everything the
/// evaluation it runs needs to load and score the same model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookParameters {
    pub image_dir: PathBuf,
    pub job_dir: PathBuf,
    pub evaluator_program: PathBuf,
    pub model_server: PathBuf,
    pub model_server_args: Vec<String>,
    pub base_model_name: String,
    pub batch_size: usize,
    pub workers: usize,
    pub checkpoint_extension: String,
}

impl NotebookParameters {
    /// Name and value of every parameter. Lists are passed as JSON strings.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let args = serde_json::json!(self.model_server_args).to_string();
        vec![
            ("image_dir", self.image_dir.display().to_string()),
            ("job_dir", self.job_dir.display().to_string()),
            ("evaluator_program", self.evaluator_program.display().to_string()),
            ("model_server", self.model_server.display().to_string()),
            ("model_server_args", args),
            ("base_model_name", self.base_model_name.clone()),
            ("batch_size", self.batch_size.to_string()),
            ("workers", self.workers.to_string()),
            ("checkpoint_extension", self.checkpoint_extension.clone()),
        ]
    }
}

/// Executes a parameterized notebook
pub trait NotebookRunner {
    fn execute(
        &self,
        template: &Path,
        output: &Path,
        parameters: &NotebookParameters,
        kernel_name: &str,
    ) -> anyhow::Result<()>;
}

/// Export targets for an executed notebook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Html,
    Pdf,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Html => write!(f, "html"),
            ExportFormat::Pdf => write!(f, "pdf"),
        }
    }
}

/// Converts an executed notebook into a shareable document
pub trait NotebookExporter {
    fn export(&self, notebook: &Path, format: ExportFormat, output: &Path) -> anyhow::Result<()>;
}

/// Runs templates with the `papermill` CLI
#[derive(Debug, Clone)]
pub struct PapermillRunner {
    pub program: PathBuf,
}

impl Default for PapermillRunner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("papermill"),
        }
    }
}

impl NotebookRunner for PapermillRunner {
    fn execute(
        &self,
        template: &Path,
        output: &Path,
        parameters: &NotebookParameters,
        kernel_name: &str,
    ) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(template).arg(output).args(["-k", kernel_name]);
        for (name, value) in parameters.pairs() {
            cmd.args(["-p", name]).arg(value);
        }
        run_tool(cmd)
    }
}

/// Exports notebooks with `jupyter nbconvert`
#[derive(Debug, Clone)]
pub struct NbconvertExporter {
    pub program: PathBuf,
}

impl Default for NbconvertExporter {
    fn default() -> Self {
        Self {
            program: PathBuf::from("jupyter"),
        }
    }
}

impl NotebookExporter for NbconvertExporter {
    fn export(&self, notebook: &Path, format: ExportFormat, output: &Path) -> anyhow::Result<()> {
        let output_dir = output
            .parent()
            .context("export path has no parent directory")?;
        let output_name = output
            .file_name()
            .context("export path has no file name")?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("nbconvert")
            .arg(format!("--to={}", format))
            .arg("--output")
            .arg(output_name)
            .arg("--output-dir")
            .arg(output_dir)
            .arg(notebook);
        run_tool(cmd)
    }
}

fn run_tool(mut cmd: Command) -> anyhow::Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    tracing::debug!("Running {:?}", cmd);

    let output = cmd
        .output()
        .with_context(|| format!("Failed to start {}", program))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Files produced by a report run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifacts {
    pub notebook: PathBuf,
    pub html: Option<PathBuf>,
    pub pdf: Option<PathBuf>,
}

/// Everything needed to build the report of one evaluation
pub struct ReportBuilder<'a> {
    pub evaluation_dir: &'a Path,
    pub template: &'a Path,
    pub kernel_name: &'a str,
    pub parameters: NotebookParameters,
    pub runner: &'a dyn NotebookRunner,
    pub exporter: &'a dyn NotebookExporter,
}

impl ReportBuilder<'_> {
    /// Execute the template, then export the requested formats
    pub fn build(&self, report_html: bool, report_pdf: bool) -> Result<ReportArtifacts> {
        let notebook = self.evaluation_dir.join(NOTEBOOK_FILE);

        self.runner
            .execute(self.template, &notebook, &self.parameters, self.kernel_name)
            .map_err(|e| EvalError::external("notebook execution", e))?;

        let mut artifacts = ReportArtifacts {
            notebook,
            html: None,
            pdf: None,
        };

        if report_html {
            tracing::info!("****** Create HTML ******");
            artifacts.html = Some(self.export(&artifacts.notebook, ExportFormat::Html, HTML_FILE)?);
        }

        if report_pdf {
            tracing::info!("****** Create PDF ******");
            artifacts.pdf = Some(self.export(&artifacts.notebook, ExportFormat::Pdf, PDF_FILE)?);
        }

        Ok(artifacts)
    }

    fn export(&self, notebook: &Path, format: ExportFormat, file: &str) -> Result<PathBuf> {
        let path = self.evaluation_dir.join(file);
        self.exporter
            .export(notebook, format, &path)
            .map_err(|e| EvalError::external("notebook export", e))?;
        Ok(path)
    }
}
