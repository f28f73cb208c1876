// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation results: summary, JSON persistence, markdown and CSV exports

use crate::metrics::{ClassificationReport, ConfusionMatrix};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The checkpoint an evaluation was run against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub path: PathBuf,
    pub accuracy_token: String,
    pub sha256: String,
}

/// Complete results of one interactive evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub checkpoint: CheckpointInfo,
    pub base_model_name: String,
    pub n_samples: usize,
    pub classes: Vec<String>,
    pub label_distribution: Vec<usize>,
    pub accuracy: f64,
    pub report: ClassificationReport,
    pub confusion_matrix: ConfusionMatrix,
    pub recall_matrix: Vec<Vec<f64>>,
    pub precision_matrix: Vec<Vec<f64>>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl EvaluationResults {
    /// Save results to JSON file
    pub fn save(&self, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(output_path, json)?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Raw confusion counts as CSV, rows = true label, columns = predicted
    pub fn write_confusion_csv(&self, output_path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(output_path)?;

        let mut header = vec!["true\\predicted".to_string()];
        header.extend(self.classes.iter().cloned());
        writer.write_record(&header)?;

        for (name, row) in self.classes.iter().zip(&self.confusion_matrix.counts) {
            let mut record = vec![name.clone()];
            record.extend(row.iter().map(|c| c.to_string()));
            writer.write_record(&record)?;
        }

        writer.flush()?;
        tracing::info!("Confusion matrix saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(&self) -> String {
        let mut report = String::new();

        report.push_str("# Classifier Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", self.version));

        report.push_str("## Model\n\n");
        report.push_str(&format!("- **Checkpoint:** {}\n", self.checkpoint.path.display()));
        report.push_str(&format!("- **Accuracy token:** {}\n", self.checkpoint.accuracy_token));
        report.push_str(&format!("- **SHA-256:** {}\n", self.checkpoint.sha256));
        report.push_str(&format!("- **Base model:** {}\n\n", self.base_model_name));

        report.push_str("## Test Set\n\n");
        report.push_str(&format!("- **Samples:** {}\n", self.n_samples));
        report.push_str(&format!("- **Classes:** {}\n\n", self.classes.len()));
        report.push_str("| Class | Samples |\n");
        report.push_str("|-------|---------|\n");
        for (name, count) in self.classes.iter().zip(&self.label_distribution) {
            report.push_str(&format!("| {} | {} |\n", name, count));
        }

        report.push_str(&format!("\n## Accuracy: {:.2}%\n\n", self.accuracy * 100.0));
        report.push_str("### Classification Report\n\n");
        report.push_str(&format!("```\n{}```\n\n", self.report.format()));

        report.push_str("### Confusion Matrix (recall)\n\n");
        push_matrix(&mut report, &self.classes, &self.recall_matrix);
        report.push_str("\n### Confusion Matrix (precision)\n\n");
        push_matrix(&mut report, &self.classes, &self.precision_matrix);

        report
    }
}

fn push_matrix(report: &mut String, classes: &[String], matrix: &[Vec<f64>]) {
    report.push_str("| |");
    for name in classes {
        report.push_str(&format!(" {} |", name));
    }
    report.push_str("\n|---|");
    for _ in classes {
        report.push_str("---|");
    }
    report.push('\n');
    for (name, row) in classes.iter().zip(matrix) {
        report.push_str(&format!("| **{}** |", name));
        for v in row {
            report.push_str(&format!(" {:.2} |", v));
        }
        report.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{precision_confusion_matrix, recall_confusion_matrix};

    fn results() -> EvaluationResults {
        let classes = vec!["cat".to_string(), "dog".to_string()];
        let y_true = vec![0, 0, 1, 1];
        let y_pred = vec![0, 1, 1, 1];
        EvaluationResults {
            checkpoint: CheckpointInfo {
                path: PathBuf::from("/job/models/model_mobilenet_02_0.750.hdf5"),
                accuracy_token: "0.750".to_string(),
                sha256: "00".repeat(32),
            },
            base_model_name: "MobileNet".to_string(),
            n_samples: 4,
            label_distribution: vec![2, 2],
            accuracy: 0.75,
            report: ClassificationReport::from_predictions(&y_true, &y_pred, &classes),
            confusion_matrix: ConfusionMatrix::from_labels(&y_true, &y_pred, 2),
            recall_matrix: recall_confusion_matrix(&y_true, &y_pred, 2),
            precision_matrix: precision_confusion_matrix(&y_true, &y_pred, 2),
            classes,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    #[test]
    fn test_generate_report() {
        let report = results().generate_report();

        assert!(report.contains("Classifier Evaluation Report"));
        assert!(report.contains("## Accuracy: 75.00%"));
        assert!(report.contains("| **cat** | 0.50 | 0.50 |"));
    }

    #[test]
    fn test_save_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let r = results();

        let json_path = dir.path().join("out/results.json");
        r.save(&json_path).unwrap();
        let loaded: EvaluationResults =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(loaded.confusion_matrix, r.confusion_matrix);

        let csv_path = dir.path().join("cm.csv");
        r.write_confusion_csv(&csv_path).unwrap();
        let csv = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(csv.lines().nth(1), Some("cat,1,1"));
        assert_eq!(csv.lines().nth(2), Some("dog,0,2"));
    }
}
