// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation metrics for multi-class classification
//!
//! Implements standard ML metrics:
//! - Confusion Matrix (raw counts and row-normalized)
//! - Accuracy
//! - Per-class Precision, Recall, F1-Score
//! - Macro and support-weighted averages

use serde::{Deserialize, Serialize};

/// Confusion matrix; rows index the first label argument, columns the second
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub n_classes: usize,
    /// `counts[i][j]`: samples with row label `i` and column label `j`
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Create from ground truth (rows) and predictions (columns)
    pub fn from_labels(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Self {
        assert_eq!(y_true.len(), y_pred.len(), "Prediction and ground truth lengths must match");

        let mut counts = vec![vec![0; n_classes]; n_classes];
        for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
            if t < n_classes && p < n_classes {
                counts[t][p] += 1;
            }
        }

        Self { n_classes, counts }
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.counts.iter().map(|row| row.iter().sum::<usize>()).sum()
    }

    /// Sum of the diagonal
    pub fn trace(&self) -> usize {
        (0..self.n_classes).map(|i| self.counts[i][i]).sum()
    }

    pub fn row_sum(&self, row: usize) -> usize {
        self.counts[row].iter().sum()
    }

    pub fn column_sum(&self, col: usize) -> usize {
        self.counts.iter().map(|row| row[col]).sum()
    }

    /// Each row divided by its sum; rows without samples stay zero
    pub fn normalized(&self) -> Vec<Vec<f64>> {
        self.counts
            .iter()
            .map(|row| {
                let sum: usize = row.iter().sum();
                row.iter()
                    .map(|&c| if sum == 0 { 0.0 } else { c as f64 / sum as f64 })
                    .collect()
            })
            .collect()
    }
}

/// Row-normalized confusion matrix, rows = true label, columns = predicted.
///
/// Cell `(i, j)` is the fraction of class-`i` samples predicted as `j`.
pub fn recall_confusion_matrix(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Vec<Vec<f64>> {
    ConfusionMatrix::from_labels(y_true, y_pred, n_classes).normalized()
}

/// Row-normalized confusion matrix with the label arguments swapped.
///
/// Rows are predicted labels and columns true labels, so cell `(i, j)` is the
/// fraction of samples predicted as `i` whose true class is `j`. The diagonal
/// equals per-class precision, but the matrix as a whole is a distribution of
/// true classes per prediction, not a precision table.
pub fn precision_confusion_matrix(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> Vec<Vec<f64>> {
    ConfusionMatrix::from_labels(y_pred, y_true, n_classes).normalized()
}

/// Fraction of exact matches
pub fn accuracy_score(y_true: &[usize], y_pred: &[usize]) -> f64 {
    assert_eq!(y_true.len(), y_pred.len(), "Prediction and ground truth lengths must match");
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Precision, recall and F1 for one class or an average
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

impl ClassMetrics {
    fn from_counts(tp: usize, fp: usize, fn_: usize) -> Self {
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let denom = precision + recall;
        let f1_score = if denom == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / denom
        };
        Self {
            precision,
            recall,
            f1_score,
            support: tp + fn_,
        }
    }

    /// `[precision, recall, f1]`, the heat-map column order
    pub fn values(&self) -> [f64; 3] {
        [self.precision, self.recall, self.f1_score]
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

/// Per-class metrics for a named class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedClassMetrics {
    pub name: String,
    #[serde(flatten)]
    pub metrics: ClassMetrics,
}

/// Full multi-class classification report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    pub per_class: Vec<NamedClassMetrics>,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    pub support: usize,
}

/// Column labels of the report heat-map
pub const REPORT_MEASURES: [&str; 3] = ["precision", "recall", "f1-score"];

impl ClassificationReport {
    /// Generate report from ground truth and predictions
    pub fn from_predictions(y_true: &[usize], y_pred: &[usize], class_names: &[String]) -> Self {
        let n_classes = class_names.len();
        let cm = ConfusionMatrix::from_labels(y_true, y_pred, n_classes);

        let per_class: Vec<NamedClassMetrics> = class_names
            .iter()
            .enumerate()
            .map(|(c, name)| {
                let tp = cm.counts[c][c];
                let fp = cm.column_sum(c) - tp;
                let fn_ = cm.row_sum(c) - tp;
                NamedClassMetrics {
                    name: name.clone(),
                    metrics: ClassMetrics::from_counts(tp, fp, fn_),
                }
            })
            .collect();

        let support: usize = per_class.iter().map(|c| c.metrics.support).sum();
        let macro_avg = average(&per_class, |_| 1.0, n_classes as f64, support);
        let weighted_avg = average(&per_class, |m| m.support as f64, support as f64, support);

        Self {
            accuracy: accuracy_score(y_true, y_pred),
            per_class,
            macro_avg,
            weighted_avg,
            support,
        }
    }

    /// Heat-map rows: every class, then `macro avg` and `weighted avg`
    pub fn rows(&self) -> Vec<(String, [f64; 3])> {
        let mut rows: Vec<(String, [f64; 3])> = self
            .per_class
            .iter()
            .map(|c| (c.name.clone(), c.metrics.values()))
            .collect();
        rows.push(("macro avg".to_string(), self.macro_avg.values()));
        rows.push(("weighted avg".to_string(), self.weighted_avg.values()));
        rows
    }

    /// Format as a human-readable table
    pub fn format(&self) -> String {
        let width = self
            .per_class
            .iter()
            .map(|c| c.name.len())
            .max()
            .unwrap_or(0)
            .max("weighted avg".len());

        let mut out = format!(
            "{:>w$}  {:>9} {:>9} {:>9} {:>9}\n\n",
            "", "precision", "recall", "f1-score", "support",
            w = width
        );
        for c in &self.per_class {
            out.push_str(&row_line(&c.name, &c.metrics, width));
        }
        out.push('\n');
        out.push_str(&format!(
            "{:>w$}  {:>9} {:>9} {:>9.4} {:>9}\n",
            "accuracy", "", "", self.accuracy, self.support,
            w = width
        ));
        out.push_str(&row_line("macro avg", &self.macro_avg, width));
        out.push_str(&row_line("weighted avg", &self.weighted_avg, width));
        out
    }
}

fn row_line(name: &str, m: &ClassMetrics, width: usize) -> String {
    format!(
        "{:>w$}  {:>9.4} {:>9.4} {:>9.4} {:>9}\n",
        name, m.precision, m.recall, m.f1_score, m.support,
        w = width
    )
}

fn average(
    per_class: &[NamedClassMetrics],
    weight: impl Fn(&ClassMetrics) -> f64,
    total_weight: f64,
    support: usize,
) -> ClassMetrics {
    if total_weight == 0.0 {
        return ClassMetrics {
            support,
            ..ClassMetrics::default()
        };
    }
    let mut avg = ClassMetrics {
        support,
        ..ClassMetrics::default()
    };
    for c in per_class {
        let w = weight(&c.metrics);
        avg.precision += w * c.metrics.precision;
        avg.recall += w * c.metrics.recall;
        avg.f1_score += w * c.metrics.f1_score;
    }
    avg.precision /= total_weight;
    avg.recall /= total_weight;
    avg.f1_score /= total_weight;
    avg
}
