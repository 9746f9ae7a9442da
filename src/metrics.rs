//! Regression metrics and timings describing a training run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Held-out evaluation of a fitted pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EvaluationMetrics {
    /// Cleaned rows used by the run.
    pub rows: usize,
    /// Rows in the training split.
    pub train_rows: usize,
    /// Rows in the test split.
    pub test_rows: usize,
    /// Mean absolute error on the test split.
    pub mae: f64,
    /// Root mean squared error on the test split.
    pub rmse: f64,
    /// Coefficient of determination on the test split.
    pub r2: f64,
}

impl EvaluationMetrics {
    /// Scores `predictions` against `truth` for a split of the given sizes.
    #[must_use]
    pub fn evaluate(truth: &[f64], predictions: &[f64], train_rows: usize) -> Self {
        Self {
            rows: train_rows + truth.len(),
            train_rows,
            test_rows: truth.len(),
            mae: mean_absolute_error(truth, predictions),
            rmse: root_mean_squared_error(truth, predictions),
            r2: r2_score(truth, predictions),
        }
    }
}

/// Mean of `|y - ŷ|`; zero for empty input.
#[must_use]
pub fn mean_absolute_error(truth: &[f64], predictions: &[f64]) -> f64 {
    let n = truth.len().min(predictions.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = truth
        .iter()
        .zip(predictions)
        .map(|(y, p)| (y - p).abs())
        .sum();
    total / n as f64
}

/// Square root of the mean of `(y - ŷ)²`; zero for empty input.
#[must_use]
pub fn root_mean_squared_error(truth: &[f64], predictions: &[f64]) -> f64 {
    let n = truth.len().min(predictions.len());
    if n == 0 {
        return 0.0;
    }
    let total: f64 = truth
        .iter()
        .zip(predictions)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    (total / n as f64).sqrt()
}

/// `1 - SS_res / SS_tot`.
///
/// When the truth is constant the ratio is undefined; the score is then `1.0`
/// for a perfect fit and `0.0` otherwise, so the value always serialises as a
/// finite number.
#[must_use]
pub fn r2_score(truth: &[f64], predictions: &[f64]) -> f64 {
    let n = truth.len().min(predictions.len());
    if n == 0 {
        return 0.0;
    }
    let mean = truth[..n].iter().sum::<f64>() / n as f64;
    let ss_tot: f64 = truth[..n].iter().map(|y| (y - mean).powi(2)).sum();
    let ss_res: f64 = truth
        .iter()
        .zip(predictions)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Wall-clock time spent in each training stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageTimings {
    /// Corpus fetch.
    pub fetch: Duration,
    /// Cleaning and coercion.
    pub clean: Duration,
    /// Vocabulary derivation and row assembly.
    pub assemble: Duration,
    /// Pipeline fit.
    pub fit: Duration,
    /// Held-out evaluation.
    pub evaluate: Duration,
    /// Artifact persistence.
    pub persist: Duration,
}

impl StageTimings {
    /// Sum of every stage.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.fetch + self.clean + self.assemble + self.fit + self.evaluate + self.persist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions() {
        let y = [1.0, 2.0, 3.0];
        assert_eq!(mean_absolute_error(&y, &y), 0.0);
        assert_eq!(root_mean_squared_error(&y, &y), 0.0);
        assert!((r2_score(&y, &y) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn known_values() {
        let y = [3.0, -0.5, 2.0, 7.0];
        let p = [2.5, 0.0, 2.0, 8.0];
        assert!((mean_absolute_error(&y, &p) - 0.5).abs() < 1e-12);
        assert!((root_mean_squared_error(&y, &p) - 0.375f64.sqrt()).abs() < 1e-12);
        assert!((r2_score(&y, &p) - 0.948_608_137_044_967_9).abs() < 1e-9);
    }

    #[test]
    fn constant_truth_is_finite() {
        assert_eq!(r2_score(&[2.0, 2.0], &[2.0, 2.0]), 1.0);
        assert_eq!(r2_score(&[2.0, 2.0], &[1.0, 3.0]), 0.0);
        assert_eq!(r2_score(&[], &[]), 0.0);
    }

    #[test]
    fn evaluate_reports_split_sizes() {
        let metrics = EvaluationMetrics::evaluate(&[1.0, 2.0], &[1.5, 2.5], 8);
        assert_eq!(metrics.rows, 10);
        assert_eq!(metrics.train_rows, 8);
        assert_eq!(metrics.test_rows, 2);
        assert!((metrics.mae - 0.5).abs() < 1e-12);
    }
}
