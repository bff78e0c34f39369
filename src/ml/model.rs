use anyhow::{anyhow, Result};
use ndarray::{Array2, Axis};
use tracing::info;

/// Training report after model fit
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub samples: usize,
    pub accuracy: f64,
    pub edges_in_data: usize,
    pub flats_in_data: usize,
}

impl TrainingReport {
    pub(crate) fn new(samples: usize, correct: usize, labels: &[bool]) -> Self {
        let edges = labels.iter().filter(|&&y| y).count();
        Self {
            samples,
            accuracy: if samples > 0 { correct as f64 / samples as f64 } else { 0.0 },
            edges_in_data: edges,
            flats_in_data: samples - edges,
        }
    }
}

/// Binary probabilistic classifier behind the directional filter.
pub trait EdgeClassifier: Send {
    fn name(&self) -> &'static str;

    /// Full refit on the given rows; replaces any previous fit.
    fn fit(&mut self, features: &Array2<f64>, labels: &[bool]) -> Result<TrainingReport>;

    /// Probability that the row is an edge bar. `None` until fitted.
    fn predict_proba(&self, features: &[f64]) -> Option<f64>;

    fn is_trained(&self) -> bool;
}

/// Logistic regression coefficients plus the z-score parameters they were fit on
#[derive(Debug, Clone)]
struct ModelWeights {
    coefficients: Vec<f64>,
    intercept: f64,
    feature_means: Vec<f64>,
    feature_stds: Vec<f64>,
}

/// Edge classifier using L2-regularized logistic regression
pub struct LogisticEdgeModel {
    weights: Option<ModelWeights>,
    max_iter: usize,
    learning_rate: f64,
    lambda: f64,
}

impl LogisticEdgeModel {
    pub fn new() -> Self {
        Self {
            weights: None,
            max_iter: 1000,
            learning_rate: 0.01,
            lambda: 0.01,
        }
    }

    /// Fit logistic regression via gradient descent
    fn fit_logistic_regression(&self, features: &Array2<f64>, labels: &[f64]) -> (Vec<f64>, f64) {
        let n = features.nrows();
        let num_features = features.ncols();

        let mut coefficients = vec![0.0; num_features];
        let mut intercept = 0.0;

        for _iter in 0..self.max_iter {
            let mut grad_coef = vec![0.0; num_features];
            let mut grad_intercept = 0.0;

            for i in 0..n {
                let mut z = intercept;
                for j in 0..num_features {
                    z += coefficients[j] * features[[i, j]];
                }
                let error = sigmoid(z) - labels[i];

                grad_intercept += error;
                for j in 0..num_features {
                    grad_coef[j] += error * features[[i, j]];
                }
            }

            intercept -= self.learning_rate * grad_intercept / n as f64;
            for j in 0..num_features {
                coefficients[j] -= self.learning_rate * (grad_coef[j] / n as f64 + self.lambda * coefficients[j]);
            }
        }

        (coefficients, intercept)
    }
}

impl Default for LogisticEdgeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeClassifier for LogisticEdgeModel {
    fn name(&self) -> &'static str {
        "logistic"
    }

    fn fit(&mut self, features: &Array2<f64>, labels: &[bool]) -> Result<TrainingReport> {
        let n = features.nrows();
        if n == 0 || n != labels.len() {
            return Err(anyhow!("Invalid training set: {} rows, {} labels", n, labels.len()));
        }
        let num_features = features.ncols();

        let means = features
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("Cannot compute feature means"))?;
        let stds = features.std_axis(Axis(0), if n > 1 { 1.0 } else { 0.0 });

        // Normalize features (z-score)
        let mut normalized = Array2::<f64>::zeros((n, num_features));
        for j in 0..num_features {
            let std = stds[j];
            if std > 1e-10 {
                for i in 0..n {
                    normalized[[i, j]] = (features[[i, j]] - means[j]) / std;
                }
            }
        }

        let targets: Vec<f64> = labels.iter().map(|&y| if y { 1.0 } else { 0.0 }).collect();
        let (coefficients, intercept) = self.fit_logistic_regression(&normalized, &targets);

        let mut correct = 0;
        for i in 0..n {
            let mut z = intercept;
            for j in 0..num_features {
                z += coefficients[j] * normalized[[i, j]];
            }
            if (sigmoid(z) >= 0.5) == labels[i] {
                correct += 1;
            }
        }

        self.weights = Some(ModelWeights {
            coefficients,
            intercept,
            feature_means: means.to_vec(),
            feature_stds: stds.to_vec(),
        });

        let report = TrainingReport::new(n, correct, labels);
        info!(
            "Logistic edge model trained: {} samples, {:.1}% accuracy, {}/{} edges",
            n,
            report.accuracy * 100.0,
            report.edges_in_data,
            n
        );
        Ok(report)
    }

    fn predict_proba(&self, features: &[f64]) -> Option<f64> {
        let weights = self.weights.as_ref()?;
        if features.len() != weights.coefficients.len() {
            return None;
        }

        let mut z = weights.intercept;
        for (j, &x) in features.iter().enumerate() {
            let std = weights.feature_stds[j];
            let normalized = if std > 1e-10 {
                (x - weights.feature_means[j]) / std
            } else {
                0.0
            };
            z += weights.coefficients[j] * normalized;
        }

        Some(sigmoid(z))
    }

    fn is_trained(&self) -> bool {
        self.weights.is_some()
    }
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
