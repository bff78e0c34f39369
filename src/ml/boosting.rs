//! Gradient-boosted decision trees for binary classification.
//!
//! Trees are grown greedily on second-order statistics of the logistic loss
//! (gradient `p - y`, hessian `p(1 - p)`). Split gain and leaf weights follow
//! the usual regularized form:
//!
//! ```text
//! gain = ½ [G_L² / (H_L + λ) + G_R² / (H_R + λ) − G² / (H + λ)] − γ
//! leaf = −η · G / (H + λ)
//! ```

use anyhow::{anyhow, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::model::{sigmoid, EdgeClassifier, TrainingReport};
use crate::config::GbdtSettings;

const MIN_HESSIAN: f64 = 1e-16;
const PRIOR_CLAMP: f64 = 1e-6;

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value } => return *value,
                Node::Split { feature, threshold, left, right } => {
                    idx = if row[*feature] < *threshold { *left } else { *right };
                }
            }
        }
    }

    fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Grows one tree over the sampled rows and columns.
struct TreeBuilder<'a> {
    settings: &'a GbdtSettings,
    features: &'a Array2<f64>,
    grad: &'a [f64],
    hess: &'a [f64],
    columns: &'a [usize],
    nodes: Vec<Node>,
}

impl<'a> TreeBuilder<'a> {
    fn build(mut self, rows: Vec<usize>) -> Tree {
        self.grow(rows, 0);
        Tree { nodes: self.nodes }
    }

    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g: f64 = rows.iter().map(|&i| self.grad[i]).sum();
        let h: f64 = rows.iter().map(|&i| self.hess[i]).sum();
        let value = self.leaf_value(g, h);
        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf { value });

        if depth >= self.settings.max_depth || rows.len() < 2 {
            return idx;
        }
        let Some(split) = self.best_split(&rows, g, h) else {
            return idx;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .into_iter()
            .partition(|&i| self.features[[i, split.feature]] < split.threshold);

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -self.settings.learning_rate * g / (h + self.settings.reg_lambda)
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.settings.reg_lambda)
    }

    /// Exact greedy search over every distinct value boundary.
    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = self.score(g, h);
        let mut best: Option<SplitCandidate> = None;

        for &feature in self.columns {
            let mut sorted = rows.to_vec();
            sorted.sort_by(|&a, &b| self.features[[a, feature]].total_cmp(&self.features[[b, feature]]));

            let mut g_left = 0.0;
            let mut h_left = 0.0;
            for pair in sorted.windows(2) {
                let (i, next) = (pair[0], pair[1]);
                g_left += self.grad[i];
                h_left += self.hess[i];

                let x = self.features[[i, feature]];
                let x_next = self.features[[next, feature]];
                if x_next <= x {
                    continue;
                }

                let h_right = h - h_left;
                if h_left < self.settings.min_child_weight || h_right < self.settings.min_child_weight {
                    continue;
                }

                let gain = 0.5 * (self.score(g_left, h_left) + self.score(g - g_left, h_right) - parent)
                    - self.settings.gamma;
                if gain > best.map_or(0.0, |b| b.gain) {
                    best = Some(SplitCandidate {
                        feature,
                        threshold: 0.5 * (x + x_next),
                        gain,
                    });
                }
            }
        }

        best
    }
}

/// Boosted tree ensemble over the logistic loss.
pub struct GradientBoostedClassifier {
    settings: GbdtSettings,
    base_margin: f64,
    trees: Vec<Tree>,
    n_features: usize,
}

impl GradientBoostedClassifier {
    pub fn new(settings: GbdtSettings) -> Self {
        Self {
            settings,
            base_margin: 0.0,
            trees: Vec::new(),
            n_features: 0,
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn max_tree_depth(&self) -> usize {
        self.trees.iter().map(Tree::depth).max().unwrap_or(0)
    }

    fn margin(&self, row: &[f64]) -> f64 {
        self.base_margin + self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    fn sample_rows(&self, rng: &mut StdRng, n: usize) -> Vec<usize> {
        let rows: Vec<usize> = (0..n).filter(|_| rng.gen::<f64>() < self.settings.subsample).collect();
        if rows.is_empty() {
            (0..n).collect()
        } else {
            rows
        }
    }

    fn sample_columns(&self, rng: &mut StdRng, n_features: usize) -> Vec<usize> {
        let k = ((self.settings.colsample * n_features as f64).round() as usize).clamp(1, n_features);
        let mut cols: Vec<usize> = (0..n_features).collect();
        cols.shuffle(rng);
        cols.truncate(k);
        cols.sort_unstable();
        cols
    }
}

impl EdgeClassifier for GradientBoostedClassifier {
    fn name(&self) -> &'static str {
        "gbdt"
    }

    fn fit(&mut self, features: &Array2<f64>, labels: &[bool]) -> Result<TrainingReport> {
        let (n, n_features) = features.dim();
        if n == 0 || n_features == 0 || n != labels.len() {
            return Err(anyhow!("Invalid training set: {} rows, {} labels", n, labels.len()));
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("Training features contain non-finite values"));
        }

        let targets: Vec<f64> = labels.iter().map(|&y| if y { 1.0 } else { 0.0 }).collect();
        let prior = (targets.iter().sum::<f64>() / n as f64).clamp(PRIOR_CLAMP, 1.0 - PRIOR_CLAMP);
        let base_margin = (prior / (1.0 - prior)).ln();

        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let mut margins = vec![base_margin; n];
        let mut grad = vec![0.0; n];
        let mut hess = vec![0.0; n];
        let mut trees = Vec::with_capacity(self.settings.n_estimators);

        for _ in 0..self.settings.n_estimators {
            for i in 0..n {
                let p = sigmoid(margins[i]);
                grad[i] = p - targets[i];
                hess[i] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }

            let rows = self.sample_rows(&mut rng, n);
            let columns = self.sample_columns(&mut rng, n_features);
            let tree = TreeBuilder {
                settings: &self.settings,
                features,
                grad: &grad,
                hess: &hess,
                columns: &columns,
                nodes: Vec::new(),
            }
            .build(rows);

            for (i, margin) in margins.iter_mut().enumerate() {
                let row = features.row(i);
                if let Some(slice) = row.as_slice() {
                    *margin += tree.predict(slice);
                } else {
                    *margin += tree.predict(&row.to_vec());
                }
            }
            trees.push(tree);
        }

        let correct = margins
            .iter()
            .zip(labels)
            .filter(|&(&m, &y)| (sigmoid(m) >= 0.5) == y)
            .count();

        self.base_margin = base_margin;
        self.trees = trees;
        self.n_features = n_features;

        let report = TrainingReport::new(n, correct, labels);
        info!(
            "GBDT edge model trained: {} samples, {} trees, {:.1}% accuracy, {}/{} edges",
            n,
            self.trees.len(),
            report.accuracy * 100.0,
            report.edges_in_data,
            n
        );
        Ok(report)
    }

    fn predict_proba(&self, features: &[f64]) -> Option<f64> {
        if self.trees.is_empty() || features.len() != self.n_features {
            return None;
        }
        Some(sigmoid(self.margin(features)))
    }

    fn is_trained(&self) -> bool {
        !self.trees.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> GbdtSettings {
        GbdtSettings {
            n_estimators: 40,
            ..GbdtSettings::default()
        }
    }

    /// Edge iff |x0| > 1, which no linear model can separate.
    fn band_data(n: usize) -> (Array2<f64>, Vec<bool>) {
        let mut x = Array2::<f64>::zeros((n, 3));
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let x0 = -3.0 + 6.0 * (i as f64) / (n as f64);
            x[[i, 0]] = x0;
            x[[i, 1]] = ((i * 37) % 11) as f64;
            x[[i, 2]] = 1.0;
            y.push(x0.abs() > 1.0);
        }
        (x, y)
    }

    #[test]
    fn test_untrained_predicts_nothing() {
        let model = GradientBoostedClassifier::new(small_settings());
        assert!(!model.is_trained());
        assert!(model.predict_proba(&[0.0, 0.0, 0.0]).is_none());
    }

    #[test]
    fn test_learns_nonlinear_band() {
        let (x, y) = band_data(300);
        let mut model = GradientBoostedClassifier::new(GbdtSettings {
            n_estimators: 60,
            learning_rate: 0.3,
            ..GbdtSettings::default()
        });
        let report = model.fit(&x, &y).unwrap();

        assert_eq!(report.samples, 300);
        assert!(report.accuracy > 0.9, "accuracy {}", report.accuracy);
        assert!(model.predict_proba(&[2.5, 3.0, 1.0]).unwrap() > 0.5);
        assert!(model.predict_proba(&[-2.5, 3.0, 1.0]).unwrap() > 0.5);
        assert!(model.predict_proba(&[0.0, 3.0, 1.0]).unwrap() < 0.5);
    }

    #[test]
    fn test_trees_respect_max_depth() {
        let (x, y) = band_data(200);
        let mut model = GradientBoostedClassifier::new(small_settings());
        model.fit(&x, &y).unwrap();
        assert_eq!(model.n_trees(), 40);
        assert!(model.max_tree_depth() <= 3);
    }

    #[test]
    fn test_fit_is_deterministic_for_a_seed() {
        let (x, y) = band_data(150);
        let mut a = GradientBoostedClassifier::new(small_settings());
        let mut b = GradientBoostedClassifier::new(small_settings());
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        let row = [0.7, 4.0, 1.0];
        assert_eq!(a.predict_proba(&row), b.predict_proba(&row));
    }

    #[test]
    fn test_single_class_data_predicts_prior() {
        let x = Array2::<f64>::from_elem((20, 2), 1.0);
        let y = vec![false; 20];
        let mut model = GradientBoostedClassifier::new(small_settings());
        model.fit(&x, &y).unwrap();
        let p = model.predict_proba(&[1.0, 1.0]).unwrap();
        assert!(p < 0.01);
    }

    #[test]
    fn test_rejects_bad_training_sets() {
        let mut model = GradientBoostedClassifier::new(small_settings());
        let x = Array2::<f64>::zeros((0, 5));
        assert!(model.fit(&x, &[]).is_err());

        let mut x = Array2::<f64>::zeros((2, 2));
        x[[0, 0]] = f64::NAN;
        assert!(model.fit(&x, &[true, false]).is_err());
    }
}
