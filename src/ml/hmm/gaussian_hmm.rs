use ndarray::{Array1, Array2};
use std::f64::consts::PI;
use thiserror::Error;

/// Floor added to every covariance diagonal during EM.
const MIN_COVAR: f64 = 1e-3;
/// Gamma mass below which a state keeps its previous parameters.
const MIN_STATE_WEIGHT: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum HmmError {
    #[error("insufficient data for training: {got} observations, need {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("observation features mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("covariance of state {0} is not positive definite")]
    NotPositiveDefinite(usize),

    #[error("non-finite value during {0}")]
    NonFinite(&'static str),
}

pub type HmmResult<T> = std::result::Result<T, HmmError>;

/// Hidden Markov Model with full-covariance Gaussian emissions.
#[derive(Debug, Clone)]
pub struct GaussianHmm {
    pub n_states: usize,
    pub n_features: usize,
    /// State transition matrix (n_states x n_states)
    pub transition: Array2<f64>,
    /// Initial state probabilities
    pub start_prob: Array1<f64>,
    /// Mean vectors (n_states x n_features)
    pub means: Array2<f64>,
    /// One covariance matrix per state
    pub covars: Vec<Array2<f64>>,
    /// Lower Cholesky factors of `covars`, refreshed whenever they change
    chol: Vec<Array2<f64>>,
}

impl GaussianHmm {
    /// Uniform start/transition probabilities, zero means, identity covariances.
    pub fn new(n_states: usize, n_features: usize) -> Self {
        let start_prob = Array1::from_elem(n_states, 1.0 / n_states as f64);
        let transition = Array2::from_elem((n_states, n_states), 1.0 / n_states as f64);
        let covars = vec![Array2::eye(n_features); n_states];
        let chol = covars.clone();

        Self {
            n_states,
            n_features,
            transition,
            start_prob,
            means: Array2::zeros((n_states, n_features)),
            covars,
            chol,
        }
    }

    /// K-means for the means, global data covariance for every state.
    fn init_with_kmeans(&mut self, observations: &Array2<f64>) -> HmmResult<()> {
        let n_obs = observations.nrows();
        let mut labels: Vec<usize> = (0..n_obs).map(|i| (i * self.n_states) / n_obs).collect();

        for _ in 0..10 {
            let mut sums = Array2::<f64>::zeros((self.n_states, self.n_features));
            let mut counts = vec![0usize; self.n_states];
            for (i, &label) in labels.iter().enumerate() {
                for j in 0..self.n_features {
                    sums[[label, j]] += observations[[i, j]];
                }
                counts[label] += 1;
            }
            for state in 0..self.n_states {
                if counts[state] > 0 {
                    for j in 0..self.n_features {
                        self.means[[state, j]] = sums[[state, j]] / counts[state] as f64;
                    }
                }
            }

            let mut changed = false;
            for i in 0..n_obs {
                let mut min_dist = f64::INFINITY;
                let mut best_state = labels[i];
                for state in 0..self.n_states {
                    let dist: f64 = (0..self.n_features)
                        .map(|j| (observations[[i, j]] - self.means[[state, j]]).powi(2))
                        .sum();
                    if dist < min_dist {
                        min_dist = dist;
                        best_state = state;
                    }
                }
                if best_state != labels[i] {
                    labels[i] = best_state;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Global covariance
        let mut global_mean = Array1::<f64>::zeros(self.n_features);
        for i in 0..n_obs {
            global_mean += &observations.row(i);
        }
        global_mean /= n_obs as f64;

        let mut cov = Array2::<f64>::zeros((self.n_features, self.n_features));
        for i in 0..n_obs {
            let diff = &observations.row(i) - &global_mean;
            for a in 0..self.n_features {
                for b in 0..self.n_features {
                    cov[[a, b]] += diff[a] * diff[b];
                }
            }
        }
        cov /= (n_obs - 1).max(1) as f64;
        for a in 0..self.n_features {
            cov[[a, a]] += MIN_COVAR;
        }

        self.covars = vec![cov; self.n_states];
        self.refresh_cholesky()
    }

    fn refresh_cholesky(&mut self) -> HmmResult<()> {
        self.chol = self
            .covars
            .iter()
            .enumerate()
            .map(|(state, cov)| cholesky(cov).ok_or(HmmError::NotPositiveDefinite(state)))
            .collect::<HmmResult<Vec<_>>>()?;
        Ok(())
    }

    /// Add `reg` to every covariance diagonal.
    pub fn regularize_covariances(&mut self, reg: f64) -> HmmResult<()> {
        for cov in &mut self.covars {
            for i in 0..self.n_features {
                cov[[i, i]] += reg;
            }
        }
        self.refresh_cholesky()
    }

    /// Log density of every observation under every state (n_obs x n_states).
    fn log_emissions(&self, observations: &Array2<f64>) -> Array2<f64> {
        let n_obs = observations.nrows();
        let k = self.n_features as f64;
        let mut out = Array2::zeros((n_obs, self.n_states));
        let mut y = vec![0.0; self.n_features];

        for state in 0..self.n_states {
            let l = &self.chol[state];
            let log_det: f64 = 2.0 * (0..self.n_features).map(|i| l[[i, i]].ln()).sum::<f64>();
            let log_norm = -0.5 * (k * (2.0 * PI).ln() + log_det);

            for t in 0..n_obs {
                // Solve L y = (x - mu); Mahalanobis distance is |y|^2
                let mut mahal = 0.0;
                for i in 0..self.n_features {
                    let mut s = observations[[t, i]] - self.means[[state, i]];
                    for j in 0..i {
                        s -= l[[i, j]] * y[j];
                    }
                    y[i] = s / l[[i, i]];
                    mahal += y[i] * y[i];
                }
                out[[t, state]] = log_norm - 0.5 * mahal;
            }
        }
        out
    }

    fn forward(&self, log_b: &Array2<f64>) -> (Array2<f64>, f64) {
        let n_obs = log_b.nrows();
        let log_a = self.transition.mapv(f64::ln);
        let mut log_alpha = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut terms = vec![0.0; self.n_states];

        for state in 0..self.n_states {
            log_alpha[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        for t in 1..n_obs {
            for j in 0..self.n_states {
                for i in 0..self.n_states {
                    terms[i] = log_alpha[[t - 1, i]] + log_a[[i, j]];
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());
        (log_alpha, log_prob)
    }

    fn backward(&self, log_b: &Array2<f64>) -> Array2<f64> {
        let n_obs = log_b.nrows();
        let log_a = self.transition.mapv(f64::ln);
        let mut log_beta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut terms = vec![0.0; self.n_states];

        for state in 0..self.n_states {
            log_beta[[n_obs - 1, state]] = 0.0;
        }

        for t in (0..n_obs - 1).rev() {
            for i in 0..self.n_states {
                for j in 0..self.n_states {
                    terms[j] = log_a[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    fn posteriors(&self, log_alpha: &Array2<f64>, log_beta: &Array2<f64>) -> Array2<f64> {
        let n_obs = log_alpha.nrows();
        let mut gamma = Array2::zeros((n_obs, self.n_states));
        let mut terms = vec![0.0; self.n_states];

        for t in 0..n_obs {
            for s in 0..self.n_states {
                terms[s] = log_alpha[[t, s]] + log_beta[[t, s]];
            }
            let log_denom = log_sum_exp(&terms);
            for s in 0..self.n_states {
                gamma[[t, s]] = (terms[s] - log_denom).exp();
            }
        }
        gamma
    }

    fn check_shape(&self, observations: &Array2<f64>, need: usize) -> HmmResult<()> {
        if observations.ncols() != self.n_features {
            return Err(HmmError::DimensionMismatch {
                expected: self.n_features,
                got: observations.ncols(),
            });
        }
        if observations.nrows() < need {
            return Err(HmmError::InsufficientData { got: observations.nrows(), need });
        }
        Ok(())
    }

    /// Baum-Welch EM. Returns (log likelihood, iterations run).
    pub fn fit(&mut self, observations: &Array2<f64>, n_iter: usize, tol: f64) -> HmmResult<(f64, usize)> {
        self.check_shape(observations, 2)?;
        if observations.iter().any(|v| !v.is_finite()) {
            return Err(HmmError::NonFinite("training data"));
        }

        self.init_with_kmeans(observations)?;

        let n_obs = observations.nrows();
        let mut prev_log_prob = f64::NEG_INFINITY;

        for iteration in 0..n_iter {
            // E-step
            let log_b = self.log_emissions(observations);
            let (log_alpha, log_prob) = self.forward(&log_b);
            if !log_prob.is_finite() {
                return Err(HmmError::NonFinite("forward pass"));
            }
            let log_beta = self.backward(&log_b);

            let gamma = self.posteriors(&log_alpha, &log_beta);

            let log_a = self.transition.mapv(f64::ln);
            let mut xi_sum = Array2::<f64>::zeros((self.n_states, self.n_states));
            for t in 0..n_obs - 1 {
                for i in 0..self.n_states {
                    for j in 0..self.n_states {
                        let log_xi = log_alpha[[t, i]] + log_a[[i, j]] + log_b[[t + 1, j]]
                            + log_beta[[t + 1, j]]
                            - log_prob;
                        xi_sum[[i, j]] += log_xi.exp();
                    }
                }
            }

            // M-step
            for state in 0..self.n_states {
                self.start_prob[state] = gamma[[0, state]];
            }

            for i in 0..self.n_states {
                let row_sum: f64 = xi_sum.row(i).sum();
                if row_sum > 0.0 {
                    for j in 0..self.n_states {
                        self.transition[[i, j]] = xi_sum[[i, j]] / row_sum;
                    }
                }
            }

            for state in 0..self.n_states {
                let gamma_sum: f64 = gamma.column(state).sum();
                if gamma_sum < MIN_STATE_WEIGHT {
                    continue;
                }

                for feat in 0..self.n_features {
                    let weighted: f64 = (0..n_obs).map(|t| gamma[[t, state]] * observations[[t, feat]]).sum();
                    self.means[[state, feat]] = weighted / gamma_sum;
                }

                let mut cov = Array2::<f64>::zeros((self.n_features, self.n_features));
                for t in 0..n_obs {
                    let w = gamma[[t, state]];
                    for a in 0..self.n_features {
                        let da = observations[[t, a]] - self.means[[state, a]];
                        for b in 0..self.n_features {
                            let db = observations[[t, b]] - self.means[[state, b]];
                            cov[[a, b]] += w * da * db;
                        }
                    }
                }
                cov /= gamma_sum;
                for a in 0..self.n_features {
                    cov[[a, a]] += MIN_COVAR;
                }
                self.covars[state] = cov;
            }

            if self.means.iter().any(|v| !v.is_finite()) {
                return Err(HmmError::NonFinite("mean update"));
            }
            self.refresh_cholesky()?;

            // Converged iterations still apply their M-step
            let converged = (log_prob - prev_log_prob).abs() < tol;
            prev_log_prob = log_prob;
            if converged {
                return Ok((log_prob, iteration + 1));
            }
        }

        // Did not converge within n_iter iterations
        Ok((prev_log_prob, n_iter))
    }

    /// Posterior state probabilities for every observation (n_obs x n_states).
    pub fn predict_proba(&self, observations: &Array2<f64>) -> HmmResult<Array2<f64>> {
        self.check_shape(observations, 1)?;

        let log_b = self.log_emissions(observations);
        let (log_alpha, log_prob) = self.forward(&log_b);
        if !log_prob.is_finite() {
            return Err(HmmError::NonFinite("forward pass"));
        }
        let log_beta = self.backward(&log_b);
        Ok(self.posteriors(&log_alpha, &log_beta))
    }

    /// Log likelihood of the sequence under the current parameters.
    pub fn score(&self, observations: &Array2<f64>) -> HmmResult<f64> {
        self.check_shape(observations, 1)?;
        let log_b = self.log_emissions(observations);
        Ok(self.forward(&log_b).1)
    }
}

/// Lower Cholesky factor, or `None` if the matrix is not positive definite.
fn cholesky(mat: &Array2<f64>) -> Option<Array2<f64>> {
    let n = mat.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = mat[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Log-sum-exp trick for numerical stability
fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}
