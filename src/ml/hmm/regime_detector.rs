use ndarray::Array2;
use tracing::{debug, info};

use super::gaussian_hmm::{GaussianHmm, HmmResult};
use crate::config::RegimeSettings;
use crate::ml::features::{FeatureVector, FeatureWindow};
use crate::types::Regime;

/// Hidden states of the regime HMM.
pub const N_STATES: usize = 2;
/// Column of the return-normalized feature in the observation matrix.
const RET_NORM_DIM: usize = 0;

/// Raw (unsmoothed) regime classification of the latest bar.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeCall {
    pub regime: Regime,
    pub confidence: f64,
    pub reject: bool,
    pub state: Option<usize>,
    pub diagnostic: String,
}

impl RegimeCall {
    pub fn warmup() -> Self {
        Self {
            regime: Regime::NoTrade,
            confidence: 0.0,
            reject: true,
            state: None,
            diagnostic: "warmup".to_string(),
        }
    }
}

/// Hidden state index -> semantic regime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMapping(Vec<Regime>);

impl StateMapping {
    pub fn regime(&self, state: usize) -> Regime {
        self.0.get(state).copied().unwrap_or(Regime::NoTrade)
    }

    pub fn trending_state(&self) -> Option<usize> {
        self.0.iter().position(|r| r.is_trending())
    }
}

impl Default for StateMapping {
    fn default() -> Self {
        Self(vec![Regime::Trending, Regime::MeanReverting])
    }
}

/// Label the state with the widest ret_norm variance TRENDING, all others
/// MEAN_REVERTING. Ties go to the lowest state index.
pub fn remap(covars: &[Array2<f64>]) -> StateMapping {
    let mut trending = 0;
    for (state, cov) in covars.iter().enumerate() {
        if cov[[RET_NORM_DIM, RET_NORM_DIM]] > covars[trending][[RET_NORM_DIM, RET_NORM_DIM]] {
            trending = state;
        }
    }
    StateMapping(
        (0..covars.len())
            .map(|s| if s == trending { Regime::Trending } else { Regime::MeanReverting })
            .collect(),
    )
}

/// Compress the dominant posterior into a milder confidence score.
pub fn smoothed_confidence(p: f64) -> f64 {
    0.5 + 0.5 * p.powf(0.25)
}

/// Periodically refit 2-state HMM over the rolling feature window.
pub struct RegimeModel {
    settings: RegimeSettings,
    hmm: Option<GaussianHmm>,
    mapping: StateMapping,
    retrain_count: u64,
}

impl RegimeModel {
    pub fn new(settings: RegimeSettings) -> Self {
        Self {
            settings,
            hmm: None,
            mapping: StateMapping::default(),
            retrain_count: 0,
        }
    }

    /// Retrain when the window is full enough and `bar_counter` hits the interval.
    pub fn maybe_retrain(&mut self, window: &FeatureWindow, bar_counter: u64) -> HmmResult<bool> {
        if window.len() < self.settings.min_train || bar_counter % self.settings.retrain_every != 0 {
            return Ok(false);
        }
        self.retrain(window)
    }

    /// Full refit on the current window. The previous model survives a failed fit.
    pub fn retrain(&mut self, window: &FeatureWindow) -> HmmResult<bool> {
        if window.len() < self.settings.min_train {
            return Ok(false);
        }

        let data = window.to_observations();
        let mut model = GaussianHmm::new(N_STATES, FeatureVector::NUM_FEATURES);
        let (log_prob, iterations) = model.fit(&data, self.settings.n_iter, self.settings.tol)?;
        model.regularize_covariances(self.settings.covar_reg)?;

        self.mapping = remap(&model.covars);
        self.hmm = Some(model);
        self.retrain_count += 1;

        info!(
            "Regime HMM retrained on {} bars: log_prob={:.2}, iterations={}, trending_state={:?}",
            data.nrows(),
            log_prob,
            iterations,
            self.mapping.trending_state()
        );
        Ok(true)
    }

    /// Classify the newest bar in the window.
    pub fn classify_latest(&self, window: &FeatureWindow) -> HmmResult<RegimeCall> {
        let hmm = match &self.hmm {
            Some(hmm) if window.len() >= self.settings.min_train => hmm,
            _ => return Ok(RegimeCall::warmup()),
        };

        let post = hmm.predict_proba(&window.to_observations())?;
        let last = post.row(post.nrows() - 1);

        let mut state = 0;
        for s in 1..last.len() {
            if last[s] > last[state] {
                state = s;
            }
        }
        let p = last[state];
        let confidence = smoothed_confidence(p);
        let reject = confidence < self.settings.p_strong;

        debug!("Regime posterior: state={} p={:.4} conf={:.4}", state, p, confidence);

        Ok(RegimeCall {
            regime: self.mapping.regime(state),
            confidence,
            reject,
            state: Some(state),
            diagnostic: format!("state={} p={:.3}", state, confidence),
        })
    }

    pub fn is_fitted(&self) -> bool {
        self.hmm.is_some()
    }

    pub fn mapping(&self) -> &StateMapping {
        &self.mapping
    }

    pub fn retrain_count(&self) -> u64 {
        self.retrain_count
    }
}
