use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::config::FeatureSettings;
use crate::types::Bar;

/// Normalized per-bar features fed to the regime model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    /// Close-to-close return in units of return volatility.
    pub ret_norm: f64,
    /// High-low range relative to the rolling mean range.
    pub range_norm: f64,
    /// Return volatility relative to the volatility of absolute returns.
    pub vol_norm: f64,
}

impl FeatureVector {
    pub const NUM_FEATURES: usize = 3;

    pub fn to_array(&self) -> [f64; Self::NUM_FEATURES] {
        [self.ret_norm, self.range_norm, self.vol_norm]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

/// A bar whose derived values overflow. The store is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("non-finite bar deltas: ret={ret} range={range}")]
    NonFiniteDelta { ret: f64, range: f64 },
    #[error("non-finite features {0:?}")]
    NonFiniteFeatures(FeatureVector),
}

/// Bounded rolling buffers of returns, absolute returns and ranges.
#[derive(Debug, Clone)]
pub struct RollingFeatureStore {
    settings: FeatureSettings,
    last_close: Option<f64>,
    returns: VecDeque<f64>,
    abs_returns: VecDeque<f64>,
    ranges: VecDeque<f64>,
}

impl RollingFeatureStore {
    pub fn new(settings: FeatureSettings) -> Self {
        let cap = settings.window;
        Self {
            settings,
            last_close: None,
            returns: VecDeque::with_capacity(cap),
            abs_returns: VecDeque::with_capacity(cap),
            ranges: VecDeque::with_capacity(cap),
        }
    }

    /// Consume one bar. The first bar only sets the baseline close and yields `None`.
    /// A bar that would produce non-finite values is rejected without touching the buffers.
    pub fn ingest(&mut self, bar: &Bar) -> Result<Option<FeatureVector>, FeatureError> {
        let eps = self.settings.epsilon;
        let range = bar.range().max(eps);

        let prev_close = match self.last_close {
            Some(prev) => prev,
            None => {
                self.last_close = Some(bar.close);
                return Ok(None);
            }
        };
        let ret = bar.close - prev_close;
        if !ret.is_finite() || !range.is_finite() {
            return Err(FeatureError::NonFiniteDelta { ret, range });
        }

        let window = self.settings.window;
        let evicted = [
            push_bounded(&mut self.returns, ret, window),
            push_bounded(&mut self.abs_returns, ret.abs(), window),
            push_bounded(&mut self.ranges, range, window),
        ];

        let features = self.latest_features(ret, range);
        if !features.is_finite() {
            self.rollback(evicted);
            return Err(FeatureError::NonFiniteFeatures(features));
        }

        self.last_close = Some(bar.close);
        Ok(Some(features))
    }

    fn latest_features(&self, ret: f64, range: f64) -> FeatureVector {
        let eps = self.settings.epsilon;
        let vol = self.volatility();
        let avg_range = if self.ranges.len() >= self.settings.min_range_samples {
            mean(&self.ranges)
        } else {
            range
        };
        let abs_vol = self.floored_std(&self.abs_returns);

        FeatureVector {
            ret_norm: ret / vol,
            range_norm: range / avg_range.max(eps),
            vol_norm: vol / abs_vol.max(eps),
        }
    }

    fn rollback(&mut self, evicted: [Option<f64>; 3]) {
        let buffers = [&mut self.returns, &mut self.abs_returns, &mut self.ranges];
        for (buf, old) in buffers.into_iter().zip(evicted) {
            buf.pop_back();
            if let Some(old) = old {
                buf.push_front(old);
            }
        }
    }

    /// Current return volatility estimate (in price units), floored at epsilon.
    pub fn volatility(&self) -> f64 {
        self.floored_std(&self.returns)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.last_close
    }

    pub fn len(&self) -> usize {
        self.returns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returns.is_empty()
    }

    fn floored_std(&self, values: &VecDeque<f64>) -> f64 {
        let eps = self.settings.epsilon;
        if values.len() < self.settings.min_vol_samples {
            return eps;
        }
        let std = sample_std(values) + eps;
        if std.is_finite() { std } else { eps }
    }
}

/// Bounded window of feature vectors used as the regime training set.
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    rows: VecDeque<FeatureVector>,
    max_len: usize,
}

impl FeatureWindow {
    pub fn new(max_len: usize) -> Self {
        Self {
            rows: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    pub fn push(&mut self, features: FeatureVector) {
        push_bounded(&mut self.rows, features, self.max_len);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&FeatureVector> {
        self.rows.back()
    }

    /// Observation matrix, one row per bar, oldest first.
    pub fn to_observations(&self) -> Array2<f64> {
        let mut data = Array2::zeros((self.rows.len(), FeatureVector::NUM_FEATURES));
        for (i, row) in self.rows.iter().enumerate() {
            for (j, &val) in row.to_array().iter().enumerate() {
                data[[i, j]] = val;
            }
        }
        data
    }
}

/// Append, returning the element evicted from the front, if any.
fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, max_len: usize) -> Option<T> {
    let evicted = if buf.len() >= max_len { buf.pop_front() } else { None };
    buf.push_back(value);
    evicted
}

pub(crate) fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with Bessel's correction.
pub(crate) fn sample_std(values: &VecDeque<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RollingFeatureStore {
        RollingFeatureStore::new(FeatureSettings::default())
    }

    #[test]
    fn test_first_bar_sets_baseline_only() {
        let mut fs = store();
        assert!(fs.ingest(&Bar::new(100.0, 101.0, 99.0, 100.0)).unwrap().is_none());
        assert_eq!(fs.last_close(), Some(100.0));
        assert!(fs.is_empty());
    }

    #[test]
    fn test_early_volatility_is_epsilon() {
        let mut fs = store();
        fs.ingest(&Bar::flat(100.0));
        let feat = fs.ingest(&Bar::new(100.0, 102.0, 99.0, 101.0)).unwrap().unwrap();

        // One return, below the 20-sample threshold
        assert_eq!(fs.volatility(), 1e-6);
        assert!((feat.ret_norm - 1.0 / 1e-6).abs() < 1e-3);
        // Fewer than 10 ranges: range is normalized by itself
        assert!((feat.range_norm - 1.0).abs() < 1e-12);
        assert!((feat.vol_norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_uses_sample_std() {
        let mut fs = store();
        fs.ingest(&Bar::flat(100.0));
        let mut close = 100.0;
        for i in 0..30 {
            close += if i % 2 == 0 { 1.0 } else { -1.0 };
            fs.ingest(&Bar::new(close, close + 0.5, close - 0.5, close)).unwrap();
        }
        let returns: VecDeque<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let expected = sample_std(&returns) + 1e-6;
        assert!((fs.volatility() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_buffers_are_bounded() {
        let settings = FeatureSettings { window: 5, ..FeatureSettings::default() };
        let mut fs = RollingFeatureStore::new(settings);
        for i in 0..20 {
            fs.ingest(&Bar::flat(100.0 + i as f64)).unwrap();
        }
        assert_eq!(fs.len(), 5);
    }

    #[test]
    fn test_constant_closes_stay_finite() {
        let mut fs = store();
        fs.ingest(&Bar::flat(50.0));
        for _ in 0..1000 {
            let feat = fs.ingest(&Bar::flat(50.0)).unwrap().unwrap();
            assert!(feat.is_finite());
            assert_eq!(feat.ret_norm, 0.0);
            // std(abs_returns) floors to epsilon, so vol / eps
            assert!((feat.vol_norm - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_overflowing_bar_leaves_buffers_untouched() {
        let settings = FeatureSettings { window: 30, ..FeatureSettings::default() };
        let mut fs = RollingFeatureStore::new(settings);
        fs.ingest(&Bar::flat(100.0)).unwrap();
        let mut close = 100.0;
        for i in 0..60 {
            close += if i % 2 == 0 { 1.0 } else { -1.0 };
            fs.ingest(&Bar::new(close, close + 0.5, close - 0.5, close)).unwrap();
        }
        let vol_before = fs.volatility();

        let err = fs.ingest(&Bar::new(100.0, 1.7e308, -1.7e308, 100.0)).unwrap_err();
        assert!(matches!(err, FeatureError::NonFiniteDelta { .. }));
        assert_eq!(fs.len(), 30);
        assert_eq!(fs.last_close(), Some(close));
        assert_eq!(fs.volatility(), vol_before);

        let feat = fs.ingest(&Bar::new(close, close + 0.5, close - 0.5, close + 1.0)).unwrap().unwrap();
        assert!((feat.range_norm - 1.0).abs() < 1e-9);
        assert!(fs.volatility() > 0.5);
    }

    #[test]
    fn test_overflowing_features_are_rolled_back() {
        let settings = FeatureSettings { window: 3, ..FeatureSettings::default() };
        let mut fs = RollingFeatureStore::new(settings);
        fs.ingest(&Bar::flat(0.0)).unwrap();
        for i in 1..=3 {
            fs.ingest(&Bar::flat(i as f64)).unwrap();
        }
        let returns_before: Vec<f64> = fs.returns.iter().copied().collect();

        // Finite return, but ret / eps overflows
        let err = fs.ingest(&Bar::flat(1e303)).unwrap_err();
        assert!(matches!(err, FeatureError::NonFiniteFeatures(_)));
        assert_eq!(fs.returns.iter().copied().collect::<Vec<_>>(), returns_before);
        assert_eq!(fs.ranges.len(), 3);
        assert_eq!(fs.last_close(), Some(3.0));
    }

    #[test]
    fn test_feature_window_matrix() {
        let mut window = FeatureWindow::new(2);
        window.push(FeatureVector { ret_norm: 1.0, range_norm: 2.0, vol_norm: 3.0 });
        window.push(FeatureVector { ret_norm: 4.0, range_norm: 5.0, vol_norm: 6.0 });
        window.push(FeatureVector { ret_norm: 7.0, range_norm: 8.0, vol_norm: 9.0 });

        let obs = window.to_observations();
        assert_eq!(obs.shape(), &[2, 3]);
        assert_eq!(obs[[0, 0]], 4.0);
        assert_eq!(obs[[1, 2]], 9.0);
    }
}
