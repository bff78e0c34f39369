use ndarray::Array2;
use std::collections::VecDeque;
use tracing::debug;

use super::features::FeatureVector;
use crate::types::Regime;

/// Base features plus the smoothed regime output, fed to the directional filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentedFeatures {
    pub ret_norm: f64,
    pub range_norm: f64,
    pub vol_norm: f64,
    pub is_trending: f64,
    pub regime_confidence: f64,
}

impl AugmentedFeatures {
    pub const NUM_FEATURES: usize = 5;

    pub fn new(base: &FeatureVector, regime: Regime, regime_confidence: f64) -> Self {
        Self {
            ret_norm: base.ret_norm,
            range_norm: base.range_norm,
            vol_norm: base.vol_norm,
            is_trending: if regime.is_trending() { 1.0 } else { 0.0 },
            regime_confidence,
        }
    }

    pub fn to_array(&self) -> [f64; Self::NUM_FEATURES] {
        [
            self.ret_norm,
            self.range_norm,
            self.vol_norm,
            self.is_trending,
            self.regime_confidence,
        ]
    }
}

/// A bar waiting for its future outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSample {
    pub seq: u64,
    pub features: AugmentedFeatures,
    pub close: f64,
    pub volatility: f64,
}

/// A bar whose outcome `horizon` bars later has been observed.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSample {
    pub seq: u64,
    pub features: AugmentedFeatures,
    pub is_edge: bool,
}

/// Bounded ring buffer of pending samples addressed by insertion sequence number.
#[derive(Debug, Clone)]
pub struct DelayedLabelQueue {
    entries: VecDeque<PendingSample>,
    capacity: usize,
    next_seq: u64,
}

impl DelayedLabelQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 0,
        }
    }

    /// Enqueue a sample and return its sequence number.
    pub fn push(&mut self, features: AugmentedFeatures, close: f64, volatility: f64) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(PendingSample { seq, features, close, volatility });
        seq
    }

    /// Entry with sequence number `seq`, if it has not been evicted.
    pub fn get(&self, seq: u64) -> Option<&PendingSample> {
        let front = self.entries.front()?.seq;
        if seq < front {
            return None;
        }
        self.entries.get((seq - front) as usize)
    }

    pub fn latest(&self) -> Option<&PendingSample> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of samples ever pushed.
    pub fn pushed(&self) -> u64 {
        self.next_seq
    }
}

/// Edge if the move over the horizon is large relative to the volatility at entry.
pub fn edge_label(close_then: f64, close_now: f64, vol_then: f64, epsilon: f64, threshold: f64) -> bool {
    (close_now - close_then).abs() / vol_then.max(epsilon) >= threshold
}

/// Pairs every bar with its realized outcome `horizon` bars later and keeps
/// the resulting append-only training set.
pub struct OutcomeTracker {
    queue: DelayedLabelQueue,
    dataset: Vec<LabeledSample>,
    horizon: u64,
    edge_threshold: f64,
    epsilon: f64,
}

impl OutcomeTracker {
    pub fn new(capacity: usize, horizon: usize, edge_threshold: f64, epsilon: f64) -> Self {
        Self {
            queue: DelayedLabelQueue::new(capacity),
            dataset: Vec::new(),
            horizon: horizon as u64,
            edge_threshold,
            epsilon,
        }
    }

    /// Record a new bar; labels the bar `horizon` positions behind it, if any.
    pub fn record(&mut self, features: AugmentedFeatures, close: f64, volatility: f64) -> Option<&LabeledSample> {
        let seq = self.queue.push(features, close, volatility);
        let target = seq.checked_sub(self.horizon)?;

        let entry = self.queue.get(target)?;
        let is_edge = edge_label(entry.close, close, entry.volatility, self.epsilon, self.edge_threshold);
        let sample = LabeledSample {
            seq: target,
            features: entry.features,
            is_edge,
        };
        debug!("Labeled bar #{} with outcome of bar #{}: edge={}", target, seq, is_edge);

        self.dataset.push(sample);
        self.dataset.last()
    }

    pub fn latest(&self) -> Option<&PendingSample> {
        self.queue.latest()
    }

    pub fn samples(&self) -> &[LabeledSample] {
        &self.dataset
    }

    pub fn sample_count(&self) -> usize {
        self.dataset.len()
    }

    pub fn edge_count(&self) -> usize {
        self.dataset.iter().filter(|s| s.is_edge).count()
    }

    /// Training matrix and labels over the whole dataset.
    pub fn training_data(&self) -> (Array2<f64>, Vec<bool>) {
        let mut features = Array2::zeros((self.dataset.len(), AugmentedFeatures::NUM_FEATURES));
        let mut labels = Vec::with_capacity(self.dataset.len());
        for (i, sample) in self.dataset.iter().enumerate() {
            for (j, &val) in sample.features.to_array().iter().enumerate() {
                features[[i, j]] = val;
            }
            labels.push(sample.is_edge);
        }
        (features, labels)
    }

    pub fn queue(&self) -> &DelayedLabelQueue {
        &self.queue
    }
}
