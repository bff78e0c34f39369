use anyhow::{Context, Result};
use std::fmt;
use tracing::{debug, info};

use super::boosting::GradientBoostedClassifier;
use super::features::FeatureVector;
use super::model::{EdgeClassifier, LogisticEdgeModel};
use super::tracker::{AugmentedFeatures, OutcomeTracker};
use crate::config::{ClassifierBackend, FilterSettings};
use crate::types::{round4, FilterFields, Regime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterLabel {
    Warmup,
    Trade,
    NoTrade,
}

impl FilterLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterLabel::Warmup => "WARMUP",
            FilterLabel::Trade => "TRADE",
            FilterLabel::NoTrade => "NO_TRADE",
        }
    }
}

impl fmt::Display for FilterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-bar verdict of the directional filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub prob: f64,
    pub pass: bool,
    pub label: FilterLabel,
    pub ready: bool,
    pub samples: usize,
    pub retrained: bool,
}

impl From<&FilterDecision> for FilterFields {
    fn from(decision: &FilterDecision) -> Self {
        FilterFields {
            xgb_ready: decision.ready,
            xgb_prob: round4(decision.prob),
            xgb_pass: decision.pass,
            xgb_label: decision.label.to_string(),
            xgb_samples: decision.samples,
        }
    }
}

pub fn build_classifier(settings: &FilterSettings) -> Box<dyn EdgeClassifier> {
    match settings.backend {
        ClassifierBackend::Gbdt => Box::new(GradientBoostedClassifier::new(settings.gbdt.clone())),
        ClassifierBackend::Logistic => Box::new(LogisticEdgeModel::new()),
    }
}

/// Secondary gate trained online from realized moves `label_horizon` bars ahead.
pub struct DirectionalFilter {
    settings: FilterSettings,
    tracker: OutcomeTracker,
    model: Box<dyn EdgeClassifier>,
    ready: bool,
    retrain_count: u64,
}

impl DirectionalFilter {
    pub fn new(settings: FilterSettings, epsilon: f64) -> Self {
        let model = build_classifier(&settings);
        Self::with_classifier(settings, epsilon, model)
    }

    pub fn with_classifier(settings: FilterSettings, epsilon: f64, model: Box<dyn EdgeClassifier>) -> Self {
        let tracker = OutcomeTracker::new(
            settings.queue_capacity,
            settings.label_horizon,
            settings.edge_threshold,
            epsilon,
        );
        Self {
            settings,
            tracker,
            model,
            ready: false,
            retrain_count: 0,
        }
    }

    /// Queue the bar, label the one `label_horizon` behind it, maybe refit, then score it.
    pub fn observe(
        &mut self,
        base: &FeatureVector,
        regime: Regime,
        regime_confidence: f64,
        close: f64,
        volatility: f64,
    ) -> Result<FilterDecision> {
        if !self.settings.enabled {
            return Ok(self.passthrough());
        }

        let features = AugmentedFeatures::new(base, regime, regime_confidence);
        let labeled = self.tracker.record(features, close, volatility).is_some();

        let mut retrained = false;
        let samples = self.tracker.sample_count();
        if labeled && samples >= self.settings.min_train && samples % self.settings.retrain_every == 0 {
            self.retrain()?;
            retrained = true;
        }

        let mut decision = self.infer(&features);
        decision.retrained = retrained;
        Ok(decision)
    }

    /// Full refit on the whole labeled dataset. Readiness never reverts.
    pub fn retrain(&mut self) -> Result<()> {
        let (x, y) = self.tracker.training_data();
        let report = self
            .model
            .fit(&x, &y)
            .with_context(|| format!("{} refit on {} samples failed", self.model.name(), x.nrows()))?;

        self.ready = true;
        self.retrain_count += 1;
        info!(
            "Directional filter retrained ({}): {} samples, {} edges, {:.1}% train accuracy",
            self.model.name(),
            report.samples,
            report.edges_in_data,
            report.accuracy * 100.0
        );
        Ok(())
    }

    fn infer(&self, features: &AugmentedFeatures) -> FilterDecision {
        let samples = self.tracker.sample_count();
        let prob = if self.ready {
            self.model.predict_proba(&features.to_array())
        } else {
            None
        };

        match prob {
            Some(prob) => {
                let pass = prob >= self.settings.pass_threshold;
                debug!(
                    "Filter prediction: edge_prob={:.2}%, threshold={:.2}%",
                    prob * 100.0,
                    self.settings.pass_threshold * 100.0
                );
                FilterDecision {
                    prob,
                    pass,
                    label: if pass { FilterLabel::Trade } else { FilterLabel::NoTrade },
                    ready: true,
                    samples,
                    retrained: false,
                }
            }
            None => self.warmup_decision(),
        }
    }

    /// Decision under the warm-up policy, reflecting current state without mutating it.
    pub fn warmup_decision(&self) -> FilterDecision {
        if !self.settings.enabled {
            return self.passthrough();
        }
        let pass = self.settings.warmup_pass;
        FilterDecision {
            prob: if pass { 1.0 } else { 0.0 },
            pass,
            label: FilterLabel::Warmup,
            ready: self.ready,
            samples: self.tracker.sample_count(),
            retrained: false,
        }
    }

    fn passthrough(&self) -> FilterDecision {
        FilterDecision {
            prob: 1.0,
            pass: true,
            label: FilterLabel::Warmup,
            ready: false,
            samples: 0,
            retrained: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn sample_count(&self) -> usize {
        self.tracker.sample_count()
    }

    pub fn retrain_count(&self) -> u64 {
        self.retrain_count
    }

    pub fn tracker(&self) -> &OutcomeTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::TrainingReport;
    use anyhow::anyhow;
    use ndarray::Array2;

    fn settings() -> FilterSettings {
        FilterSettings {
            min_train: 20,
            retrain_every: 10,
            backend: ClassifierBackend::Logistic,
            ..FilterSettings::default()
        }
    }

    fn base(t: usize) -> FeatureVector {
        FeatureVector {
            ret_norm: ((t % 7) as f64 - 3.0) * 0.5,
            range_norm: 1.0 + (t % 3) as f64 * 0.1,
            vol_norm: 1.0,
        }
    }

    fn feed(filter: &mut DirectionalFilter, n: usize) -> Vec<FilterDecision> {
        (0..n)
            .map(|t| {
                let close = 100.0 + if t % 2 == 0 { 0.0 } else { 1.0 };
                filter.observe(&base(t), Regime::Trending, 0.9, close, 1.0).unwrap()
            })
            .collect()
    }

    struct FailingModel;

    impl EdgeClassifier for FailingModel {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn fit(&mut self, _: &Array2<f64>, _: &[bool]) -> Result<TrainingReport> {
            Err(anyhow!("singular"))
        }
        fn predict_proba(&self, _: &[f64]) -> Option<f64> {
            None
        }
        fn is_trained(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_warmup_policy_before_ready() {
        let mut filter = DirectionalFilter::new(settings(), 1e-6);
        let decisions = feed(&mut filter, 5);
        for d in &decisions {
            assert_eq!(d.label, FilterLabel::Warmup);
            assert!(d.pass);
            assert_eq!(d.prob, 1.0);
            assert!(!d.ready);
        }
        // Horizon 3: bars 3 and 4 labeled bars 0 and 1
        assert_eq!(decisions[4].samples, 2);

        let blocking = FilterSettings { warmup_pass: false, ..settings() };
        let mut filter = DirectionalFilter::new(blocking, 1e-6);
        let d = &feed(&mut filter, 1)[0];
        assert!(!d.pass);
        assert_eq!(d.prob, 0.0);
        assert_eq!(d.label, FilterLabel::Warmup);
    }

    #[test]
    fn test_retrain_schedule_and_readiness() {
        let mut filter = DirectionalFilter::new(settings(), 1e-6);
        let decisions = feed(&mut filter, 40);

        let retrain_samples: Vec<usize> = decisions.iter().filter(|d| d.retrained).map(|d| d.samples).collect();
        assert_eq!(retrain_samples, vec![20, 30]);
        assert_eq!(filter.retrain_count(), 2);

        // Ready from the first retrain on, never reverting
        let first_ready = decisions.iter().position(|d| d.ready).unwrap();
        assert!(decisions[first_ready].retrained);
        assert!(decisions[first_ready..].iter().all(|d| d.ready));
        for d in &decisions[first_ready..] {
            assert_ne!(d.label, FilterLabel::Warmup);
            assert_eq!(d.pass, d.prob >= 0.55);
        }
    }

    #[test]
    fn test_disabled_filter_passes_through_and_queues_nothing() {
        let disabled = FilterSettings { enabled: false, ..settings() };
        let mut filter = DirectionalFilter::new(disabled, 1e-6);
        for d in feed(&mut filter, 50) {
            assert!(d.pass);
            assert_eq!(d.label, FilterLabel::Warmup);
            assert_eq!(d.samples, 0);
        }
        assert!(filter.tracker().queue().is_empty());
        assert!(!filter.is_ready());
    }

    #[test]
    fn test_failed_refit_keeps_dataset_and_readiness() {
        let mut filter = DirectionalFilter::with_classifier(settings(), 1e-6, Box::new(FailingModel));
        feed(&mut filter, 22);
        assert_eq!(filter.sample_count(), 19);

        let err = filter.observe(&base(22), Regime::Trending, 0.9, 100.0, 1.0);
        assert!(err.is_err());
        assert_eq!(filter.sample_count(), 20);
        assert!(!filter.is_ready());

        let d = filter.observe(&base(23), Regime::Trending, 0.9, 101.0, 1.0).unwrap();
        assert_eq!(d.label, FilterLabel::Warmup);
    }

    #[test]
    fn test_fields_conversion_rounds_prob() {
        let decision = FilterDecision {
            prob: 0.123456,
            pass: false,
            label: FilterLabel::NoTrade,
            ready: true,
            samples: 900,
            retrained: false,
        };
        let fields = FilterFields::from(&decision);
        assert_eq!(fields.xgb_prob, 0.1235);
        assert_eq!(fields.xgb_label, "NO_TRADE");
        assert_eq!(fields.xgb_samples, 900);
    }
}
