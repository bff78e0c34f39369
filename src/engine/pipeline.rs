use tracing::{info, warn};

use super::controller::SessionStats;
use super::error::PipelineError;
use crate::config::EngineConfig;
use crate::ml::filter::{DirectionalFilter, FilterDecision};
use crate::ml::features::{FeatureWindow, RollingFeatureStore};
use crate::ml::hmm::{RegimeCall, RegimeModel};
use crate::ml::hysteresis::{HysteresisFilter, HysteresisReason, SmoothedRegime};
use crate::types::{round4, Bar, BarRequest, EngineResponse, FilterFields};

/// All per-connection state: rolling features, regime model, hysteresis and
/// directional filter. Bars are processed strictly in arrival order.
pub struct Session {
    hyst: f64,
    store: RollingFeatureStore,
    window: FeatureWindow,
    bar_counter: u64,
    regime: RegimeModel,
    hysteresis: HysteresisFilter,
    filter: DirectionalFilter,
    stats: SessionStats,
}

impl Session {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            hyst: config.regime.hyst,
            store: RollingFeatureStore::new(config.features.clone()),
            window: FeatureWindow::new(config.features.window),
            bar_counter: 0,
            regime: RegimeModel::new(config.regime.clone()),
            hysteresis: HysteresisFilter::new(config.hysteresis.clone()),
            filter: DirectionalFilter::new(config.filter.clone(), config.features.epsilon),
            stats: SessionStats::new(),
        }
    }

    /// Handle one raw request line. Blank lines yield no response; every
    /// other line yields exactly one, an error response if processing failed.
    pub fn process_line(&mut self, line: &str) -> Option<EngineResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let response = BarRequest::parse(line)
            .map_err(PipelineError::from)
            .and_then(|request| self.process_bar(&request.bar));

        Some(match response {
            Ok(response) => response,
            Err(e) => self.reject(&e),
        })
    }

    /// Count the failure and build the error response for it.
    pub fn reject(&mut self, error: &PipelineError) -> EngineResponse {
        self.stats.record_error();
        warn!("Bar rejected: {}", error);
        self.error_response(error)
    }

    pub fn process_bar(&mut self, bar: &Bar) -> Result<EngineResponse, PipelineError> {
        if let Some(field) = bar.non_finite_field() {
            return Err(PipelineError::MalformedInput(format!("non-finite {}", field)));
        }
        self.stats.record_bar();

        let features = match self
            .store
            .ingest(bar)
            .map_err(|e| PipelineError::NumericFault(e.to_string()))?
        {
            Some(features) => features,
            None => return Ok(self.warmup_response()),
        };

        self.window.push(features);
        self.bar_counter += 1;
        self.stats.record_features();

        let regime_retrained = self
            .regime
            .maybe_retrain(&self.window, self.bar_counter)
            .map_err(|e| PipelineError::ModelFit(e.to_string()))?;

        let call = self
            .regime
            .classify_latest(&self.window)
            .map_err(|e| PipelineError::NumericFault(e.to_string()))?;
        let smoothed = self.hysteresis.apply(call.regime, call.confidence, call.reject);

        let decision = if self.filter.is_enabled() {
            let decision = self
                .filter
                .observe(&features, smoothed.regime, smoothed.confidence, bar.close, self.store.volatility())
                .map_err(|e| PipelineError::ModelFit(format!("{:#}", e)))?;
            Some(decision)
        } else {
            None
        };

        let filter_retrained = decision.as_ref().map_or(false, |d| d.retrained);
        self.stats.record_retrains(regime_retrained, filter_retrained);
        self.log_bar(&call, &smoothed, regime_retrained, decision.as_ref());

        Ok(self.build_response(&call, &smoothed, decision.as_ref()))
    }

    /// Response for the bar that only sets the baseline close. Reads the
    /// current hysteresis and filter state without advancing either.
    fn warmup_response(&self) -> EngineResponse {
        let call = RegimeCall::warmup();
        let smoothed = SmoothedRegime {
            regime: call.regime,
            confidence: call.confidence,
            reject: true,
            reason: HysteresisReason::RejectLowProb,
        };
        let decision = self.filter.is_enabled().then(|| self.filter.warmup_decision());
        self.build_response(&call, &smoothed, decision.as_ref())
    }

    fn build_response(
        &self,
        call: &RegimeCall,
        smoothed: &SmoothedRegime,
        decision: Option<&FilterDecision>,
    ) -> EngineResponse {
        EngineResponse {
            regime: smoothed.regime,
            conf: round4(smoothed.confidence),
            reject: smoothed.reject,
            reason: format!("{}|{}", call.diagnostic, smoothed.reason),
            hyst: self.hyst,
            filter: decision.map(FilterFields::from),
        }
    }

    pub fn error_response(&self, error: &PipelineError) -> EngineResponse {
        let samples = self.filter.is_enabled().then(|| self.filter.sample_count());
        EngineResponse::error(&error.to_string(), self.hyst, samples)
    }

    fn log_bar(
        &self,
        call: &RegimeCall,
        smoothed: &SmoothedRegime,
        regime_retrained: bool,
        decision: Option<&FilterDecision>,
    ) {
        let hmm = format!(
            "[HMM] {} -> {} (conf={:.3}) hyst={:.2} ({}){}",
            call.diagnostic,
            smoothed.regime,
            smoothed.confidence,
            self.hyst,
            smoothed.reason,
            if regime_retrained { " [retrained]" } else { "" }
        );
        match decision {
            Some(d) => info!(
                "{} | [XGB] ready={} p={:.3} pass={} samples={}{}",
                hmm,
                d.ready,
                d.prob,
                d.pass,
                d.samples,
                if d.retrained { " [retrained]" } else { "" }
            ),
            None => info!("{}", hmm),
        }
    }

    pub fn bar_counter(&self) -> u64 {
        self.bar_counter
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn regime_model(&self) -> &RegimeModel {
        &self.regime
    }

    pub fn filter(&self) -> &DirectionalFilter {
        &self.filter
    }
}
