use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// Counters for one session (one connection or one replay run).
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub bars: u64,
    pub features: u64,
    pub errors: u64,
    pub regime_retrains: u64,
    pub filter_retrains: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            bars: 0,
            features: 0,
            errors: 0,
            regime_retrains: 0,
            filter_retrains: 0,
        }
    }

    pub fn record_bar(&mut self) {
        self.bars += 1;
    }

    pub fn record_features(&mut self) {
        self.features += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_retrains(&mut self, regime: bool, filter: bool) {
        if regime {
            self.regime_retrains += 1;
        }
        if filter {
            self.filter_retrains += 1;
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn log_summary(&self) {
        info!(
            "Session {} closed after {}s: {} bars, {} feature rows, {} errors, {} regime retrains, {} filter retrains",
            self.session_id,
            self.uptime_seconds(),
            self.bars,
            self.features,
            self.errors,
            self.regime_retrains,
            self.filter_retrains
        );
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
