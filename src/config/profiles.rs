use serde::{Deserialize, Serialize};

use super::runtime::EngineConfig;

/// Deployment presets for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EngineProfile {
    /// HMM regime + hysteresis only; responses carry no `xgb_*` fields.
    RegimeOnly,

    /// Full engine: regime output gated by the delayed-label directional filter.
    RegimeWithFilter,
}

impl EngineProfile {
    pub fn name(&self) -> &str {
        match self {
            Self::RegimeOnly => "Regime only",
            Self::RegimeWithFilter => "Regime + directional filter",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::RegimeOnly =>
                "Two-state HMM regime with flip-guard smoothing. No secondary gate.",
            Self::RegimeWithFilter =>
                "Regime output plus an online classifier trained from realized future moves.",
        }
    }

    pub fn filter_enabled(&self) -> bool {
        matches!(self, Self::RegimeWithFilter)
    }

    pub fn apply(&self, config: &mut EngineConfig) {
        config.filter.enabled = self.filter_enabled();
    }
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self::RegimeWithFilter
    }
}
