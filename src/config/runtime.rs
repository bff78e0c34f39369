use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use super::profiles::EngineProfile;

/// Environment variable prefix, e.g. `REGIME_SERVER__PORT=6000`.
pub const ENV_PREFIX: &str = "REGIME";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub profile: Option<EngineProfile>,
    pub server: ServerSettings,
    pub features: FeatureSettings,
    pub regime: RegimeSettings,
    pub hysteresis: HysteresisSettings,
    pub filter: FilterSettings,
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Layer defaults, an optional TOML file and `REGIME_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("config path is not valid UTF-8: {}", path.display()))?;

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?)
            .add_source(config::File::new(path_str, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let mut cfg: EngineConfig = settings
            .try_deserialize()
            .context("failed to deserialize engine configuration")?;
        cfg.apply_profile();

        cfg.validate().map_err(|errors| anyhow!("invalid configuration: {}", errors.join(", ")))?;
        debug!("Configuration loaded from {}", path.display());
        Ok(cfg)
    }

    /// Force the settings a profile pins, if one is selected.
    pub fn apply_profile(&mut self) {
        if let Some(profile) = self.profile {
            profile.apply(self);
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.server.max_line_bytes < 64 {
            errors.push("server.max_line_bytes must be >= 64".to_string());
        }

        // Features
        if self.features.window < 2 {
            errors.push("features.window must be >= 2".to_string());
        }
        if !(self.features.epsilon > 0.0) {
            errors.push("features.epsilon must be > 0".to_string());
        }
        if self.features.min_vol_samples < 2 {
            errors.push("features.min_vol_samples must be >= 2".to_string());
        }

        // Regime model
        if self.regime.min_train < 2 {
            errors.push("regime.min_train must be >= 2".to_string());
        }
        if self.regime.min_train > self.features.window {
            errors.push("regime.min_train must be <= features.window".to_string());
        }
        if self.regime.retrain_every == 0 {
            errors.push("regime.retrain_every must be > 0".to_string());
        }
        if self.regime.n_iter == 0 {
            errors.push("regime.n_iter must be > 0".to_string());
        }
        if self.regime.covar_reg < 0.0 {
            errors.push("regime.covar_reg must be >= 0".to_string());
        }
        if self.regime.p_strong <= 0.0 || self.regime.p_strong > 1.0 {
            errors.push("regime.p_strong must be between 0 and 1".to_string());
        }

        // Hysteresis
        if self.hysteresis.guard_floor < 0.0 || self.hysteresis.guard_floor > 1.0 {
            errors.push("hysteresis.guard_floor must be between 0 and 1".to_string());
        }
        if self.hysteresis.guard_penalty < 0.0 {
            errors.push("hysteresis.guard_penalty must be >= 0".to_string());
        }

        // Directional filter
        if self.filter.retrain_every == 0 {
            errors.push("filter.retrain_every must be > 0".to_string());
        }
        if self.filter.min_train < 2 {
            errors.push("filter.min_train must be >= 2".to_string());
        }
        if self.filter.label_horizon == 0 {
            errors.push("filter.label_horizon must be > 0".to_string());
        }
        if self.filter.queue_capacity <= self.filter.label_horizon {
            errors.push("filter.queue_capacity must be > filter.label_horizon".to_string());
        }
        if self.filter.edge_threshold < 0.0 {
            errors.push("filter.edge_threshold must be >= 0".to_string());
        }
        if self.filter.pass_threshold < 0.0 || self.filter.pass_threshold > 1.0 {
            errors.push("filter.pass_threshold must be between 0 and 1".to_string());
        }

        let gbdt = &self.filter.gbdt;
        if gbdt.n_estimators == 0 {
            errors.push("filter.gbdt.n_estimators must be > 0".to_string());
        }
        if gbdt.max_depth == 0 {
            errors.push("filter.gbdt.max_depth must be > 0".to_string());
        }
        if gbdt.learning_rate <= 0.0 {
            errors.push("filter.gbdt.learning_rate must be > 0".to_string());
        }
        if gbdt.subsample <= 0.0 || gbdt.subsample > 1.0 {
            errors.push("filter.gbdt.subsample must be in (0, 1]".to_string());
        }
        if gbdt.colsample <= 0.0 || gbdt.colsample > 1.0 {
            errors.push("filter.gbdt.colsample must be in (0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration as TOML")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub nodelay: bool,
    /// Longest accepted request line in bytes, newline included.
    pub max_line_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            nodelay: true,
            max_line_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    /// Max length of every rolling buffer and of the regime training window.
    pub window: usize,
    pub epsilon: f64,
    /// Below this many returns the volatility estimate is pinned to `epsilon`.
    pub min_vol_samples: usize,
    /// Below this many ranges the current range is its own mean.
    pub min_range_samples: usize,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            window: 300,
            epsilon: 1e-6,
            min_vol_samples: 20,
            min_range_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSettings {
    pub min_train: usize,
    pub retrain_every: u64,
    pub n_iter: usize,
    pub tol: f64,
    /// Added to every covariance diagonal after a fit.
    pub covar_reg: f64,
    pub p_strong: f64,
    /// Echoed back to the client in every response.
    pub hyst: f64,
}

impl Default for RegimeSettings {
    fn default() -> Self {
        Self {
            min_train: 250,
            retrain_every: 150,
            n_iter: 200,
            tol: 1e-2,
            covar_reg: 1e-2,
            p_strong: 0.80,
            hyst: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisSettings {
    pub flip_guard_init: u32,
    pub guard_floor: f64,
    pub guard_penalty: f64,
}

impl Default for HysteresisSettings {
    fn default() -> Self {
        Self {
            flip_guard_init: 2,
            guard_floor: 0.60,
            guard_penalty: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierBackend {
    Gbdt,
    Logistic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub enabled: bool,
    pub backend: ClassifierBackend,
    pub min_train: usize,
    pub retrain_every: usize,
    /// Pass trades through while the classifier is not ready.
    pub warmup_pass: bool,
    pub label_horizon: usize,
    pub edge_threshold: f64,
    pub pass_threshold: f64,
    pub queue_capacity: usize,
    pub gbdt: GbdtSettings,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: ClassifierBackend::Gbdt,
            min_train: 800,
            retrain_every: 250,
            warmup_pass: true,
            label_horizon: 3,
            edge_threshold: 0.35,
            pass_threshold: 0.55,
            queue_capacity: 5000,
            gbdt: GbdtSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GbdtSettings {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub subsample: f64,
    pub colsample: f64,
    pub reg_lambda: f64,
    pub min_child_weight: f64,
    pub gamma: f64,
    pub seed: u64,
}

impl Default for GbdtSettings {
    fn default() -> Self {
        Self {
            n_estimators: 220,
            max_depth: 3,
            learning_rate: 0.05,
            subsample: 0.85,
            colsample: 0.85,
            reg_lambda: 1.0,
            min_child_weight: 1.0,
            gamma: 0.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 5555);
        assert_eq!(cfg.features.window, 300);
        assert_eq!(cfg.regime.min_train, 250);
        assert_eq!(cfg.regime.retrain_every, 150);
        assert_eq!(cfg.filter.label_horizon, 3);
        assert!(cfg.filter.enabled);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut cfg = EngineConfig::default();
        cfg.regime.retrain_every = 0;
        cfg.regime.min_train = 400;
        cfg.filter.queue_capacity = 2;

        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("regime.retrain_every")));
        assert!(errors.iter().any(|e| e.contains("features.window")));
        assert!(errors.iter().any(|e| e.contains("queue_capacity")));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_str = r#"
profile = "regime-only"

[server]
port = 6000

[filter]
backend = "logistic"
edge_threshold = 0.5
"#;
        let mut cfg: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.server.port, 6000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.filter.backend, ClassifierBackend::Logistic);
        assert!((cfg.filter.edge_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.filter.min_train, 800);

        cfg.apply_profile();
        assert!(!cfg.filter.enabled);
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let cfg = EngineConfig::load("/nonexistent/regime-engine.toml").unwrap();
        assert_eq!(cfg.regime.p_strong, 0.80);
        assert_eq!(cfg.filter.gbdt.n_estimators, 220);
    }

    #[test]
    fn test_to_toml_round_trips_sections() {
        let rendered = EngineConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[server]"));
        assert!(rendered.contains("[filter.gbdt]"));
    }
}
