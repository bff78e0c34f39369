use serde::{Deserialize, Serialize};

use super::{Bar, Regime};

/// One request line: `{"bar": {"open": .., "high": .., "low": .., "close": ..}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarRequest {
    pub bar: Bar,
}

impl BarRequest {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Directional filter fields, present only when the filter stage is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterFields {
    pub xgb_ready: bool,
    pub xgb_prob: f64,
    pub xgb_pass: bool,
    pub xgb_label: String,
    pub xgb_samples: usize,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub regime: Regime,
    pub conf: f64,
    pub reject: bool,
    pub reason: String,
    pub hyst: f64,
    #[serde(flatten)]
    pub filter: Option<FilterFields>,
}

impl EngineResponse {
    /// Forced NO_TRADE response for a line that failed processing.
    pub fn error(description: &str, hyst: f64, filter_samples: Option<usize>) -> Self {
        Self {
            regime: Regime::NoTrade,
            conf: 0.0,
            reject: true,
            reason: format!("error:{}", description),
            hyst,
            filter: filter_samples.map(|samples| FilterFields {
                xgb_ready: false,
                xgb_prob: 0.0,
                xgb_pass: false,
                xgb_label: "ERROR".to_string(),
                xgb_samples: samples,
            }),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Round to 4 decimal places, as the client expects.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bar_request() {
        let req = BarRequest::parse(r#"{"bar": {"open": 1, "high": 2.5, "low": 0.5, "close": 2}}"#).unwrap();
        assert_eq!(req.bar, Bar::new(1.0, 2.5, 0.5, 2.0));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = BarRequest::parse(r#"{"bar": {"open": 1}}"#).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert!(BarRequest::parse(r#"{"bar": {"open": "x", "high": 1, "low": 1, "close": 1}}"#).is_err());
    }

    #[test]
    fn test_response_without_filter_omits_xgb_fields() {
        let resp = EngineResponse {
            regime: Regime::Trending,
            conf: 0.9876,
            reject: false,
            reason: "state=0 p=0.988|switch".to_string(),
            hyst: 0.9,
            filter: None,
        };
        let value: serde_json::Value = serde_json::from_str(&resp.to_line().unwrap()).unwrap();
        assert_eq!(value["regime"], "TRENDING");
        assert!(value.get("xgb_ready").is_none());
    }

    #[test]
    fn test_error_response_carries_filter_defaults() {
        let resp = EngineResponse::error("boom", 0.9, Some(12));
        let value: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["regime"], "NO_TRADE");
        assert_eq!(value["reject"], true);
        assert_eq!(value["reason"], "error:boom");
        assert_eq!(value["xgb_label"], "ERROR");
        assert_eq!(value["xgb_samples"], 12);
        assert_eq!(value["xgb_prob"], 0.0);
    }

    #[test]
    fn test_round4() {
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round4(1.0), 1.0);
    }
}
