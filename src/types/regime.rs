use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic market regime reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Trending,
    MeanReverting,
    NoTrade,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "TRENDING",
            Regime::MeanReverting => "MEAN_REVERTING",
            Regime::NoTrade => "NO_TRADE",
        }
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, Regime::Trending)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regime_serializes_as_wire_label() {
        assert_eq!(serde_json::to_string(&Regime::MeanReverting).unwrap(), "\"MEAN_REVERTING\"");
        let parsed: Regime = serde_json::from_str("\"NO_TRADE\"").unwrap();
        assert_eq!(parsed, Regime::NoTrade);
        assert_eq!(Regime::Trending.to_string(), "TRENDING");
    }
}
