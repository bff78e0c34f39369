use serde::{Deserialize, Serialize};

/// One sampling period of prices, as sent by the trading client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(open: f64, high: f64, low: f64, close: f64) -> Self {
        Self { open, high, low, close }
    }

    /// Bar with every price equal to `close`.
    pub fn flat(close: f64) -> Self {
        Self::new(close, close, close, close)
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Name of the first non-finite price field, if any.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ]
        .into_iter()
        .find(|(_, v)| !v.is_finite())
        .map(|(name, _)| name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_helpers() {
        let bar = Bar::new(100.0, 105.0, 98.0, 103.0);
        assert_eq!(bar.range(), 7.0);
        assert_eq!(Bar::flat(5.0).range(), 0.0);
        assert!(bar.non_finite_field().is_none());
    }

    #[test]
    fn test_non_finite_field_reports_first_offender() {
        let bar = Bar::new(1.0, f64::INFINITY, f64::NAN, 1.0);
        assert_eq!(bar.non_finite_field(), Some("high"));
    }
}
