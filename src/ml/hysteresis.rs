use std::fmt;

use crate::config::HysteresisSettings;
use crate::types::Regime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisReason {
    RejectLowProb,
    FlipGuard,
    Switch,
    Hold,
}

impl HysteresisReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HysteresisReason::RejectLowProb => "reject_low_prob",
            HysteresisReason::FlipGuard => "flip_guard",
            HysteresisReason::Switch => "switch",
            HysteresisReason::Hold => "hold",
        }
    }
}

impl fmt::Display for HysteresisReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smoothed regime output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedRegime {
    pub regime: Regime,
    pub confidence: f64,
    pub reject: bool,
    pub reason: HysteresisReason,
}

/// Flip-guard state machine over (last accepted regime, guard counter).
#[derive(Debug, Clone)]
pub struct HysteresisFilter {
    settings: HysteresisSettings,
    last_regime: Regime,
    flip_guard: u32,
}

impl HysteresisFilter {
    pub fn new(settings: HysteresisSettings) -> Self {
        Self {
            settings,
            last_regime: Regime::NoTrade,
            flip_guard: 0,
        }
    }

    pub fn apply(&mut self, regime: Regime, confidence: f64, reject: bool) -> SmoothedRegime {
        // A rejected bar never overwrites the last accepted regime
        if reject {
            return SmoothedRegime {
                regime: Regime::NoTrade,
                confidence,
                reject: true,
                reason: HysteresisReason::RejectLowProb,
            };
        }

        if regime == self.last_regime {
            return SmoothedRegime {
                regime,
                confidence,
                reject: false,
                reason: HysteresisReason::Hold,
            };
        }

        if self.flip_guard > 0 {
            self.flip_guard -= 1;
            return SmoothedRegime {
                regime: self.last_regime,
                confidence: (confidence - self.settings.guard_penalty).max(self.settings.guard_floor),
                reject: false,
                reason: HysteresisReason::FlipGuard,
            };
        }

        self.flip_guard = self.settings.flip_guard_init;
        self.last_regime = regime;
        SmoothedRegime {
            regime,
            confidence,
            reject: false,
            reason: HysteresisReason::Switch,
        }
    }

    pub fn last_regime(&self) -> Regime {
        self.last_regime
    }

    pub fn flip_guard(&self) -> u32 {
        self.flip_guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> HysteresisFilter {
        HysteresisFilter::new(HysteresisSettings::default())
    }

    #[test]
    fn test_reject_forces_no_trade_and_keeps_state() {
        let mut h = filter();
        h.apply(Regime::Trending, 0.95, false);
        assert_eq!(h.last_regime(), Regime::Trending);

        let out = h.apply(Regime::MeanReverting, 0.7, true);
        assert_eq!(out.regime, Regime::NoTrade);
        assert_eq!(out.confidence, 0.7);
        assert!(out.reject);
        assert_eq!(out.reason, HysteresisReason::RejectLowProb);
        assert_eq!(h.last_regime(), Regime::Trending);
        assert_eq!(h.flip_guard(), 2);
    }

    #[test]
    fn test_first_accepted_regime_is_a_switch() {
        let mut h = filter();
        let out = h.apply(Regime::MeanReverting, 0.9, false);
        assert_eq!(out.regime, Regime::MeanReverting);
        assert_eq!(out.reason, HysteresisReason::Switch);
        assert_eq!(h.flip_guard(), 2);
    }

    #[test]
    fn test_flip_guard_delays_switch() {
        let mut h = filter();
        h.apply(Regime::Trending, 0.95, false);

        // FLIP_GUARD_INIT candidates output the old regime
        for _ in 0..2 {
            let out = h.apply(Regime::MeanReverting, 0.9, false);
            assert_eq!(out.regime, Regime::Trending);
            assert_eq!(out.reason, HysteresisReason::FlipGuard);
            assert!((out.confidence - 0.85).abs() < 1e-12);
            assert!(!out.reject);
        }

        let out = h.apply(Regime::MeanReverting, 0.9, false);
        assert_eq!(out.regime, Regime::MeanReverting);
        assert_eq!(out.reason, HysteresisReason::Switch);
        assert_eq!(out.confidence, 0.9);
    }

    #[test]
    fn test_flip_guard_confidence_floor() {
        let mut h = filter();
        h.apply(Regime::Trending, 0.95, false);
        let out = h.apply(Regime::MeanReverting, 0.62, false);
        assert_eq!(out.confidence, 0.60);
    }

    #[test]
    fn test_hold_does_not_reset_guard() {
        let mut h = filter();
        h.apply(Regime::Trending, 0.95, false);
        h.apply(Regime::MeanReverting, 0.9, false);
        assert_eq!(h.flip_guard(), 1);

        let out = h.apply(Regime::Trending, 0.92, false);
        assert_eq!(out.reason, HysteresisReason::Hold);
        assert_eq!(h.flip_guard(), 1);
    }
}
