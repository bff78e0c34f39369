pub mod gaussian_hmm;
pub mod regime_detector;

pub use regime_detector::{RegimeCall, RegimeModel};
