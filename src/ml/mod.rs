pub mod boosting;
pub mod features;
pub mod filter;
pub mod hmm;
pub mod hysteresis;
pub mod model;
pub mod tracker;
