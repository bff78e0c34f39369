pub mod controller;
pub mod error;
pub mod pipeline;
pub mod replay;

pub use controller::SessionStats;
pub use error::PipelineError;
pub use pipeline::Session;
pub use replay::replay_file;
