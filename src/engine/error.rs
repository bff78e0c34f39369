use thiserror::Error;

/// Failure of one per-bar stage. Every variant becomes an error response;
/// none of them ends the session.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("numeric fault: {0}")]
    NumericFault(String),

    #[error("model fit failed: {0}")]
    ModelFit(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::MalformedInput(err.to_string())
    }
}
