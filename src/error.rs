use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("model not configured: {model}")]
    ModelNotFound { model: String },
    #[error("model disabled: {model}")]
    ModelDisabled { model: String },
    #[error("no provider available for model: {model}")]
    NoCandidate { model: String },
    #[error("all providers exhausted ({last_status}): {message}")]
    Exhausted {
        last_status: u16,
        message: String,
        trace_id: String,
    },
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid config: {reason}")]
    Config { reason: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
