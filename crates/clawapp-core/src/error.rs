use thiserror::Error;

/// Errors produced by the clawapp protocol layer.
#[derive(Debug, Error)]
pub enum ClawError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ClawError {
    fn from(e: serde_json::Error) -> Self {
        ClawError::Codec(e.to_string())
    }
}

pub type ClawResult<T> = Result<T, ClawError>;
