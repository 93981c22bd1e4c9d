use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VistalkError {
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Worker pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VistalkError {
    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Capture(_) => ErrorKind::Capture,
            Self::Inference(_) => ErrorKind::Inference,
            Self::Synthesis(_) => ErrorKind::Synthesis,
            Self::Protocol(_) => ErrorKind::Protocol,
            _ => ErrorKind::Internal,
        }
    }

    /// Rebuild an error from its wire classification.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Capture => Self::Capture(message),
            ErrorKind::Inference => Self::Inference(message),
            ErrorKind::Synthesis => Self::Synthesis(message),
            ErrorKind::Protocol => Self::Protocol(message),
            ErrorKind::Internal => Self::Other(anyhow::anyhow!(message)),
        }
    }
}

/// Error classes visible to clients in `error` events and HTTP bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Capture,
    Inference,
    Synthesis,
    Protocol,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Inference => "inference",
            Self::Synthesis => "synthesis",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, VistalkError>;
