//! HTTP error responses.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use vistalk_core::{ErrorKind, VistalkError};
use vistalk_media::{AudioStoreError, CaptureFailure};

/// An error rendered as `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(self.kind.as_str());

        let body = Json(json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<VistalkError> for ApiError {
    fn from(err: VistalkError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::Protocol => StatusCode::BAD_REQUEST,
            ErrorKind::Capture => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Inference | ErrorKind::Synthesis => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::protocol(rejection.body_text())
    }
}

impl From<AudioStoreError> for ApiError {
    fn from(err: AudioStoreError) -> Self {
        match err {
            AudioStoreError::InvalidName(_) => Self::protocol("Only .wav files allowed"),
            AudioStoreError::NotFound(name) => {
                Self::not_found(format!("Audio file {name} not found"))
            }
            AudioStoreError::Io(e) => Self::internal(e.to_string()),
        }
    }
}

impl From<CaptureFailure> for ApiError {
    fn from(failure: CaptureFailure) -> Self {
        let status = match failure {
            CaptureFailure::NoDevice => StatusCode::SERVICE_UNAVAILABLE,
            CaptureFailure::ReadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: ErrorKind::Capture,
            message: format!("Failed to capture webcam frame: {failure}"),
        }
    }
}
