//! Retrieval of published audio artifacts.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, EXPIRES, PRAGMA};
use axum::response::{IntoResponse, Response};

use vistalk_core::types::AudioEncoding;
use vistalk_media::{AudioStoreError, is_valid_name};

use crate::error::ApiError;
use crate::state::GatewayState;

/// Route prefix under which published files are served.
pub const AUDIO_ROUTE_PREFIX: &str = "/api/chat/audio";

/// URL advertised to clients for a published file.
pub fn audio_url(name: &str) -> String {
    format!("{AUDIO_ROUTE_PREFIX}/{name}")
}

/// `GET /api/chat/audio/{filename}`
pub async fn get_audio(
    State(state): State<Arc<GatewayState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_valid_name(&filename) {
        return Err(AudioStoreError::InvalidName(filename).into());
    }

    let pipeline = state.pipeline.clone();
    let name = filename.clone();
    let bytes = tokio::task::spawn_blocking(move || match pipeline.audio_store() {
        Some(store) => store.read(&name),
        None => Err(AudioStoreError::NotFound(name)),
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    let headers = [
        (CONTENT_TYPE, AudioEncoding::Wav.mime_type().to_string()),
        (CONTENT_DISPOSITION, format!("inline; filename={filename}")),
        (CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        (PRAGMA, "no-cache".to_string()),
        (EXPIRES, "0".to_string()),
    ];
    Ok((headers, bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_url() {
        assert_eq!(audio_url("tts_1.wav"), "/api/chat/audio/tts_1.wav");
    }
}
