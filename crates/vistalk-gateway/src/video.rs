//! Single-frame camera snapshots for video previews.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::GatewayState;

/// `GET /api/video/capture`: the current frame as JPEG.
pub async fn capture(State(state): State<Arc<GatewayState>>) -> Result<Response, ApiError> {
    let frame = state.pipeline.capture().await?;
    let jpeg = tokio::task::spawn_blocking(move || frame.to_jpeg())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(|e| ApiError::internal(format!("encoding frame: {e:#}")))?;

    let headers = [(CONTENT_TYPE, "image/jpeg"), (CACHE_CONTROL, "no-cache")];
    Ok((headers, jpeg).into_response())
}

/// `GET /api/video/status`: camera availability and the last frame size.
pub async fn status(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let pipeline = &state.pipeline;
    let (width, height) = pipeline.camera_dimensions().unzip();
    Json(json!({
        "available": pipeline.capture_available(),
        "device": pipeline.camera_device(),
        "width": width,
        "height": height,
    }))
}
