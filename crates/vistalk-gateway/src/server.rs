//! Axum HTTP server.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::GatewayState;
use crate::{audio, chat, video};

/// Build the router with every route and layer.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let cors_allow_any = state.config.cors_allow_any();

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat::stream_chat))
        .route("/api/chat/realtime", post(chat::stream_chat))
        .route("/api/chat/webcam", post(chat::webcam_chat))
        .route("/api/chat/image", post(chat::image_chat))
        .route("/api/chat/tts", post(chat::synthesize))
        .route("/api/chat/health", get(health_handler))
        .route("/api/chat/cameras", get(cameras_handler))
        .route("/api/video/capture", get(video::capture))
        .route("/api/video/status", get(video::status))
        .route(
            &format!("{}/{{filename}}", audio::AUDIO_ROUTE_PREFIX),
            get(audio::get_audio),
        );

    #[cfg(feature = "metrics")]
    {
        app = app
            .route("/metrics", get(metrics_handler))
            .layer(axum::middleware::from_fn(track_request));
    }

    app = app.layer(TraceLayer::new_for_http());
    if cors_allow_any {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app.with_state(state)
}

/// Serve until Ctrl+C, then shut the pipeline down.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.gateway_bind();
    let pipeline = state.pipeline.clone();
    let app = build_router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pipeline.shutdown().await;
    Ok(())
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let pipeline = &state.pipeline;
    let model_loaded = pipeline.model_loaded();
    let status = if model_loaded && !pipeline.is_shut_down() {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "model_loaded": model_loaded,
        "capture_available": pipeline.capture_available(),
        "speech_available": pipeline.speech_ready(),
        "model": pipeline.model_id(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn cameras_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let cameras: Vec<Value> = state
        .pipeline
        .camera_device()
        .into_iter()
        .map(|device| json!({ "device": device, "available": true }))
        .collect();
    Json(json!({ "cameras": cameras }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> axum::response::Response {
    use axum::response::IntoResponse;

    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(feature = "metrics")]
async fn track_request(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let route = request
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let start = std::time::Instant::now();
    let response = next.run(request).await;
    crate::metrics::record_request(&route, start.elapsed().as_secs_f64());
    response
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for Ctrl+C; shutting down");
        return;
    }
    info!("Shutdown signal received");
}
