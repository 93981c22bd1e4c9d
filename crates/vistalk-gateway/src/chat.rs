//! Chat handlers: the streaming operation and its non-streaming variants.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vistalk_core::protocol::AudioChunk;
use vistalk_core::types::{ChatRequest, Frame, ImageInput};
use vistalk_core::{ErrorKind, WireFormat};
use vistalk_pipeline::{ChatOutcome, PipelineSettings, run_pipeline, run_to_completion};

use crate::error::ApiError;
use crate::state::GatewayState;

/// One entry of an AI-SDK style `messages` array.
#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    /// Either a plain string or an array of `{ "type": "text", "text": ... }` parts.
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.as_str()),
                    other => other.get("text").and_then(Value::as_str),
                })
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

/// Body of the chat operations.
#[derive(Debug, Default, Deserialize)]
pub struct ChatBody {
    pub prompt: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
    pub max_tokens: Option<u32>,
    pub enable_tts: Option<bool>,
    pub voice: Option<String>,
    /// `false` skips the camera and sends the raw prompt.
    pub grounded: Option<bool>,
}

impl ChatBody {
    pub fn into_request(self, settings: &PipelineSettings) -> Result<ChatRequest, ApiError> {
        let prompt = match (self.prompt, self.messages) {
            (Some(prompt), _) => prompt,
            (None, Some(messages)) => messages.last().map(ChatMessage::text).unwrap_or_default(),
            (None, None) => {
                return Err(ApiError::protocol(
                    "request needs a `prompt` or a `messages` array",
                ));
            }
        };

        let image = if self.grounded.unwrap_or(true) {
            ImageInput::Camera
        } else {
            ImageInput::Omitted
        };

        Ok(ChatRequest::new(&prompt)
            .with_max_tokens(self.max_tokens.unwrap_or(settings.default_max_tokens))
            .with_tts(self.enable_tts.unwrap_or(true))
            .with_voice(self.voice.unwrap_or_else(|| settings.default_voice.clone()))
            .with_image(image))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Overrides the configured wire format for this response.
    pub format: Option<WireFormat>,
}

/// `POST /api/chat` and `POST /api/chat/realtime`: stream the event sequence.
///
/// Validation failures are answered with a plain `400` before any pipeline
/// work starts. Once the stream is open, failures arrive as `error` events.
pub async fn stream_chat(
    State(state): State<Arc<GatewayState>>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::protocol(e.body_text()))?;
    let Json(body) = body?;
    let request = body.into_request(state.pipeline.settings())?;
    let format = query.format.unwrap_or(state.wire_format);

    let (tx, rx) = mpsc::channel(state.pipeline.settings().channel_capacity);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        let summary = run_pipeline(&pipeline, request, tx, CancellationToken::new()).await;
        debug!(outcome = ?summary.outcome, events = summary.events_sent, "Stream closed");
        #[cfg(feature = "metrics")]
        crate::metrics::record_run(&summary);
    });

    let frames =
        ReceiverStream::new(rx).map(move |event| Ok::<_, Infallible>(format.encode(&event)));
    Response::builder()
        .header(CONTENT_TYPE, format.content_type())
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// `POST /api/chat/webcam`: grounded chat folded into one document.
pub async fn webcam_chat(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<ChatOutcome>, ApiError> {
    let Json(body) = body?;
    let request = body.into_request(state.pipeline.settings())?;
    let outcome = run_to_completion(&state.pipeline, request).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ImageChatBody {
    /// PNG or JPEG, optionally as a `data:` URL.
    pub image_base64: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub enable_tts: Option<bool>,
    pub voice: Option<String>,
}

/// `POST /api/chat/image`: chat about a supplied image instead of the camera.
pub async fn image_chat(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ImageChatBody>, JsonRejection>,
) -> Result<Json<ChatOutcome>, ApiError> {
    let Json(body) = body?;
    let frame = Frame::decode_base64(&body.image_base64)
        .map_err(|e| ApiError::protocol(format!("invalid image: {e:#}")))?;

    let settings = state.pipeline.settings();
    let request = ChatRequest::new(&body.prompt)
        .with_max_tokens(body.max_tokens.unwrap_or(settings.default_max_tokens))
        .with_tts(body.enable_tts.unwrap_or(true))
        .with_voice(body.voice.unwrap_or_else(|| settings.default_voice.clone()))
        .with_image(ImageInput::Attached(frame));

    let outcome = run_to_completion(&state.pipeline, request).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct TtsBody {
    pub text: String,
    pub voice: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TtsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub audio: AudioChunk,
}

/// `POST /api/chat/tts`: synthesize text directly, bypassing the model.
pub async fn synthesize(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<TtsBody>, JsonRejection>,
) -> Result<Json<TtsResponse>, ApiError> {
    let Json(body) = body?;
    let text = body.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::protocol("text is required"));
    }
    let voice = body
        .voice
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| state.pipeline.settings().default_voice.clone());

    let artifact = state
        .pipeline
        .synthesize(text.clone(), voice.clone(), CancellationToken::new())
        .await;
    if !artifact.succeeded {
        let detail = artifact.error_detail.unwrap_or_else(|| "synthesis failed".into());
        warn!(%detail, "Direct synthesis failed");
        return Err(ApiError {
            status: StatusCode::BAD_GATEWAY,
            kind: ErrorKind::Synthesis,
            message: detail,
        });
    }

    let mut audio = AudioChunk::from_artifact(&artifact, &text, &voice);
    audio.audio_url = state
        .pipeline
        .publish_audio(&artifact)
        .await
        .map(|name| crate::audio::audio_url(&name));
    Ok(Json(TtsResponse {
        success: true,
        audio,
    }))
}
