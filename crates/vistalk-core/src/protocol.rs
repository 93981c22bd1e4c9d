//! Response event stream and its wire encodings.
//!
//! A chat request produces an ordered sequence of [`StreamEvent`]s. The
//! sequence always ends with exactly one terminal event (`done` or `error`).
//! [`WireFormat`] turns each event into a self-delimited frame that a client
//! can parse incrementally.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ErrorKind, VistalkError};
use crate::types::AudioArtifact;

/// One event on a chat response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// A whitespace-delimited slice of the cleaned reply.
    TextDelta { delta: String },

    /// The full cleaned reply; ends the text sub-stream.
    TextComplete { text: String },

    /// Synthesized speech for the reply.
    AudioChunk(AudioChunk),

    /// Speech synthesis failed; the text already sent still stands.
    AudioError { error: String },

    /// An action directive found in the model output.
    Action {
        name: String,
        dispatched: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Fatal failure. Terminal.
    Error { kind: ErrorKind, error: String },

    /// Successful completion. Terminal.
    Done { full_text: String },
}

/// Payload of an `audio-chunk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Base64-encoded audio bytes.
    pub audio_data: String,
    pub encoding: String,
    /// Duration in seconds.
    pub duration: f64,
    pub is_final: bool,
    pub chunk_index: u32,
    pub text: String,
    pub voice: String,
    /// Retrieval path when the artifact was also published to disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl AudioChunk {
    /// Build the single, final chunk for a synthesized reply.
    pub fn from_artifact(artifact: &AudioArtifact, text: &str, voice: &str) -> Self {
        Self {
            audio_data: artifact.to_base64(),
            encoding: artifact.encoding.as_str().to_string(),
            duration: artifact.duration_seconds,
            is_final: true,
            chunk_index: 0,
            text: text.to_string(),
            voice: voice.to_string(),
            audio_url: None,
        }
    }
}

impl StreamEvent {
    pub fn error(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self::Error {
            kind,
            error: error.into(),
        }
    }

    /// Event label used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::TextComplete { .. } => "text-complete",
            Self::AudioChunk(_) => "audio-chunk",
            Self::AudioError { .. } => "audio-error",
            Self::Action { .. } => "action",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this event closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}

/// Framing used for the response stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// `event: <kind>\ndata: <json>\n\n`
    #[default]
    Sse,
    /// One JSON object per line.
    Ndjson,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Sse => "text/event-stream",
            Self::Ndjson => "application/x-ndjson",
        }
    }

    /// Encode one event as a complete frame.
    pub fn encode(&self, event: &StreamEvent) -> String {
        let payload = event_json(event);
        match self {
            Self::Sse => format!("event: {}\ndata: {payload}\n\n", event.kind()),
            Self::Ndjson => format!("{payload}\n"),
        }
    }

    /// Decode a complete body back into events.
    ///
    /// Used by clients and tests. SSE comments (`:` lines) and unknown fields
    /// are ignored, multi-line `data:` values are joined with `\n`.
    pub fn decode(&self, body: &str) -> crate::Result<Vec<StreamEvent>> {
        match self {
            Self::Sse => decode_sse(body),
            Self::Ndjson => body
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str(line).map_err(VistalkError::from))
                .collect(),
        }
    }
}

/// Serialize an event, falling back to an internal `error` object so an
/// event is never silently lost on the wire.
fn event_json(event: &StreamEvent) -> String {
    match serde_json::to_value(event) {
        Ok(value) => value.to_string(),
        Err(e) => {
            tracing::error!(%e, kind = event.kind(), "Failed to serialize stream event");
            json!({
                "type": "error",
                "kind": ErrorKind::Internal,
                "error": format!("failed to encode {} event: {e}", event.kind()),
            })
            .to_string()
        }
    }
}

fn decode_sse(body: &str) -> crate::Result<Vec<StreamEvent>> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines().chain(std::iter::once("")) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            // Blank line dispatches the pending event
            if !data.is_empty() {
                events.push(serde_json::from_str(&data.join("\n"))?);
                data.clear();
            }
            continue;
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim_start());
        }
        // `event:` duplicates the JSON `type` field
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sequence() -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta {
                delta: "I ".into(),
            },
            StreamEvent::TextComplete {
                text: "I see.".into(),
            },
            StreamEvent::AudioChunk(AudioChunk::from_artifact(
                &AudioArtifact::wav(vec![1, 2, 3], 2.3),
                "I see.",
                "am_michael",
            )),
            StreamEvent::Done {
                full_text: "I see.".into(),
            },
        ]
    }

    #[test]
    fn test_sse_frame_layout() {
        let frame = WireFormat::Sse.encode(&StreamEvent::TextDelta {
            delta: "hi ".into(),
        });
        let data = frame
            .strip_prefix("event: text-delta\ndata: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .expect("sse framing");
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(value["type"], "text-delta");
        assert_eq!(value["delta"], "hi ");
    }

    #[test]
    fn test_ndjson_frame_is_one_line() {
        let frame = WireFormat::Ndjson.encode(&StreamEvent::Done {
            full_text: "a\nb".into(),
        });
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }

    #[test]
    fn test_error_event_fields() {
        let frame = WireFormat::Ndjson.encode(&StreamEvent::error(
            ErrorKind::Capture,
            "Failed to capture webcam frame",
        ));
        let value: serde_json::Value = serde_json::from_str(frame.trim()).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "capture");
        assert_eq!(value["error"], "Failed to capture webcam frame");
    }

    #[test]
    fn test_audio_chunk_fields() {
        let frame = WireFormat::Ndjson.encode(&sample_sequence()[2]);
        let value: serde_json::Value = serde_json::from_str(frame.trim()).unwrap();
        assert_eq!(value["type"], "audio-chunk");
        assert_eq!(value["audio_data"], "AQID");
        assert_eq!(value["encoding"], "wav");
        assert_eq!(value["duration"], 2.3);
        assert_eq!(value["is_final"], true);
        assert!(value.get("audio_url").is_none());
    }

    #[test]
    fn test_decode_preserves_order() {
        for format in [WireFormat::Sse, WireFormat::Ndjson] {
            let events = sample_sequence();
            let body: String = events.iter().map(|e| format.encode(e)).collect();
            assert_eq!(format.decode(&body).unwrap(), events);
        }
    }

    #[test]
    fn test_sse_decode_skips_comments() {
        let body = ": keep-alive\n\nevent: done\ndata: {\"type\":\"done\",\"full_text\":\"\"}\n\n";
        let events = WireFormat::Sse.decode(body).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(StreamEvent::error(ErrorKind::Inference, "x").is_terminal());
        assert!(
            !StreamEvent::AudioError {
                error: "x".into()
            }
            .is_terminal()
        );
    }
}
