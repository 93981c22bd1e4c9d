use std::io::Cursor;

use base64::Engine;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

/// Prompt used when the caller sends a blank one.
pub const DEFAULT_PROMPT: &str = "hello";

/// Voice used when the caller does not pick one.
pub const DEFAULT_VOICE: &str = "am_michael";

/// Token budget used when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 50;

/// Upper bound accepted for a per-request token budget.
pub const MAX_TOKENS_LIMIT: u32 = 1024;

/// An RGB image captured for a single inference call.
///
/// Frames are owned by the request that produced them and are dropped once
/// the inference call returns.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Decode a PNG/JPEG (or any enabled format) byte buffer into a frame.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self {
            image: decoded.to_rgb8(),
        })
    }

    /// Decode a base64 image payload, tolerating a `data:*;base64,` prefix.
    pub fn decode_base64(payload: &str) -> anyhow::Result<Self> {
        let raw = payload
            .split_once(";base64,")
            .map(|(_, data)| data)
            .unwrap_or(payload);
        let bytes = base64::engine::general_purpose::STANDARD.decode(raw.trim())?;
        Self::decode(&bytes)
    }

    /// Encode as JPEG for transport to a model backend.
    pub fn to_jpeg(&self) -> anyhow::Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.image.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Where the image for a request comes from.
#[derive(Debug, Clone, Default)]
pub enum ImageInput {
    /// Grab the current camera frame.
    #[default]
    Camera,
    /// Use a caller-supplied image; the camera is not touched.
    Attached(Frame),
    /// Text-only mode: no image, raw prompt.
    Omitted,
}

impl ImageInput {
    /// Whether this request runs in grounded (image-attached) mode.
    pub fn is_grounded(&self) -> bool {
        !matches!(self, Self::Omitted)
    }
}

/// One validated chat request handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub enable_tts: bool,
    pub voice: String,
    pub image: ImageInput,
}

impl ChatRequest {
    /// Build a request, normalizing the prompt and clamping the token budget.
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: normalize_prompt(prompt),
            max_tokens: DEFAULT_MAX_TOKENS,
            enable_tts: true,
            voice: DEFAULT_VOICE.to_string(),
            image: ImageInput::Camera,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens.clamp(1, MAX_TOKENS_LIMIT);
        self
    }

    pub fn with_tts(mut self, enable_tts: bool) -> Self {
        self.enable_tts = enable_tts;
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        let voice = voice.into();
        if !voice.trim().is_empty() {
            self.voice = voice;
        }
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = image;
        self
    }
}

fn normalize_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Outcome of one vision-language model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub raw_text: String,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl InferenceResult {
    pub fn ok(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            succeeded: true,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            raw_text: String::new(),
            succeeded: false,
            error_detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    #[default]
    Wav,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
        }
    }
}

/// Synthesized speech for one request, held in memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioArtifact {
    pub bytes: Vec<u8>,
    pub encoding: AudioEncoding,
    pub duration_seconds: f64,
    pub succeeded: bool,
    pub error_detail: Option<String>,
}

impl AudioArtifact {
    pub fn wav(bytes: Vec<u8>, duration_seconds: f64) -> Self {
        Self {
            bytes,
            encoding: AudioEncoding::Wav,
            duration_seconds,
            succeeded: true,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            bytes: Vec::new(),
            encoding: AudioEncoding::Wav,
            duration_seconds: 0.0,
            succeeded: false,
            error_detail: Some(detail.into()),
        }
    }

    /// Base64 form used on the wire.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}
