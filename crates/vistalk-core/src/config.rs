//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::WireFormat;
use crate::types::{DEFAULT_MAX_TOKENS, DEFAULT_VOICE};

/// Persona preamble prefixed to grounded prompts.
pub const DEFAULT_PERSONA: &str = "You are a hands-on repair assistant. You can see the workbench \
through a camera and help with electronics repair. Answer in one short, practical sentence and \
only describe the image when it helps with the user's request.";

/// Top-level vistalk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkersConfig>,

    #[serde(default)]
    pub actions: ActionsConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Framing of chat response streams.
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Add a permissive CORS layer (browser frontends on another origin).
    #[serde(default = "default_true")]
    pub cors_allow_any: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

/// Vision-language model backend (OpenAI-compatible chat completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_vlm_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Persona preamble for grounded mode.
    #[serde(default = "default_persona")]
    pub persona: String,

    #[serde(default = "default_grounded_temperature")]
    pub grounded_temperature: f64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Concurrent calls allowed into the model. 1 serializes access.
    #[serde(default = "default_one")]
    pub max_concurrent: usize,

    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
}

fn default_vlm_model() -> String {
    "mlx-community/gemma-3n-E2B-it-4bit".into()
}

fn default_persona() -> String {
    DEFAULT_PERSONA.into()
}

fn default_grounded_temperature() -> f64 {
    0.6
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_one() -> usize {
    1
}

fn default_inference_timeout() -> u64 {
    120
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_vlm_model(),
            api_key: None,
            api_key_env: None,
            persona: default_persona(),
            grounded_temperature: default_grounded_temperature(),
            temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            max_concurrent: default_one(),
            timeout_secs: default_inference_timeout(),
        }
    }
}

impl InferenceConfig {
    /// Resolve the API key: check `api_key` first, then `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// External TTS engine invoked as a subprocess that writes a WAV file.
///
/// `args` may contain the placeholders `{output}`, `{output_stem}`, `{voice}`,
/// `{speed}`, `{sample_rate}`, `{lang}` and `{text}`. When `{text}` is not
/// used the text is written to the engine's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_voice")]
    pub default_voice: String,

    #[serde(default = "default_speed")]
    pub speed: f64,

    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_one")]
    pub max_concurrent: usize,

    #[serde(default = "default_speech_timeout")]
    pub timeout_secs: u64,
}

fn default_voice() -> String {
    DEFAULT_VOICE.into()
}

fn default_speed() -> f64 {
    1.2
}

fn default_lang() -> String {
    "a".into()
}

fn default_sample_rate() -> u32 {
    22050
}

fn default_speech_timeout() -> u64 {
    60
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            default_voice: default_voice(),
            speed: default_speed(),
            lang: default_lang(),
            sample_rate: default_sample_rate(),
            max_concurrent: default_one(),
            timeout_secs: default_speech_timeout(),
        }
    }
}

impl SpeechConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where camera frames come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraSourceConfig {
    /// No camera; grounded requests fail with a capture error.
    #[default]
    None,
    /// HTTP endpoint returning the current frame as JPEG/PNG.
    SnapshotUrl { url: String },
    /// Image file that an external grabber keeps overwriting.
    File { path: String },
    /// Command that writes one encoded frame to stdout per run
    /// (e.g. `ffmpeg -f v4l2 -i /dev/video0 -frames:v 1 -f image2pipe -c:v png -`).
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub source: CameraSourceConfig,

    /// Buffered frames read and discarded before the one that is returned.
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    #[serde(default = "default_camera_timeout")]
    pub timeout_secs: u64,
}

/// Fewest buffered frames a capture may discard; devices hold at least this many stale ones.
pub const MIN_WARMUP_FRAMES: u32 = 2;

fn default_warmup_frames() -> u32 {
    MIN_WARMUP_FRAMES
}

fn default_camera_timeout() -> u64 {
    5
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: CameraSourceConfig::None,
            warmup_frames: default_warmup_frames(),
            timeout_secs: default_camera_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pause after each `text-delta` event. 0 disables the cadence.
    #[serde(default = "default_token_delay_ms")]
    pub token_delay_ms: u64,

    /// Buffered events between the pipeline task and the response body.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_token_delay_ms() -> u64 {
    20
}

fn default_channel_capacity() -> usize {
    32
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            token_delay_ms: default_token_delay_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl StreamConfig {
    pub fn token_delay(&self) -> Duration {
        Duration::from_millis(self.token_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Threads available for blocking capture/model calls.
    #[serde(default = "default_worker_pool_size")]
    pub size: usize,
}

fn default_worker_pool_size() -> usize {
    4
}

/// Action directives the model may emit, and where to send them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    /// Action names accepted from the model. Empty disables the feature.
    #[serde(default)]
    pub allowed: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ActionsConfig {
    /// Robot base URL: `robot_url` wins, else `http://{robot_host}:{robot_port}`.
    pub fn resolve_robot_url(&self) -> Option<String> {
        if let Some(url) = self.robot_url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.trim_end_matches('/').to_string());
        }
        match (self.robot_host.as_deref(), self.robot_port) {
            (Some(host), Some(port)) if !host.is_empty() => Some(format!("http://{host}:{port}")),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(5))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Directory where synthesized replies are published for retrieval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "vistalk_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::VistalkError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8000)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn wire_format(&self) -> WireFormat {
        self.gateway
            .as_ref()
            .map(|g| g.wire_format)
            .unwrap_or_default()
    }

    pub fn cors_allow_any(&self) -> bool {
        self.gateway.as_ref().is_none_or(|g| g.cors_allow_any)
    }

    pub fn worker_pool_size(&self) -> usize {
        self.workers.as_ref().map(|w| w.size).unwrap_or(4)
    }

    /// Directory for published audio artifacts, if publishing is enabled.
    pub fn audio_publish_dir(&self) -> Option<PathBuf> {
        self.audio
            .as_ref()
            .and_then(|a| a.publish_dir.as_deref())
            .filter(|d| !d.is_empty())
            .map(expand_home)
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "speech.default_voice").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.inference.base_url.is_none() {
            warnings.push("No inference.base_url configured; chat requests will fail".to_string());
        }
        if self.speech.command.is_none() {
            warnings.push("No speech.command configured; replies will be text-only".to_string());
        }
        if self.camera.source == CameraSourceConfig::None {
            warnings.push("No camera.source configured; grounded chat will fail".to_string());
        }
        if !self.actions.allowed.is_empty() && self.actions.resolve_robot_url().is_none() {
            warnings.push("Actions are allowed but no robot endpoint is configured".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }
        if self.worker_pool_size() == 0 {
            errors.push("workers.size must be at least 1".to_string());
        }
        if self.inference.max_concurrent == 0 {
            errors.push("inference.max_concurrent must be at least 1".to_string());
        }
        if self.speech.max_concurrent == 0 {
            errors.push("speech.max_concurrent must be at least 1".to_string());
        }
        if self.stream.channel_capacity == 0 {
            errors.push("stream.channel_capacity must be at least 1".to_string());
        }
        if self.camera.warmup_frames < MIN_WARMUP_FRAMES {
            errors.push(format!("camera.warmup_frames must be at least {MIN_WARMUP_FRAMES}"));
        }

        (warnings, errors)
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Base directory for vistalk data: `~/.vistalk/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vistalk")
}
