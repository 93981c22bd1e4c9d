//! OpenAI-compatible vision backend.
//!
//! Talks to any server exposing `/v1/chat/completions` with image parts
//! (mlx-vlm, llama.cpp server, vLLM, Ollama, ...). The HTTP client is async;
//! [`VisionModel::generate`] drives it from the calling worker thread through
//! a runtime handle so the call stays blocking from the pipeline's view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vistalk_core::config::InferenceConfig;

use crate::{VisionModel, VisionRequest};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

pub struct OpenAiVisionModel {
    pub base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
    runtime: Handle,
    loaded: AtomicBool,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    temperature: f64,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiVisionModel {
    /// Create a backend bound to `runtime` for driving HTTP calls.
    pub fn new(config: &InferenceConfig, runtime: Handle) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key: config.resolve_api_key(),
            timeout: config.timeout(),
            client: reqwest::Client::new(),
            runtime,
            loaded: AtomicBool::new(false),
        }
    }

    /// Check that the server answers `/v1/models`, recording the result.
    pub async fn probe(&self) -> bool {
        let mut req = self.client.get(format!("{}/v1/models", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let ok = match req.timeout(Duration::from_secs(5)).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<ModelsResponse>().await {
                    Ok(models) => {
                        let listed = models.data.iter().any(|m| m.id == self.model);
                        if !listed {
                            warn!(model = %self.model, "Model not listed by inference server");
                        }
                        true
                    }
                    Err(e) => {
                        warn!(%e, "Inference server returned an unreadable model list");
                        true
                    }
                }
            }
            Ok(resp) => {
                warn!(status = %resp.status(), base_url = %self.base_url, "Inference probe failed");
                false
            }
            Err(e) => {
                warn!(%e, base_url = %self.base_url, "Inference server unreachable");
                false
            }
        };

        self.loaded.store(ok, Ordering::SeqCst);
        if ok {
            info!(model = %self.model, base_url = %self.base_url, "Inference backend ready");
        }
        ok
    }

    fn build_body(&self, request: &VisionRequest<'_>) -> anyhow::Result<OpenAiRequest> {
        let content = match request.image {
            Some(frame) => {
                let jpeg = frame.to_jpeg()?;
                let b64 = base64::engine::general_purpose::STANDARD.encode(jpeg);
                json!([
                    {"type": "text", "text": request.prompt},
                    {
                        "type": "image_url",
                        "image_url": {"url": format!("data:image/jpeg;base64,{b64}")},
                    },
                ])
            }
            None => json!(request.prompt),
        };

        Ok(OpenAiRequest {
            model: self.model.clone(),
            messages: vec![json!({"role": "user", "content": content})],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        })
    }

    async fn complete(&self, body: &OpenAiRequest) -> anyhow::Result<String> {
        debug!(model = %body.model, base_url = %self.base_url, "Calling OpenAI-compatible API");

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let response = req.json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Inference API error {status}: {text}");
        }

        let completion: ChatCompletion = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Inference API returned no choices"))?;
        Ok(content_text(&choice.message.content))
    }
}

/// Flatten a message `content` that may be a string or an array of parts.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

impl VisionModel for OpenAiVisionModel {
    fn id(&self) -> &str {
        &self.model
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn generate(
        &self,
        request: &VisionRequest<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let body = self.build_body(request)?;
        let text = self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => anyhow::bail!("inference cancelled"),
                result = tokio::time::timeout(self.timeout, self.complete(&body)) => {
                    result.map_err(|_| {
                        anyhow::anyhow!("inference timed out after {}s", self.timeout.as_secs())
                    })?
                }
            }
        })?;

        // A server that was down at startup counts as loaded once it answers.
        if !self.loaded.swap(true, Ordering::SeqCst) {
            info!(model = %self.model, base_url = %self.base_url, "Inference backend answered");
        }
        Ok(text)
    }
}
