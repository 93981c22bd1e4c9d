//! Inference gateway: prompt composition plus the failure boundary.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vistalk_core::config::InferenceConfig;
use vistalk_core::types::{Frame, InferenceResult};

use crate::{VisionModel, VisionRequest};

/// Directive keyword the model uses to request a physical action.
pub const ACTION_KEYWORD: &str = "ROBOT_ACTION";

pub struct InferenceGateway {
    model: Arc<dyn VisionModel>,
    persona: String,
    actions: Vec<String>,
    grounded_temperature: f64,
    temperature: f64,
}

impl InferenceGateway {
    pub fn new(model: Arc<dyn VisionModel>, config: &InferenceConfig, actions: &[String]) -> Self {
        Self {
            model,
            persona: config.persona.clone(),
            actions: actions.to_vec(),
            grounded_temperature: config.grounded_temperature,
            temperature: config.temperature,
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.id()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_loaded()
    }

    /// Build the prompt sent to the model.
    ///
    /// Grounded prompts get the persona preamble (and the action directive
    /// syntax when actions are enabled). Text-only prompts pass through as-is.
    pub fn compose_prompt(&self, prompt: &str, grounded: bool) -> String {
        if !grounded {
            return prompt.to_string();
        }

        let mut preamble = self.persona.trim().to_string();
        if !self.actions.is_empty() {
            preamble.push_str(&format!(
                " If the user asks for something you can physically do, end your reply with \
                 {ACTION_KEYWORD}:<action>. Available actions: {}.",
                self.actions.join(", ")
            ));
        }
        format!("{preamble}\n\n{prompt}")
    }

    /// Run one blocking model call. Never panics or errors past this point.
    pub fn infer(
        &self,
        prompt: &str,
        image: Option<&Frame>,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> InferenceResult {
        let grounded = image.is_some();
        let request = VisionRequest {
            prompt: self.compose_prompt(prompt, grounded),
            image,
            max_tokens,
            temperature: if grounded {
                self.grounded_temperature
            } else {
                self.temperature
            },
        };

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.model.generate(&request, cancel)));
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(text)) => {
                debug!(
                    model = self.model.id(),
                    grounded,
                    duration_secs = elapsed,
                    chars = text.len(),
                    "Inference complete"
                );
                InferenceResult::ok(text)
            }
            Ok(Err(e)) => {
                warn!(model = self.model.id(), %e, duration_secs = elapsed, "Inference failed");
                InferenceResult::failed(format!("{e:#}"))
            }
            Err(_) => {
                warn!(model = self.model.id(), "Inference backend panicked");
                InferenceResult::failed("inference backend panicked")
            }
        }
    }
}
