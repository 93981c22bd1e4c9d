//! Vision-language model abstraction.
//!
//! A backend implements [`VisionModel`], a blocking call that turns a prompt
//! (and optionally one image) into text. [`InferenceGateway`] wraps a backend
//! with prompt composition and converts every failure into an explicit
//! [`InferenceResult`](vistalk_core::types::InferenceResult).

use tokio_util::sync::CancellationToken;
use vistalk_core::types::Frame;

pub mod gateway;
pub mod openai;

pub use gateway::{ACTION_KEYWORD, InferenceGateway};
pub use openai::OpenAiVisionModel;

/// A fully composed request to the model.
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub prompt: String,
    pub image: Option<&'a Frame>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// A blocking vision-language model.
///
/// Calls may take seconds and must only be made from a worker thread, never
/// from an async task. Implementations should return early with an error
/// once `cancel` fires if they can.
pub trait VisionModel: Send + Sync {
    /// Model identifier (for logs and health output).
    fn id(&self) -> &str;

    /// Whether the backend answered its readiness probe.
    fn is_loaded(&self) -> bool;

    /// Generate a reply.
    fn generate(
        &self,
        request: &VisionRequest<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String>;
}
