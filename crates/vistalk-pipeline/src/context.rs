//! Process-wide pipeline handles.
//!
//! A [`PipelineContext`] is built once at startup and torn down once with
//! [`PipelineContext::shutdown`]. Requests borrow it through an `Arc`; they
//! never own any of its parts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vistalk_core::config::Config;
use vistalk_core::types::{
    AudioArtifact, DEFAULT_MAX_TOKENS, DEFAULT_VOICE, Frame, InferenceResult,
};
use vistalk_core::{Result, VistalkError};
use vistalk_media::{AudioStore, CaptureFailure, FrameSource, SpeechGateway};
use vistalk_providers::{InferenceGateway, OpenAiVisionModel};

use crate::action::{ActionDispatcher, DispatchReport, HttpRobot};
use crate::pool::WorkerPool;

/// Tunables read once from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Pause after each `text-delta` event.
    pub token_delay: Duration,
    pub default_voice: String,
    pub default_max_tokens: u32,
    pub allowed_actions: Vec<String>,
    /// Concurrent calls allowed into the inference backend.
    pub inference_concurrency: usize,
    /// Concurrent calls allowed into the speech engine.
    pub speech_concurrency: usize,
    pub workers: usize,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(20),
            default_voice: DEFAULT_VOICE.into(),
            default_max_tokens: DEFAULT_MAX_TOKENS,
            allowed_actions: Vec::new(),
            inference_concurrency: 1,
            speech_concurrency: 1,
            workers: 4,
            channel_capacity: 32,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token_delay: config.stream.token_delay(),
            default_voice: config.speech.default_voice.clone(),
            default_max_tokens: config.inference.default_max_tokens,
            allowed_actions: config.actions.allowed.clone(),
            inference_concurrency: config.inference.max_concurrent.max(1),
            speech_concurrency: config.speech.max_concurrent.max(1),
            workers: config.worker_pool_size(),
            channel_capacity: config.stream.channel_capacity.max(1),
        }
    }
}

pub struct PipelineContext {
    camera: Arc<FrameSource>,
    inference: Arc<InferenceGateway>,
    speech: Arc<SpeechGateway>,
    inference_slots: Arc<Semaphore>,
    speech_slots: Arc<Semaphore>,
    pool: WorkerPool,
    robot: Option<Arc<dyn ActionDispatcher>>,
    audio_store: Option<Arc<AudioStore>>,
    settings: PipelineSettings,
    shut_down: AtomicBool,
}

impl PipelineContext {
    pub fn new(
        camera: FrameSource,
        inference: InferenceGateway,
        speech: SpeechGateway,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            camera: Arc::new(camera),
            inference: Arc::new(inference),
            speech: Arc::new(speech),
            inference_slots: Arc::new(Semaphore::new(settings.inference_concurrency.max(1))),
            speech_slots: Arc::new(Semaphore::new(settings.speech_concurrency.max(1))),
            pool: WorkerPool::new(settings.workers),
            robot: None,
            audio_store: None,
            settings,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_robot(mut self, robot: Arc<dyn ActionDispatcher>) -> Self {
        self.robot = Some(robot);
        self
    }

    pub fn with_audio_store(mut self, store: AudioStore) -> Self {
        self.audio_store = Some(Arc::new(store));
        self
    }

    /// Build every handle from configuration. Must be called inside a tokio
    /// runtime; blocking backends drive their HTTP calls through it.
    pub async fn init(config: &Config) -> Result<Self> {
        let runtime = Handle::current();

        let model = Arc::new(OpenAiVisionModel::new(&config.inference, runtime.clone()));
        if !model.probe().await {
            warn!("Inference backend not reachable yet; requests will fail until it is");
        }
        let inference = InferenceGateway::new(model, &config.inference, &config.actions.allowed);
        let camera = FrameSource::from_config(&config.camera, runtime);
        let speech = SpeechGateway::from_config(&config.speech);

        let mut ctx = Self::new(camera, inference, speech, PipelineSettings::from_config(config));

        if let Some(robot) = HttpRobot::from_config(&config.actions) {
            ctx = ctx.with_robot(Arc::new(robot));
        }
        if let Some(dir) = config.audio_publish_dir() {
            let store = AudioStore::open(&dir).map_err(|e| {
                VistalkError::Config(format!("audio publish dir {}: {e}", dir.display()))
            })?;
            info!(dir = %dir.display(), "Publishing synthesized audio");
            ctx = ctx.with_audio_store(store);
        }

        info!(
            model = ctx.inference.model_id(),
            workers = ctx.pool.size(),
            inference_concurrency = ctx.settings.inference_concurrency,
            speech_concurrency = ctx.settings.speech_concurrency,
            "Pipeline ready"
        );
        Ok(ctx)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn model_id(&self) -> &str {
        self.inference.model_id()
    }

    pub fn model_loaded(&self) -> bool {
        self.inference.is_loaded()
    }

    pub fn capture_available(&self) -> bool {
        self.camera.is_available()
    }

    pub fn camera_device(&self) -> Option<String> {
        self.camera.describe()
    }

    /// Width and height of the last captured frame.
    pub fn camera_dimensions(&self) -> Option<(u32, u32)> {
        self.camera.last_dimensions()
    }

    pub fn speech_ready(&self) -> bool {
        self.speech.is_ready()
    }

    pub fn audio_store(&self) -> Option<&AudioStore> {
        self.audio_store.as_deref()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Grab the current camera frame on a worker.
    pub async fn capture(&self) -> std::result::Result<Frame, CaptureFailure> {
        let camera = self.camera.clone();
        self.pool
            .run(move || camera.capture())
            .await
            .unwrap_or_else(|e| Err(CaptureFailure::ReadFailed(e.to_string())))
    }

    /// Run one model call on a worker, holding an inference slot for as
    /// long as the call runs, even if the caller stops waiting.
    pub async fn infer(
        &self,
        prompt: String,
        image: Option<Frame>,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> InferenceResult {
        let Ok(slot) = self.inference_slots.clone().acquire_owned().await else {
            return InferenceResult::failed("pipeline is shut down");
        };
        let gateway = self.inference.clone();
        self.pool
            .run(move || {
                let _slot = slot;
                gateway.infer(&prompt, image.as_ref(), max_tokens, &cancel)
            })
            .await
            .unwrap_or_else(|e| InferenceResult::failed(e.to_string()))
    }

    /// Synthesize speech on a worker, holding a speech slot for the call.
    pub async fn synthesize(
        &self,
        text: String,
        voice: String,
        cancel: CancellationToken,
    ) -> AudioArtifact {
        let Ok(slot) = self.speech_slots.clone().acquire_owned().await else {
            return AudioArtifact::failed("pipeline is shut down");
        };
        let gateway = self.speech.clone();
        self.pool
            .run(move || {
                let _slot = slot;
                gateway.synthesize(&text, &voice, &cancel)
            })
            .await
            .unwrap_or_else(|e| AudioArtifact::failed(e.to_string()))
    }

    /// Write a finished artifact to the publish directory.
    ///
    /// Returns the file name once the file is complete, `None` when
    /// publishing is disabled or failed.
    pub async fn publish_audio(&self, artifact: &AudioArtifact) -> Option<String> {
        let store = self.audio_store.clone()?;
        let artifact = artifact.clone();
        match self.pool.run(move || store.publish(&artifact)).await {
            Ok(Ok(name)) => Some(name),
            Ok(Err(e)) => {
                warn!(%e, "Failed to publish audio");
                None
            }
            Err(e) => {
                warn!(%e, "Audio publish job failed");
                None
            }
        }
    }

    pub async fn dispatch_action(&self, action: &str) -> DispatchReport {
        match &self.robot {
            Some(robot) => robot.dispatch(action).await,
            None => DispatchReport::failed("robot not configured"),
        }
    }

    /// Drain in-flight work, close the gateways and release the camera.
    /// Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down pipeline");
        self.inference_slots.close();
        self.speech_slots.close();
        self.pool.shutdown().await;
        self.camera.shutdown();
        info!("Pipeline stopped");
    }
}
