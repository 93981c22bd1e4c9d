//! Stub backends for exercising the pipeline without a camera or models.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use vistalk_core::config::InferenceConfig;
use vistalk_core::types::Frame;
use vistalk_media::{FrameDevice, FrameSource, SpeechEngine, SpeechGateway};
use vistalk_providers::{InferenceGateway, VisionModel, VisionRequest};

use crate::context::{PipelineContext, PipelineSettings};

/// Tracks calls and the peak number running at once.
#[derive(Debug, Default)]
pub struct CallCounter {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl CallCounter {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct StubCamera {
    present: bool,
    fail: bool,
    pub reads: AtomicUsize,
}

impl StubCamera {
    /// Yields 8x8 black frames.
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            present: true,
            fail: false,
            reads: AtomicUsize::new(0),
        })
    }

    /// A device that is present but every read fails.
    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            present: true,
            fail: true,
            reads: AtomicUsize::new(0),
        })
    }

    /// No device at all.
    pub fn absent() -> Arc<Self> {
        Arc::new(Self {
            present: false,
            fail: true,
            reads: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn source(self: &Arc<Self>) -> FrameSource {
        let device = self
            .present
            .then(|| self.clone() as Arc<dyn FrameDevice>);
        FrameSource::new(device, 2)
    }
}

impl FrameDevice for StubCamera {
    fn describe(&self) -> String {
        "stub".into()
    }

    fn read_frame(&self) -> anyhow::Result<Frame> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("stub camera failure");
        }
        Ok(Frame::new(image::RgbImage::new(8, 8)))
    }
}

pub struct StubVision {
    reply: Result<String, String>,
    delay: Duration,
    pub counter: CallCounter,
    prompts: Mutex<Vec<(String, bool)>>,
}

impl StubVision {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self::new(Ok(text.to_string()), Duration::ZERO))
    }

    pub fn failing(detail: &str) -> Arc<Self> {
        Arc::new(Self::new(Err(detail.to_string()), Duration::ZERO))
    }

    /// Replies after blocking for `delay`.
    pub fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self::new(Ok(text.to_string()), delay))
    }

    fn new(reply: Result<String, String>, delay: Duration) -> Self {
        Self {
            reply,
            delay,
            counter: CallCounter::default(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.counter.calls()
    }

    /// Prompts seen so far, each with whether an image was attached.
    pub fn prompts(&self) -> Vec<(String, bool)> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn gateway(self: &Arc<Self>, allowed_actions: &[String]) -> InferenceGateway {
        InferenceGateway::new(self.clone(), &InferenceConfig::default(), allowed_actions)
    }
}

impl VisionModel for StubVision {
    fn id(&self) -> &str {
        "stub-vlm"
    }

    fn is_loaded(&self) -> bool {
        true
    }

    fn generate(
        &self,
        request: &VisionRequest<'_>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        self.counter.enter();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((request.prompt.clone(), request.image.is_some()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.counter.exit();

        if cancel.is_cancelled() {
            anyhow::bail!("inference cancelled");
        }
        self.reply.clone().map_err(|e| anyhow::anyhow!(e))
    }
}

pub struct StubSpeech {
    seconds: Option<f64>,
    delay: Duration,
    pub counter: CallCounter,
}

impl StubSpeech {
    /// Renders `seconds` of silence.
    pub fn seconds(seconds: f64) -> Arc<Self> {
        Arc::new(Self {
            seconds: Some(seconds),
            delay: Duration::ZERO,
            counter: CallCounter::default(),
        })
    }

    pub fn slow(seconds: f64, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            seconds: Some(seconds),
            delay,
            counter: CallCounter::default(),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            seconds: None,
            delay: Duration::ZERO,
            counter: CallCounter::default(),
        })
    }

    pub fn calls(&self) -> usize {
        self.counter.calls()
    }

    pub fn gateway(self: &Arc<Self>) -> SpeechGateway {
        SpeechGateway::new(Some(self.clone() as Arc<dyn SpeechEngine>), None)
    }
}

impl SpeechEngine for StubSpeech {
    fn id(&self) -> &str {
        "stub-tts"
    }

    fn render(
        &self,
        _text: &str,
        _voice: &str,
        output: &Path,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.counter.enter();
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let result = match self.seconds {
            Some(seconds) => write_silence(output, seconds),
            None => Err(anyhow::anyhow!("stub speech engine failure")),
        };
        self.counter.exit();
        result
    }
}

/// 16-bit mono silence at 10 kHz.
fn write_silence(path: &Path, seconds: f64) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 10_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for _ in 0..(seconds * 10_000.0).round() as usize {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Settings for tests: no token cadence, serialized gateways.
pub fn stub_settings() -> PipelineSettings {
    PipelineSettings {
        token_delay: Duration::ZERO,
        allowed_actions: vec!["pass_screwdriver".into()],
        ..PipelineSettings::default()
    }
}

pub fn stub_context(
    camera: Arc<StubCamera>,
    vision: Arc<StubVision>,
    speech: Arc<StubSpeech>,
) -> PipelineContext {
    stub_context_with(stub_settings(), camera, vision, speech)
}

pub fn stub_context_with(
    settings: PipelineSettings,
    camera: Arc<StubCamera>,
    vision: Arc<StubVision>,
    speech: Arc<StubSpeech>,
) -> PipelineContext {
    let inference = vision.gateway(&settings.allowed_actions);
    PipelineContext::new(camera.source(), inference, speech.gateway(), settings)
}
