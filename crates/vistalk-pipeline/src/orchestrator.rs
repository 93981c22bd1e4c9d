//! Request orchestration.
//!
//! One call to [`run_pipeline`] turns a [`ChatRequest`] into an ordered
//! sequence of [`StreamEvent`]s:
//!
//! ```text
//! text-delta* text-complete action? (audio-chunk | audio-error)? done
//! ```
//!
//! or, when capture or inference fails, a single terminal `error`. Exactly
//! one terminal event is sent and nothing follows it. If the receiver goes
//! away the run stops at the next suspension point, cancels the in-flight
//! backend call, and discards its result.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vistalk_core::protocol::AudioChunk;
use vistalk_core::types::{ChatRequest, ImageInput};
use vistalk_core::{ErrorKind, StreamEvent, VistalkError};

use crate::action::extract_action;
use crate::context::PipelineContext;
use crate::sanitize::clean;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Capturing,
    Inferring,
    Sanitizing,
    Emitting,
    Synthesizing,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Capturing => "capturing",
            Self::Inferring => "inferring",
            Self::Sanitizing => "sanitizing",
            Self::Emitting => "emitting",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Failed(ErrorKind),
    /// The receiver closed before a terminal event was delivered.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// Time spent in each stage, in the order visited.
    pub stage_timings: Vec<(Stage, Duration)>,
    pub events_sent: usize,
}

enum Halt {
    Disconnected,
    Failed(ErrorKind),
}

struct Run<'a> {
    events: &'a mpsc::Sender<StreamEvent>,
    cancel: &'a CancellationToken,
    stage: Stage,
    stage_started: Instant,
    timings: Vec<(Stage, Duration)>,
    sent: usize,
}

impl<'a> Run<'a> {
    fn new(events: &'a mpsc::Sender<StreamEvent>, cancel: &'a CancellationToken) -> Self {
        Self {
            events,
            cancel,
            stage: Stage::Start,
            stage_started: Instant::now(),
            timings: Vec::new(),
            sent: 0,
        }
    }

    fn enter(&mut self, next: Stage) {
        let spent = self.stage_started.elapsed();
        self.timings.push((self.stage, spent));
        debug!(
            from = self.stage.as_str(),
            to = next.as_str(),
            elapsed_ms = spent.as_millis() as u64,
            "Pipeline stage"
        );
        self.stage = next;
        self.stage_started = Instant::now();
    }

    /// Await `work`, abandoning it if the receiver closes or the run is
    /// cancelled first.
    async fn guard<F: Future>(&self, work: F) -> Result<F::Output, Halt> {
        tokio::select! {
            biased;
            _ = self.events.closed() => {
                self.cancel.cancel();
                Err(Halt::Disconnected)
            }
            _ = self.cancel.cancelled() => Err(Halt::Disconnected),
            out = work => Ok(out),
        }
    }

    /// Close out the timing of the final stage.
    fn finish(&mut self) {
        self.timings.push((self.stage, self.stage_started.elapsed()));
    }

    async fn emit(&mut self, event: StreamEvent) -> Result<(), Halt> {
        let kind = event.kind();
        if self.cancel.is_cancelled() {
            return Err(Halt::Disconnected);
        }
        self.events.send(event).await.map_err(|_| {
            self.cancel.cancel();
            Halt::Disconnected
        })?;
        self.sent += 1;
        debug!(event = kind, "Event emitted");
        Ok(())
    }

    async fn fail(&mut self, kind: ErrorKind, message: String) -> Halt {
        warn!(kind = kind.as_str(), error = %message, "Request failed");
        self.enter(Stage::Error);
        match self.emit(StreamEvent::error(kind, message)).await {
            Ok(()) => Halt::Failed(kind),
            Err(halt) => halt,
        }
    }
}

/// Run one request through the pipeline, sending events to `events`.
///
/// `cancel` aborts the run from outside; it is also cancelled by the run
/// itself when the receiver closes.
pub async fn run_pipeline(
    ctx: &PipelineContext,
    request: ChatRequest,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> RunSummary {
    let start = Instant::now();
    let grounded = request.image.is_grounded();
    info!(
        prompt_len = request.prompt.len(),
        grounded,
        tts = request.enable_tts,
        max_tokens = request.max_tokens,
        "Chat request"
    );

    let mut run = Run::new(&events, &cancel);
    let result = drive(ctx, request, &mut run).await;

    let outcome = match result {
        Ok(()) => RunOutcome::Done,
        Err(Halt::Failed(kind)) => RunOutcome::Failed(kind),
        Err(Halt::Disconnected) => {
            info!(stage = run.stage.as_str(), "Client disconnected; abandoning request");
            RunOutcome::Disconnected
        }
    };
    run.finish();

    debug!(
        ?outcome,
        events = run.sent,
        duration_secs = start.elapsed().as_secs_f64(),
        "Chat request finished"
    );
    RunSummary {
        outcome,
        stage_timings: run.timings.into_iter().skip(1).collect(),
        events_sent: run.sent,
    }
}

async fn drive(ctx: &PipelineContext, request: ChatRequest, run: &mut Run<'_>) -> Result<(), Halt> {
    let ChatRequest {
        prompt,
        max_tokens,
        enable_tts,
        voice,
        image,
    } = request;

    run.enter(Stage::Capturing);
    let frame = match image {
        ImageInput::Camera => match run.guard(ctx.capture()).await? {
            Ok(frame) => Some(frame),
            Err(failure) => {
                return Err(run
                    .fail(ErrorKind::Capture, format!("Failed to capture webcam frame: {failure}"))
                    .await);
            }
        },
        ImageInput::Attached(frame) => Some(frame),
        ImageInput::Omitted => None,
    };

    run.enter(Stage::Inferring);
    let result = run
        .guard(ctx.infer(prompt, frame, max_tokens, run.cancel.child_token()))
        .await?;
    if !result.succeeded {
        let detail = result
            .error_detail
            .unwrap_or_else(|| "model call failed".to_string());
        return Err(run
            .fail(ErrorKind::Inference, format!("Inference failed: {detail}"))
            .await);
    }
    let action = extract_action(&result.raw_text, &ctx.settings().allowed_actions);

    run.enter(Stage::Sanitizing);
    let text = clean(&result.raw_text);
    let delay = ctx.settings().token_delay;
    for delta in text.deltas() {
        run.emit(StreamEvent::TextDelta { delta }).await?;
        if !delay.is_zero() {
            run.guard(tokio::time::sleep(delay)).await?;
        }
    }

    run.enter(Stage::Emitting);
    run.emit(StreamEvent::TextComplete {
        text: text.to_string(),
    })
    .await?;

    if let Some(name) = action {
        let report = run.guard(ctx.dispatch_action(&name)).await?;
        run.emit(StreamEvent::Action {
            name,
            dispatched: report.dispatched,
            error: report.error,
        })
        .await?;
    }

    if enable_tts && !text.is_empty() {
        run.enter(Stage::Synthesizing);
        let artifact = run
            .guard(ctx.synthesize(text.to_string(), voice.clone(), run.cancel.child_token()))
            .await?;

        run.enter(Stage::Emitting);
        if artifact.succeeded {
            let mut chunk = AudioChunk::from_artifact(&artifact, text.as_str(), &voice);
            chunk.audio_url = run
                .guard(ctx.publish_audio(&artifact))
                .await?
                .map(|name| format!("/api/chat/audio/{name}"));
            run.emit(StreamEvent::AudioChunk(chunk)).await?;
        } else {
            let error = artifact
                .error_detail
                .unwrap_or_else(|| "speech synthesis failed".to_string());
            warn!(%error, "Speech synthesis failed; delivering text only");
            run.emit(StreamEvent::AudioError { error }).await?;
        }
    }

    run.enter(Stage::Done);
    run.emit(StreamEvent::Done {
        full_text: text.into_inner(),
    })
    .await
}

/// Result of an action directive, as reported by the non-streaming calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub name: String,
    pub dispatched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A whole request folded into one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatOutcome {
    pub ai_response: String,
    pub prompt: String,
    pub has_webcam: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioChunk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionOutcome>,
}

/// Run a request and fold its events into a [`ChatOutcome`].
///
/// A terminal `error` event becomes the matching [`VistalkError`].
pub async fn run_to_completion(
    ctx: &PipelineContext,
    request: ChatRequest,
) -> vistalk_core::Result<ChatOutcome> {
    let outcome = ChatOutcome {
        ai_response: String::new(),
        prompt: request.prompt.clone(),
        has_webcam: matches!(request.image, ImageInput::Camera),
        audio: None,
        audio_error: None,
        action: None,
    };

    let (tx, mut rx) = mpsc::channel(ctx.settings().channel_capacity);
    let cancel = CancellationToken::new();
    let collect = async move {
        let mut outcome = outcome;
        let mut failure = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::TextComplete { text } => outcome.ai_response = text,
                StreamEvent::AudioChunk(chunk) => outcome.audio = Some(chunk),
                StreamEvent::AudioError { error } => outcome.audio_error = Some(error),
                StreamEvent::Action {
                    name,
                    dispatched,
                    error,
                } => {
                    outcome.action = Some(ActionOutcome {
                        name,
                        dispatched,
                        error,
                    })
                }
                StreamEvent::Error { kind, error } => {
                    failure = Some(VistalkError::from_kind(kind, error))
                }
                StreamEvent::TextDelta { .. } | StreamEvent::Done { .. } => {}
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    };

    let (_, outcome) = tokio::join!(run_pipeline(ctx, request, tx, cancel), collect);
    outcome
}
