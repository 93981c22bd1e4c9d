//! Request pipeline: capture, inference, sanitizing, speech, and the
//! ordered event stream that ties them together.
//!
//! The gateway builds one [`PipelineContext`] at startup and calls
//! [`run_pipeline`] once per request with the sending half of a channel;
//! the receiving half feeds the response body.

pub mod action;
pub mod context;
pub mod orchestrator;
pub mod pool;
pub mod sanitize;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use action::{ActionDispatcher, DispatchReport, HttpRobot, extract_action};
pub use context::{PipelineContext, PipelineSettings};
pub use orchestrator::{
    ActionOutcome, ChatOutcome, RunOutcome, RunSummary, Stage, run_pipeline, run_to_completion,
};
pub use pool::WorkerPool;
pub use sanitize::{CleanText, clean};
