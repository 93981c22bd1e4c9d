//! HTTP gateway for the vistalk pipeline.
//!
//! Streams chat events as SSE or NDJSON, exposes the non-streaming chat
//! variants, direct synthesis, published audio retrieval, camera
//! snapshots and a health probe. With the `metrics` feature it also serves `/metrics`.

pub mod audio;
pub mod chat;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;
pub mod video;

pub use error::ApiError;
pub use server::{build_router, start_gateway};
pub use state::GatewayState;
