//! Media plumbing: camera frames in, synthesized speech out.

pub mod audio_store;
pub mod camera;
pub mod speech;

pub use audio_store::{AudioStore, AudioStoreError, is_valid_name};
pub use camera::{CaptureFailure, FrameDevice, FrameSource};
pub use speech::{CommandSpeechEngine, SpeechEngine, SpeechGateway};
