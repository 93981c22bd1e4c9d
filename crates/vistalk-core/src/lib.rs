//! Core types, config, errors, and the event wire protocol for vistalk.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ErrorKind, Result, VistalkError};
pub use protocol::{StreamEvent, WireFormat};
