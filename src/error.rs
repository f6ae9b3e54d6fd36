//! Error types and the handler-failure channel.
//!
//! A failing user callback must not stop the stream: panics raised inside
//! fragment and block handlers are caught around the scan loop and routed
//! to the image's [`ErrorHandler`], and the scan's progress up to the
//! failing frame is still published. Position errors, by contrast, are
//! programmer errors surfaced to the caller as `Result`s.

use std::any::Any;
use std::sync::Arc;

use crate::frame::FRAME_ALIGNMENT;

/// Invoked with the payload of a panic caught from a user callback.
pub type ErrorHandler = Arc<dyn Fn(&(dyn Any + Send)) + Send + Sync>;

/// An error handler that ignores callback failures.
pub fn ignore_handler_errors() -> ErrorHandler {
    Arc::new(|_| {})
}

/// Best-effort description of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "callback panicked"
    }
}

/// Errors from setting or peeking at an explicit stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionError {
    /// The position is behind the current position or beyond the end of
    /// the current term.
    OutOfRange {
        new_position: i64,
        current: i64,
        limit: i64,
    },
    /// The position is not frame-aligned.
    Unaligned { new_position: i64 },
}

impl std::fmt::Display for PositionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfRange {
                new_position,
                current,
                limit,
            } => write!(
                f,
                "position {new_position} out of range [{current}, {limit}]"
            ),
            Self::Unaligned { new_position } => write!(
                f,
                "position {new_position} not aligned to {FRAME_ALIGNMENT} bytes"
            ),
        }
    }
}

impl std::error::Error for PositionError {}
