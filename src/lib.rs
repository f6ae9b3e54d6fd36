//! Subscriber-side read cursor for a shared-memory log-stream transport.
//!
//! A publisher process writes framed records into a mapped log made of
//! three fixed-size term partitions; a media driver advances metadata and
//! the end-of-stream mark; this crate is the third party: the [`Image`]
//! scans the log from the subscriber's current position, delivers
//! fragments to user callbacks, and publishes the consumed position
//! through a shared counter that flow control reads.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  frames   ┌──────────────────────┐
//! │ Publisher ├──────────►│ log: term 0 │ 1 │ 2  │
//! └───────────┘           │      + metadata      │◄── media driver
//!                         └──────────┬───────────┘    (end of stream)
//!                                    │ poll
//!                              ┌─────┴─────┐  position  ┌──────────┐
//!                              │   Image   ├───────────►│ counter  │
//!                              └───────────┘            └──────────┘
//! ```
//!
//! The three parties share memory without locks. Frame discovery
//! acquire-loads each frame's length word (the producer's release store
//! of a positive length publishes the whole frame); position publication
//! release-stores the subscriber counter so observers see it paired with
//! all prior handler effects.
//!
//! # Usage
//!
//! ```ignore
//! use millrace::{Image, LogBuffers, SubscriberPosition};
//!
//! let image = Image::new(
//!     session_id,
//!     correlation_id,
//!     registration_id,
//!     source_identity,
//!     SubscriberPosition::attach(counters, counter_id),
//!     log_buffers,
//!     error_handler,
//! );
//!
//! loop {
//!     let fragments = image.poll(|payload, header| {
//!         // payload is valid for the duration of the callback
//!     }, 10);
//!     if fragments == 0 {
//!         // idle strategy goes here
//!     }
//! }
//! ```

#[macro_use]
mod macros;

pub mod error;
pub mod frame;
pub mod header;
pub mod image;
pub mod layout;
pub mod log_buffers;
pub mod position;
pub mod reader;
pub mod region;
pub mod scanner;

pub use error::{ErrorHandler, PositionError, ignore_handler_errors, panic_message};
pub use frame::{FRAME_ALIGNMENT, FrameFlags, FrameHeader, HEADER_LENGTH};
pub use header::Header;
pub use image::{ControlledPollAction, Image};
pub use layout::{AttachError, LogMetadata, PARTITION_COUNT};
pub use log_buffers::LogBuffers;
pub use position::SubscriberPosition;
pub use region::{HeapRegion, Region};

#[cfg(test)]
mod proptests;
