//! Term scan delivering fragments to a callback.
//!
//! Reads whole, published, non-padding frames from one term starting at
//! an offset, up to a fragment limit. The scan stops at the first
//! unpublished frame (non-positive length word) or at term capacity.
//! Padding frames advance the cursor without a callback and without
//! counting against the limit.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::ErrorHandler;
use crate::frame::{self, HEADER_LENGTH};
use crate::header::Header;
use crate::region::Region;

/// Where a scan ended and how many fragments it delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Term offset one past the last consumed frame.
    pub offset: i32,
    /// Number of fragments delivered to the callback.
    pub fragments_read: usize,
}

/// Scan `term` from `term_offset`, delivering at most `fragment_limit`
/// fragments to `handler`.
///
/// A panic unwinding out of `handler` is caught and routed to
/// `error_handler`; the scan stops there, with the failing frame's
/// aligned length already consumed, so the resulting offset moves past
/// the fragment that failed.
pub fn read<F>(
    term: Region,
    term_offset: i32,
    handler: &mut F,
    fragment_limit: usize,
    header: &mut Header,
    error_handler: &ErrorHandler,
) -> ReadOutcome
where
    F: FnMut(&[u8], &Header),
{
    let capacity = term.len() as i32;
    let mut outcome = ReadOutcome {
        offset: term_offset,
        fragments_read: 0,
    };

    let caught = catch_unwind(AssertUnwindSafe(|| {
        while outcome.fragments_read < fragment_limit && outcome.offset < capacity {
            let length = frame::frame_length_volatile(&term, outcome.offset);
            if length <= 0 {
                break;
            }

            let frame_offset = outcome.offset;
            outcome.offset += frame::align_frame_length(length);

            if frame::is_padding_frame(&term, frame_offset) {
                continue;
            }

            header.set_offset(frame_offset);
            let payload = term.bytes(
                (frame_offset + HEADER_LENGTH) as usize,
                (length - HEADER_LENGTH) as usize,
            );
            handler(payload, header);
            outcome.fragments_read += 1;
        }
    }));

    if let Err(payload) = caught {
        debug!(
            message = crate::error::panic_message(payload.as_ref()),
            "fragment handler panicked"
        );
        error_handler(payload.as_ref());
    }

    outcome
}
