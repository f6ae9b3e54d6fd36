//! Frame-cursor view handed to fragment callbacks.
//!
//! A [`Header`] describes "the frame currently being delivered": which
//! term buffer it sits in, its offset, and the cached log constants
//! needed to turn that into a stream position. The image keeps one on the
//! poller's stack per scan and re-points it at each frame, so callbacks
//! can inspect frame metadata without any per-fragment allocation. The
//! view is only meaningful for the duration of a callback.

use crate::frame::{self, FrameFlags};
use crate::layout::compute_term_begin_position;
use crate::region::Region;

/// Metadata view of the frame under the scan cursor.
pub struct Header {
    buffer: Region,
    offset: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
}

impl Header {
    pub(crate) fn new(initial_term_id: i32, position_bits_to_shift: u32, buffer: Region) -> Self {
        Self {
            buffer,
            offset: 0,
            initial_term_id,
            position_bits_to_shift,
        }
    }

    /// Point the view at the frame beginning at `offset`.
    #[inline]
    pub(crate) fn set_offset(&mut self, offset: i32) {
        self.offset = offset;
    }

    /// Offset of the current frame within its term.
    #[inline]
    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Term id the stream started at.
    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    /// Capacity of the term holding the current frame.
    #[inline]
    pub fn term_length(&self) -> i32 {
        self.buffer.len() as i32
    }

    /// Number of bits to shift a position right to get a term count.
    #[inline]
    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    /// Total length of the current frame, header included.
    #[inline]
    pub fn frame_length(&self) -> i32 {
        self.buffer.get_i32(self.offset as usize + frame::LENGTH_FIELD_OFFSET)
    }

    /// Protocol version of the current frame.
    #[inline]
    pub fn version(&self) -> u8 {
        frame::frame_version(&self.buffer, self.offset)
    }

    /// Fragmentation flags of the current frame.
    #[inline]
    pub fn flags(&self) -> FrameFlags {
        frame::frame_flags(&self.buffer, self.offset)
    }

    /// Type word of the current frame.
    #[inline]
    pub fn frame_type(&self) -> u16 {
        frame::frame_type(&self.buffer, self.offset)
    }

    /// Term offset recorded in the current frame's header.
    #[inline]
    pub fn term_offset(&self) -> i32 {
        frame::frame_term_offset(&self.buffer, self.offset)
    }

    /// Session id of the originating publisher.
    #[inline]
    pub fn session_id(&self) -> i32 {
        frame::frame_session_id(&self.buffer, self.offset)
    }

    /// Stream id within the session.
    #[inline]
    pub fn stream_id(&self) -> i32 {
        frame::frame_stream_id(&self.buffer, self.offset)
    }

    /// Term id the current frame was written into.
    #[inline]
    pub fn term_id(&self) -> i32 {
        frame::frame_term_id(&self.buffer, self.offset)
    }

    /// Application-reserved value of the current frame.
    #[inline]
    pub fn reserved_value(&self) -> i64 {
        frame::frame_reserved_value(&self.buffer, self.offset)
    }

    /// Stream position at the end of the current frame.
    ///
    /// This is the position a re-assembler may checkpoint after consuming
    /// the frame.
    #[inline]
    pub fn position(&self) -> i64 {
        let resulting_offset = frame::align_frame_length(self.offset + self.frame_length());
        compute_term_begin_position(
            self.term_id(),
            self.position_bits_to_shift,
            self.initial_term_id,
        ) + resulting_offset as i64
    }
}
