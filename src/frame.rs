//! Frame header layout and volatile accessors.
//!
//! Every record in a term begins with this fixed 32-byte header. The
//! `frame_length` word doubles as the publication barrier between the
//! producer process and this reader: the producer writes the header and
//! payload first, then stores the length with release semantics, so an
//! acquire load observing a positive length proves the whole frame is
//! visible. A non-positive length means "not yet written" and stops a
//! scan without error.
//!
//! All values are native-endian (little-endian on all supported platforms).

use core::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::region::Region;

/// Alignment of every frame in a term, in bytes.
pub const FRAME_ALIGNMENT: i32 = 32;

/// Length of the fixed frame header, in bytes.
pub const HEADER_LENGTH: i32 = 32;

/// Frame type word for end-of-term padding.
pub const FRAME_TYPE_PAD: u16 = 0x00;

/// Frame type word for data frames.
pub const FRAME_TYPE_DATA: u16 = 0x01;

pub const LENGTH_FIELD_OFFSET: usize = 0;
pub const VERSION_FIELD_OFFSET: usize = 4;
pub const FLAGS_FIELD_OFFSET: usize = 5;
pub const TYPE_FIELD_OFFSET: usize = 6;
pub const TERM_OFFSET_FIELD_OFFSET: usize = 8;
pub const SESSION_ID_FIELD_OFFSET: usize = 12;
pub const STREAM_ID_FIELD_OFFSET: usize = 16;
pub const TERM_ID_FIELD_OFFSET: usize = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: usize = 24;

/// The fixed header that begins every frame in a term.
#[repr(C)]
pub struct FrameHeader {
    /// Total frame length in bytes, header included. Written last by the
    /// producer (release); read first by scanners (acquire).
    pub frame_length: i32,
    /// Protocol version of the frame.
    pub version: u8,
    /// Fragmentation flags, see [`FrameFlags`].
    pub flags: u8,
    /// Frame type: [`FRAME_TYPE_DATA`] or [`FRAME_TYPE_PAD`].
    pub frame_type: u16,
    /// Offset of this frame within its term.
    pub term_offset: i32,
    /// Session of the originating publisher.
    pub session_id: i32,
    /// Stream within the session.
    pub stream_id: i32,
    /// Term this frame was written into.
    pub term_id: i32,
    /// Application-reserved value.
    pub reserved_value: i64,
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == HEADER_LENGTH as usize);

bitflags! {
    /// Fragmentation flags carried in each frame header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// First fragment of a message.
        const BEGIN_FRAGMENT = 0b1000_0000;
        /// Last fragment of a message.
        const END_FRAGMENT   = 0b0100_0000;
        /// A message that fits in a single fragment.
        const UNFRAGMENTED   = Self::BEGIN_FRAGMENT.bits() | Self::END_FRAGMENT.bits();
    }
}

/// Pad a frame length out to [`FRAME_ALIGNMENT`].
#[inline]
pub const fn align_frame_length(length: i32) -> i32 {
    (length + (FRAME_ALIGNMENT - 1)) & !(FRAME_ALIGNMENT - 1)
}

/// Acquire-load the length word of the frame at `frame_offset`.
///
/// A positive result means the whole frame (header and payload) is
/// published and may be read plainly.
#[inline]
pub fn frame_length_volatile(term: &Region, frame_offset: i32) -> i32 {
    term.atomic_i32(frame_offset as usize + LENGTH_FIELD_OFFSET)
        .load(Ordering::Acquire)
}

/// Read the type word of the frame at `frame_offset`.
#[inline]
pub fn frame_type(term: &Region, frame_offset: i32) -> u16 {
    term.get_u16(frame_offset as usize + TYPE_FIELD_OFFSET)
}

/// Is the frame at `frame_offset` end-of-term padding?
#[inline]
pub fn is_padding_frame(term: &Region, frame_offset: i32) -> bool {
    frame_type(term, frame_offset) == FRAME_TYPE_PAD
}

/// Read the version byte of the frame at `frame_offset`.
#[inline]
pub fn frame_version(term: &Region, frame_offset: i32) -> u8 {
    term.get_u8(frame_offset as usize + VERSION_FIELD_OFFSET)
}

/// Read the flags byte of the frame at `frame_offset`.
#[inline]
pub fn frame_flags(term: &Region, frame_offset: i32) -> FrameFlags {
    FrameFlags::from_bits_retain(term.get_u8(frame_offset as usize + FLAGS_FIELD_OFFSET))
}

/// Read the term offset field of the frame at `frame_offset`.
#[inline]
pub fn frame_term_offset(term: &Region, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset as usize + TERM_OFFSET_FIELD_OFFSET)
}

/// Read the session id of the frame at `frame_offset`.
#[inline]
pub fn frame_session_id(term: &Region, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset as usize + SESSION_ID_FIELD_OFFSET)
}

/// Read the stream id of the frame at `frame_offset`.
#[inline]
pub fn frame_stream_id(term: &Region, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset as usize + STREAM_ID_FIELD_OFFSET)
}

/// Read the term id of the frame at `frame_offset`.
#[inline]
pub fn frame_term_id(term: &Region, frame_offset: i32) -> i32 {
    term.get_i32(frame_offset as usize + TERM_ID_FIELD_OFFSET)
}

/// Read the reserved value of the frame at `frame_offset`.
#[inline]
pub fn frame_reserved_value(term: &Region, frame_offset: i32) -> i64 {
    term.get_i64(frame_offset as usize + RESERVED_VALUE_FIELD_OFFSET)
}
