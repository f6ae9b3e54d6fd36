//! Log layout: metadata section and term geometry.
//!
//! A log is made of [`PARTITION_COUNT`] equally-sized term buffers used
//! cyclically, plus one metadata section. The geometry functions map a
//! 64-bit stream position onto (term index, term offset) pairs; they are
//! pure and branch-free so they can sit on the poll hot path.

use core::mem::size_of;
use core::sync::atomic::AtomicI64;

use crate::frame::FRAME_ALIGNMENT;

/// Number of term partitions in a log.
pub const PARTITION_COUNT: usize = 3;

/// Magic bytes identifying a log metadata section.
pub const LOG_MAGIC: [u8; 8] = *b"MILLLOG\0";

/// Current log metadata format version.
pub const LOG_VERSION: u32 = 1;

/// Size of [`LogMetadata`] in bytes.
pub const LOG_METADATA_SIZE: usize = 64;

/// Smallest supported term length.
pub const TERM_MIN_LENGTH: usize = 1024;

/// Largest supported term length.
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Metadata section of a log (64 bytes).
///
/// Written by the media driver; this crate only reads it. The
/// `end_of_stream_position` word is the one field that changes while the
/// log is live, so it is atomic and read with acquire semantics.
#[repr(C)]
pub struct LogMetadata {
    /// Magic bytes: "MILLLOG\0".
    pub magic: [u8; 8],
    /// Metadata format version.
    pub version: u32,
    /// Length of each term buffer (power of 2).
    pub term_length: u32,
    /// Term id the stream started at.
    pub initial_term_id: i32,
    /// Reserved (zero).
    pub _pad: [u8; 12],
    /// Position beyond which no more frames will be produced.
    /// `i64::MAX` while the stream is live.
    pub end_of_stream_position: AtomicI64,
    /// Reserved for future use (zero).
    pub reserved: [u8; 24],
}

const _: () = assert!(size_of::<LogMetadata>() == LOG_METADATA_SIZE);

impl LogMetadata {
    /// Initialize a fresh metadata section.
    pub fn init(&mut self, term_length: u32, initial_term_id: i32) {
        self.magic = LOG_MAGIC;
        self.version = LOG_VERSION;
        self.term_length = term_length;
        self.initial_term_id = initial_term_id;
        self._pad = [0; 12];
        self.end_of_stream_position = AtomicI64::new(i64::MAX);
        self.reserved = [0; 24];
    }

    /// Validate the metadata section against the mapped term capacity.
    pub fn validate(&self, term_capacity: usize) -> Result<(), AttachError> {
        if self.magic != LOG_MAGIC {
            return Err(AttachError::InvalidMagic);
        }
        if self.version != LOG_VERSION {
            return Err(AttachError::IncompatibleVersion {
                expected: LOG_VERSION,
                found: self.version,
            });
        }
        check_term_length(term_capacity)?;
        if self.term_length as usize != term_capacity {
            return Err(AttachError::TermLengthMismatch {
                metadata: self.term_length,
                mapped: term_capacity,
            });
        }
        Ok(())
    }
}

/// Validate a term length: power of two within the supported range.
pub fn check_term_length(term_length: usize) -> Result<(), AttachError> {
    if !term_length.is_power_of_two()
        || term_length < TERM_MIN_LENGTH
        || term_length > TERM_MAX_LENGTH
    {
        return Err(AttachError::InvalidTermLength(term_length));
    }
    Ok(())
}

/// Number of bits to shift a position right to get a term count.
#[inline]
pub fn position_bits_to_shift(term_length: i32) -> u32 {
    term_length.trailing_zeros()
}

/// Term partition index active at `position`.
///
/// Positions are zero-based at the initial term, so the index is just the
/// term count modulo the partition count.
#[inline]
pub fn index_by_position(position: i64, position_bits_to_shift: u32) -> usize {
    ((position >> position_bits_to_shift) % PARTITION_COUNT as i64) as usize
}

/// Stream position at which `term_id` begins.
#[inline]
pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    ((term_id as i64) - (initial_term_id as i64)) << position_bits_to_shift
}

/// Stream position of `term_offset` within `term_id`.
#[inline]
pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_term_begin_position(term_id, position_bits_to_shift, initial_term_id)
        + term_offset as i64
}

/// Is `position` aligned to a frame boundary?
#[inline]
pub fn is_frame_aligned(position: i64) -> bool {
    position & (FRAME_ALIGNMENT as i64 - 1) == 0
}

/// Errors from validating a log on attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// Magic bytes did not match.
    InvalidMagic,
    /// Metadata format version is not supported.
    IncompatibleVersion { expected: u32, found: u32 },
    /// Term length is not a power of two in the supported range.
    InvalidTermLength(usize),
    /// Metadata term length disagrees with the mapped buffers.
    TermLengthMismatch { metadata: u32, mapped: usize },
    /// Term partitions have differing capacities.
    UnevenTermLengths,
    /// Metadata section is too small.
    MetadataTooSmall { required: usize, found: usize },
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid log magic bytes (expected MILLLOG)"),
            Self::IncompatibleVersion { expected, found } => {
                write!(f, "incompatible log version: expected {expected}, found {found}")
            }
            Self::InvalidTermLength(len) => {
                write!(
                    f,
                    "term length {len} must be a power of 2 in [{TERM_MIN_LENGTH}, {TERM_MAX_LENGTH}]"
                )
            }
            Self::TermLengthMismatch { metadata, mapped } => {
                write!(f, "metadata term length {metadata} != mapped capacity {mapped}")
            }
            Self::UnevenTermLengths => write!(f, "term partitions have differing capacities"),
            Self::MetadataTooSmall { required, found } => {
                write!(f, "metadata section too small: need {required} bytes, got {found}")
            }
        }
    }
}

impl std::error::Error for AttachError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_64_bytes() {
        assert_eq!(size_of::<LogMetadata>(), 64);
    }

    #[test]
    fn index_cycles_through_partitions() {
        let term_length = 64 * 1024i64;
        let bits = position_bits_to_shift(term_length as i32);

        assert_eq!(index_by_position(0, bits), 0);
        assert_eq!(index_by_position(term_length - 32, bits), 0);
        assert_eq!(index_by_position(term_length, bits), 1);
        assert_eq!(index_by_position(2 * term_length, bits), 2);
        assert_eq!(index_by_position(3 * term_length, bits), 0);
        assert_eq!(index_by_position(7 * term_length + 128, bits), 1);
    }

    #[test]
    fn term_begin_position_is_relative_to_initial_term() {
        let bits = position_bits_to_shift(64 * 1024);
        assert_eq!(compute_term_begin_position(7, bits, 7), 0);
        assert_eq!(compute_term_begin_position(8, bits, 7), 64 * 1024);
        assert_eq!(compute_term_begin_position(10, bits, 7), 3 * 64 * 1024);
    }

    #[test]
    fn compute_position_adds_term_offset() {
        let bits = position_bits_to_shift(64 * 1024);
        assert_eq!(compute_position(8, 96, bits, 7), 64 * 1024 + 96);
    }

    #[test]
    fn term_length_bounds_are_enforced() {
        assert!(check_term_length(1024).is_ok());
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(1024 * 1024).is_ok());
        assert!(check_term_length(64 * 1024 + 1).is_err());
        assert!(check_term_length(512).is_err());
        assert!(check_term_length(2 * 1024 * 1024 * 1024).is_err());
    }

    #[test]
    fn validate_rejects_bad_magic_and_version() {
        let mut meta = unsafe { core::mem::zeroed::<LogMetadata>() };
        meta.init(64 * 1024, 1);
        assert!(meta.validate(64 * 1024).is_ok());

        meta.version = 99;
        assert_eq!(
            meta.validate(64 * 1024),
            Err(AttachError::IncompatibleVersion {
                expected: LOG_VERSION,
                found: 99
            })
        );

        meta.version = LOG_VERSION;
        meta.magic = *b"NOTALOG\0";
        assert_eq!(meta.validate(64 * 1024), Err(AttachError::InvalidMagic));
    }
}
