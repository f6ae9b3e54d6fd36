//! Block scan over whole frames.
//!
//! Collects a contiguous run of published, non-padding frames up to a
//! byte limit so the run can be handed off as one block (replication,
//! archival). A padding frame terminates the run; if padding is the
//! first thing seen, the padding itself is the block. Padding may extend
//! past the limit because only its header needs to be valid.

use crate::frame;
use crate::region::Region;

/// Scan `term` from `term_offset` for a block of whole frames ending at
/// or before `limit_offset`. Returns the offset one past the block.
pub fn scan(term: Region, term_offset: i32, limit_offset: i32) -> i32 {
    let mut offset = term_offset;

    while offset < limit_offset {
        let length = frame::frame_length_volatile(&term, offset);
        if length <= 0 {
            break;
        }

        let aligned_length = frame::align_frame_length(length);

        if frame::is_padding_frame(&term, offset) {
            if offset == term_offset {
                offset += aligned_length;
            }
            break;
        }

        if offset + aligned_length > limit_offset {
            break;
        }

        offset += aligned_length;
    }

    offset
}
