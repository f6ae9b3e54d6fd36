//! Property tests for the geometry and publication invariants.

use proptest::prelude::*;
use std::sync::Arc;

use crate::error::ignore_handler_errors;
use crate::frame::{
    self, FRAME_ALIGNMENT, FRAME_TYPE_DATA, FrameFlags, HEADER_LENGTH, align_frame_length,
};
use crate::image::Image;
use crate::layout::{PARTITION_COUNT, index_by_position, position_bits_to_shift};
use crate::log_buffers::LogBuffers;
use crate::position::{COUNTER_LENGTH, SubscriberPosition};
use crate::region::{HeapRegion, Region};

const TERM_LENGTH: usize = 1024;

fn write_data_frame(term: &Region, offset: i32, length: i32) {
    let base = offset as usize;
    term.set_u8(base + frame::FLAGS_FIELD_OFFSET, FrameFlags::UNFRAGMENTED.bits());
    term.set_u16(base + frame::TYPE_FIELD_OFFSET, FRAME_TYPE_DATA);
    term.atomic_i32(base + frame::LENGTH_FIELD_OFFSET)
        .store(length, std::sync::atomic::Ordering::Release);
}

proptest! {
    #[test]
    fn term_index_is_always_in_range(
        position in 0i64..(i64::MAX / 2),
        term_length_exp in 10u32..28,
    ) {
        let bits = position_bits_to_shift(1 << term_length_exp);
        prop_assert!(index_by_position(position, bits) < PARTITION_COUNT);
    }

    #[test]
    fn aligned_length_is_aligned_and_sufficient(length in 1i32..(1 << 24)) {
        let aligned = align_frame_length(length);
        prop_assert_eq!(aligned % FRAME_ALIGNMENT, 0);
        prop_assert!(aligned >= length);
        prop_assert!(aligned - length < FRAME_ALIGNMENT);
    }

    // Fill one term with frames of arbitrary sizes, drain it with
    // arbitrary fragment limits, and check that every published position
    // is frame-aligned and monotonic.
    #[test]
    fn published_positions_are_aligned_and_monotonic(
        payload_lengths in prop::collection::vec(0i32..96, 1..12),
        fragment_limits in prop::collection::vec(1usize..4, 1..32),
    ) {
        let log = LogBuffers::allocate(TERM_LENGTH, 0);
        let term = log.term(0);

        let mut offset = 0i32;
        let mut frames_written = 0usize;
        for payload_length in payload_lengths {
            let frame_length = HEADER_LENGTH + payload_length;
            if offset + align_frame_length(frame_length) > TERM_LENGTH as i32 {
                break;
            }
            write_data_frame(&term, offset, frame_length);
            offset += align_frame_length(frame_length);
            frames_written += 1;
        }
        let end_of_data = offset as i64;

        let counters = HeapRegion::new_zeroed(COUNTER_LENGTH);
        let image = Image::new(
            1,
            1,
            1,
            "shm:stream",
            SubscriberPosition::attach(counters.region(), 0),
            Arc::clone(&log),
            ignore_handler_errors(),
        );

        let mut last_position = image.position();
        let mut fragments_seen = 0usize;
        for fragment_limit in fragment_limits {
            fragments_seen += image.poll(|_payload, _header| {}, fragment_limit);

            let position = image.position();
            prop_assert_eq!(position & (FRAME_ALIGNMENT as i64 - 1), 0);
            prop_assert!(position >= last_position);
            prop_assert!(position <= end_of_data);
            last_position = position;
        }
        prop_assert!(fragments_seen <= frames_written);
    }
}
