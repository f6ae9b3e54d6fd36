//! The subscriber-side image: a read cursor over one publisher's log.
//!
//! An [`Image`] scans the log from the subscriber's current position,
//! delivers fragments to user callbacks, and publishes the consumed
//! position through a shared counter. It synchronizes with the producer
//! and the media driver purely through memory ordering: frame discovery
//! acquire-loads the length word, position publication release-stores
//! the counter.
//!
//! Exactly one thread at a time may invoke the polling methods and
//! [`Image::set_position`]; any thread may concurrently call
//! [`Image::close`], [`Image::is_closed`], [`Image::position`], and
//! [`Image::is_end_of_stream`]. Violating the single-poller rule cannot
//! corrupt memory (every shared access is atomic), only double-deliver
//! fragments.

use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::error::{ErrorHandler, PositionError};
use crate::frame::{self, FrameFlags, HEADER_LENGTH};
use crate::header::Header;
use crate::layout::{self, PARTITION_COUNT};
use crate::log_buffers::LogBuffers;
use crate::position::SubscriberPosition;
use crate::reader;
use crate::region::Region;
use crate::scanner;

/// Directive returned by a controlled fragment handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlledPollAction {
    /// Abort the poll and do not advance the position for this fragment.
    Abort,
    /// Stop polling and keep the position advance through this fragment.
    Break,
    /// Keep polling, publishing the position at the end of this fragment
    /// immediately so flow control is applied to this point.
    Commit,
    /// Keep polling, deferring the position publish to the end of the
    /// poll.
    Continue,
}

/// A replicated publication image from one publisher to a subscription,
/// identified by session id.
pub struct Image {
    terms: [Region; PARTITION_COUNT],
    log_buffers: Arc<LogBuffers>,
    subscriber_position: SubscriberPosition,
    source_identity: String,
    error_handler: ErrorHandler,
    correlation_id: i64,
    subscription_registration_id: i64,
    join_position: i64,
    session_id: i32,
    initial_term_id: i32,
    term_length_mask: i32,
    position_bits_to_shift: u32,
    is_closed: AtomicBool,
    final_position: AtomicI64,
    is_eos: AtomicBool,
}

impl Image {
    /// Construct a new image over a log for a stream of messages.
    pub fn new(
        session_id: i32,
        correlation_id: i64,
        subscription_registration_id: i64,
        source_identity: impl Into<String>,
        subscriber_position: SubscriberPosition,
        log_buffers: Arc<LogBuffers>,
        error_handler: ErrorHandler,
    ) -> Self {
        let capacity = log_buffers.term_length() as i32;
        let terms = [
            log_buffers.term(0),
            log_buffers.term(1),
            log_buffers.term(2),
        ];
        let join_position = subscriber_position.get();

        Self {
            terms,
            initial_term_id: log_buffers.initial_term_id(),
            log_buffers,
            subscriber_position,
            source_identity: source_identity.into(),
            error_handler,
            correlation_id,
            subscription_registration_id,
            join_position,
            session_id,
            term_length_mask: capacity - 1,
            position_bits_to_shift: layout::position_bits_to_shift(capacity),
            is_closed: AtomicBool::new(false),
            final_position: AtomicI64::new(join_position),
            is_eos: AtomicBool::new(false),
        }
    }

    /// Length in bytes of each term partition.
    #[inline]
    pub fn term_buffer_length(&self) -> i32 {
        self.term_length_mask + 1
    }

    /// Number of bits to shift a position right to get a term count.
    #[inline]
    pub fn position_bits_to_shift(&self) -> u32 {
        self.position_bits_to_shift
    }

    /// Session id of the stream of messages.
    #[inline]
    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Correlation id identifying the image with the media driver.
    #[inline]
    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    /// Registration id of the owning subscription.
    #[inline]
    pub fn subscription_registration_id(&self) -> i64 {
        self.subscription_registration_id
    }

    /// Position at which this stream was joined.
    #[inline]
    pub fn join_position(&self) -> i64 {
        self.join_position
    }

    /// Term id at which the stream started.
    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    /// Source identity of the sending publisher.
    #[inline]
    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    /// Counter id backing the subscriber position.
    #[inline]
    pub fn subscriber_position_id(&self) -> i32 {
        self.subscriber_position.id()
    }

    /// The shared log this image reads from.
    #[inline]
    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    /// Has this image been closed?
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// Position this image has been consumed to, or the close-time
    /// snapshot if closed.
    pub fn position(&self) -> i64 {
        if self.is_closed() {
            return self.final_position.load(Ordering::Relaxed);
        }
        self.subscriber_position.get()
    }

    /// Move the consumption point to `new_position`, which must be
    /// frame-aligned and within `[position(), end of current term]`.
    ///
    /// A no-op on a closed image.
    pub fn set_position(&self, new_position: i64) -> Result<(), PositionError> {
        if !self.is_closed() {
            self.validate_position(new_position)?;
            self.subscriber_position.set_ordered(new_position);
        }
        Ok(())
    }

    /// Is the consumed position at the end of the stream?
    pub fn is_end_of_stream(&self) -> bool {
        if self.is_closed() {
            return self.is_eos.load(Ordering::Relaxed);
        }
        self.subscriber_position.get() >= self.log_buffers.end_of_stream_position()
    }

    /// Position the media driver marked as end-of-stream (`i64::MAX`
    /// while the stream is live).
    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.log_buffers.end_of_stream_position()
    }

    /// Poll for new fragments, delivering at most `fragment_limit` of
    /// them to `handler`. Returns the number of fragments consumed.
    ///
    /// Returns 0 without reading anything if the image is closed.
    pub fn poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &Header),
    {
        if self.is_closed() {
            return 0;
        }

        let position = self.subscriber_position.get();
        let term_offset = (position & self.term_length_mask as i64) as i32;
        let index = layout::index_by_position(position, self.position_bits_to_shift);
        debug_assert!(index < PARTITION_COUNT);
        let term = self.terms[index];
        let mut header = Header::new(self.initial_term_id, self.position_bits_to_shift, term);

        let outcome = reader::read(
            term,
            term_offset,
            &mut handler,
            fragment_limit,
            &mut header,
            &self.error_handler,
        );

        let new_position = position + (outcome.offset - term_offset) as i64;
        if new_position > position {
            trace!(position, new_position, "poll advanced");
            self.subscriber_position.set_ordered(new_position);
        }

        outcome.fragments_read
    }

    /// Poll for new fragments with per-fragment control over the
    /// position. Returns the number of fragments consumed.
    ///
    /// See [`ControlledPollAction`] for the protocol. Padding frames are
    /// skipped without a callback. Returns 0 if the image is closed.
    pub fn controlled_poll<F>(&self, mut handler: F, fragment_limit: usize) -> usize
    where
        F: FnMut(&[u8], &Header) -> ControlledPollAction,
    {
        if self.is_closed() {
            return 0;
        }

        let capacity = self.term_buffer_length();
        self.controlled_scan(&mut handler, fragment_limit, capacity)
    }

    /// Like [`Image::controlled_poll`], bounded above by `max_position`:
    /// no fragment whose end would exceed it is delivered.
    pub fn bounded_controlled_poll<F>(
        &self,
        mut handler: F,
        max_position: i64,
        fragment_limit: usize,
    ) -> usize
    where
        F: FnMut(&[u8], &Header) -> ControlledPollAction,
    {
        if self.is_closed() {
            return 0;
        }

        let capacity = self.term_buffer_length();
        let initial_position = self.subscriber_position.get();
        let initial_offset = (initial_position & self.term_length_mask as i64) as i32;
        let end_offset = (max_position - initial_position)
            .saturating_add(initial_offset as i64)
            .clamp(0, capacity as i64) as i32;

        self.controlled_scan(&mut handler, fragment_limit, end_offset)
    }

    /// Peek forward from `initial_position` without publishing to the
    /// subscriber position counter.
    ///
    /// `initial_position` must be frame-aligned and within
    /// `[position(), end of current term]`. The scan runs until
    /// `limit_position`, an unpublished frame, or a handler directive
    /// stops it. The returned position is always the end of a complete
    /// message: for data frames it only advances once a fragment with the
    /// end-of-message flag has been delivered, so a re-assembler can
    /// safely restart from it.
    pub fn controlled_peek<F>(
        &self,
        initial_position: i64,
        mut handler: F,
        limit_position: i64,
    ) -> Result<i64, PositionError>
    where
        F: FnMut(&[u8], &Header) -> ControlledPollAction,
    {
        let mut resulting_position = initial_position;

        if !self.is_closed() {
            self.validate_position(initial_position)?;

            let mut initial_offset = (initial_position & self.term_length_mask as i64) as i32;
            let mut offset = initial_offset;
            let mut position = initial_position;
            let index = layout::index_by_position(initial_position, self.position_bits_to_shift);
            debug_assert!(index < PARTITION_COUNT);
            let term = self.terms[index];
            let capacity = term.len() as i32;
            let mut header = Header::new(self.initial_term_id, self.position_bits_to_shift, term);

            let caught = catch_unwind(AssertUnwindSafe(|| {
                while position < limit_position && offset < capacity {
                    let length = frame::frame_length_volatile(&term, offset);
                    if length <= 0 {
                        break;
                    }

                    let frame_offset = offset;
                    offset += frame::align_frame_length(length);

                    if frame::is_padding_frame(&term, frame_offset) {
                        position += (offset - initial_offset) as i64;
                        initial_offset = offset;
                        resulting_position = position;
                        continue;
                    }

                    header.set_offset(frame_offset);
                    let payload = term.bytes(
                        (frame_offset + HEADER_LENGTH) as usize,
                        (length - HEADER_LENGTH) as usize,
                    );
                    let action = handler(payload, &header);

                    if action == ControlledPollAction::Abort {
                        break;
                    }

                    position += (offset - initial_offset) as i64;
                    initial_offset = offset;

                    if header.flags().contains(FrameFlags::END_FRAGMENT) {
                        resulting_position = position;
                    }

                    if action == ControlledPollAction::Break {
                        break;
                    }
                }
            }));

            if let Err(payload) = caught {
                debug!(
                    message = crate::error::panic_message(payload.as_ref()),
                    "fragment handler panicked"
                );
                (self.error_handler)(payload.as_ref());
            }
        }

        Ok(resulting_position)
    }

    /// Poll for a block of whole frames, delivered in one callback as
    /// `(block_bytes, session_id, term_id)`. Returns the number of bytes
    /// consumed.
    ///
    /// The block ends at `block_length_limit`, at a padding frame, or at
    /// the first unpublished frame; a leading padding frame is delivered
    /// as a block by itself. Returns 0 if the image is closed.
    pub fn block_poll<F>(&self, mut handler: F, block_length_limit: i32) -> i32
    where
        F: FnMut(&[u8], i32, i32),
    {
        if self.is_closed() {
            return 0;
        }

        let position = self.subscriber_position.get();
        let term_offset = (position & self.term_length_mask as i64) as i32;
        let index = layout::index_by_position(position, self.position_bits_to_shift);
        debug_assert!(index < PARTITION_COUNT);
        let term = self.terms[index];
        let capacity = term.len() as i32;
        let limit_offset = (term_offset + block_length_limit).min(capacity);

        let resulting_offset = scanner::scan(term, term_offset, limit_offset);
        let length = resulting_offset - term_offset;

        if resulting_offset > term_offset {
            let caught = catch_unwind(AssertUnwindSafe(|| {
                let term_id = frame::frame_term_id(&term, term_offset);
                let block = term.bytes(term_offset as usize, length as usize);
                handler(block, self.session_id, term_id);
            }));

            if let Err(payload) = caught {
                debug!(
                    message = crate::error::panic_message(payload.as_ref()),
                    "block handler panicked"
                );
                (self.error_handler)(payload.as_ref());
            }

            // The block is consumed whether or not the handler survived.
            self.subscriber_position.set_ordered(position + length as i64);
        }

        length
    }

    /// Close the image, snapshotting the final position and end-of-stream
    /// state. Idempotent; once closed, polls return 0 and mutators are
    /// no-ops.
    pub fn close(&self) {
        if !self.is_closed() {
            let final_position = self.subscriber_position.get_volatile();
            self.final_position.store(final_position, Ordering::Relaxed);
            self.is_eos.store(
                final_position >= self.log_buffers.end_of_stream_position(),
                Ordering::Relaxed,
            );
            debug!(
                session_id = self.session_id,
                correlation_id = self.correlation_id,
                final_position,
                "image closed"
            );
            // Publishes the snapshot: accessors acquire-load the flag
            // before reading it.
            self.is_closed.store(true, Ordering::Release);
        }
    }

    fn controlled_scan<F>(&self, handler: &mut F, fragment_limit: usize, end_offset: i32) -> usize
    where
        F: FnMut(&[u8], &Header) -> ControlledPollAction,
    {
        let mut initial_position = self.subscriber_position.get();
        let mut initial_offset = (initial_position & self.term_length_mask as i64) as i32;
        let index = layout::index_by_position(initial_position, self.position_bits_to_shift);
        debug_assert!(index < PARTITION_COUNT);
        let term = self.terms[index];
        let mut resulting_offset = initial_offset;
        let mut fragments_read = 0usize;
        let mut header = Header::new(self.initial_term_id, self.position_bits_to_shift, term);
        let subscriber_position = self.subscriber_position;

        let caught = catch_unwind(AssertUnwindSafe(|| {
            while fragments_read < fragment_limit && resulting_offset < end_offset {
                let length = frame::frame_length_volatile(&term, resulting_offset);
                if length <= 0 {
                    break;
                }

                let frame_offset = resulting_offset;
                let aligned_length = frame::align_frame_length(length);
                resulting_offset += aligned_length;

                if frame::is_padding_frame(&term, frame_offset) {
                    continue;
                }

                header.set_offset(frame_offset);
                let payload = term.bytes(
                    (frame_offset + HEADER_LENGTH) as usize,
                    (length - HEADER_LENGTH) as usize,
                );

                match handler(payload, &header) {
                    ControlledPollAction::Abort => {
                        resulting_offset -= aligned_length;
                        break;
                    }
                    ControlledPollAction::Break => {
                        fragments_read += 1;
                        break;
                    }
                    ControlledPollAction::Commit => {
                        fragments_read += 1;
                        initial_position += (resulting_offset - initial_offset) as i64;
                        initial_offset = resulting_offset;
                        subscriber_position.set_ordered(initial_position);
                    }
                    ControlledPollAction::Continue => {
                        fragments_read += 1;
                    }
                }
            }
        }));

        if let Err(payload) = caught {
            debug!(
                message = crate::error::panic_message(payload.as_ref()),
                "fragment handler panicked"
            );
            (self.error_handler)(payload.as_ref());
        }

        // Publish any trailing advance, including progress made before a
        // handler failure. A rewind happens only on an explicit Abort.
        let resulting_position = initial_position + (resulting_offset - initial_offset) as i64;
        if resulting_position > initial_position {
            self.subscriber_position.set_ordered(resulting_position);
        }

        fragments_read
    }

    fn validate_position(&self, new_position: i64) -> Result<(), PositionError> {
        let current = self.subscriber_position.get();
        let limit = (current - (current & self.term_length_mask as i64))
            + self.term_length_mask as i64
            + 1;

        if new_position < current || new_position > limit {
            return Err(PositionError::OutOfRange {
                new_position,
                current,
                limit,
            });
        }

        if !layout::is_frame_aligned(new_position) {
            return Err(PositionError::Unaligned { new_position });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ignore_handler_errors;
    use crate::frame::{FRAME_TYPE_DATA, FRAME_TYPE_PAD};
    use crate::position::COUNTER_LENGTH;
    use crate::region::HeapRegion;
    use std::sync::atomic::AtomicUsize;

    const TERM_LENGTH: usize = 1024;
    const SESSION_ID: i32 = 5;
    const INITIAL_TERM_ID: i32 = 7;

    struct TestHarness {
        image: Image,
        log: Arc<LogBuffers>,
        _counters: HeapRegion,
    }

    impl TestHarness {
        fn new() -> Self {
            Self::with_error_handler(ignore_handler_errors())
        }

        fn with_error_handler(error_handler: ErrorHandler) -> Self {
            let log = LogBuffers::allocate(TERM_LENGTH, INITIAL_TERM_ID);
            let counters = HeapRegion::new_zeroed(4 * COUNTER_LENGTH);
            let position = SubscriberPosition::attach(counters.region(), 1);
            let image = Image::new(
                SESSION_ID,
                1001,
                2002,
                "shm:stream?alias=test",
                position,
                Arc::clone(&log),
                error_handler,
            );
            Self {
                image,
                log,
                _counters: counters,
            }
        }

        fn term(&self, index: usize) -> Region {
            self.log.term(index)
        }
    }

    fn write_frame(
        term: &Region,
        offset: i32,
        length: i32,
        frame_type: u16,
        flags: FrameFlags,
        term_id: i32,
        payload: &[u8],
    ) {
        let base = offset as usize;
        term.set_u8(base + frame::VERSION_FIELD_OFFSET, 1);
        term.set_u8(base + frame::FLAGS_FIELD_OFFSET, flags.bits());
        term.set_u16(base + frame::TYPE_FIELD_OFFSET, frame_type);
        term.set_i32(base + frame::TERM_OFFSET_FIELD_OFFSET, offset);
        term.set_i32(base + frame::SESSION_ID_FIELD_OFFSET, SESSION_ID);
        term.set_i32(base + frame::STREAM_ID_FIELD_OFFSET, 10);
        term.set_i32(base + frame::TERM_ID_FIELD_OFFSET, term_id);
        unsafe { term.bytes_mut(base + HEADER_LENGTH as usize, payload.len()) }
            .copy_from_slice(payload);
        term.atomic_i32(base + frame::LENGTH_FIELD_OFFSET)
            .store(length, Ordering::Release);
    }

    fn write_data(term: &Region, offset: i32, length: i32, payload: &[u8]) {
        write_frame(
            term,
            offset,
            length,
            FRAME_TYPE_DATA,
            FrameFlags::UNFRAGMENTED,
            INITIAL_TERM_ID,
            payload,
        );
    }

    fn two_small_frames(harness: &TestHarness) {
        let term = harness.term(0);
        write_data(&term, 0, 48, b"AB");
        write_data(&term, 64, 40, b"CD");
    }

    #[test]
    fn construction_caches_geometry() {
        let harness = TestHarness::new();
        let image = &harness.image;

        assert_eq!(image.term_buffer_length(), TERM_LENGTH as i32);
        assert_eq!(image.position_bits_to_shift(), 10);
        assert_eq!(image.session_id(), SESSION_ID);
        assert_eq!(image.correlation_id(), 1001);
        assert_eq!(image.subscription_registration_id(), 2002);
        assert_eq!(image.initial_term_id(), INITIAL_TERM_ID);
        assert_eq!(image.source_identity(), "shm:stream?alias=test");
        assert_eq!(image.subscriber_position_id(), 1);
        assert_eq!(image.join_position(), 0);
        assert!(!image.is_closed());
    }

    #[test]
    fn controlled_poll_continue_consumes_like_poll() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let consumed = harness
            .image
            .controlled_poll(|_payload, _header| ControlledPollAction::Continue, 10);

        assert_eq!(consumed, 2);
        assert_eq!(harness.image.position(), 128);
    }

    #[test]
    fn controlled_poll_abort_on_first_frame_rewinds_fully() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let consumed = harness
            .image
            .controlled_poll(|_payload, _header| ControlledPollAction::Abort, 10);

        assert_eq!(consumed, 0);
        assert_eq!(harness.image.position(), 0);
    }

    #[test]
    fn controlled_poll_abort_on_second_frame_keeps_the_first() {
        let harness = TestHarness::new();
        two_small_frames(&harness);
        let mut calls = 0;

        let consumed = harness.image.controlled_poll(
            |_payload, _header| {
                calls += 1;
                if calls == 1 {
                    ControlledPollAction::Continue
                } else {
                    ControlledPollAction::Abort
                }
            },
            10,
        );

        assert_eq!(consumed, 1);
        assert_eq!(harness.image.position(), 64);
    }

    #[test]
    fn controlled_poll_break_stops_after_the_fragment() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let consumed = harness
            .image
            .controlled_poll(|_payload, _header| ControlledPollAction::Break, 10);

        assert_eq!(consumed, 1);
        assert_eq!(harness.image.position(), 64);
    }

    #[test]
    fn controlled_poll_commit_publishes_between_fragments() {
        let harness = TestHarness::new();
        two_small_frames(&harness);
        let image = &harness.image;
        let mut observed = Vec::new();

        let consumed = image.controlled_poll(
            |_payload, _header| {
                // The previous fragment's Commit is already visible here.
                observed.push(image.position());
                ControlledPollAction::Commit
            },
            10,
        );

        assert_eq!(consumed, 2);
        assert_eq!(observed, vec![0, 64]);
        assert_eq!(image.position(), 128);
    }

    #[test]
    fn controlled_poll_skips_padding_without_callback() {
        let harness = TestHarness::new();
        let term = harness.term(0);
        write_frame(
            &term,
            0,
            TERM_LENGTH as i32,
            FRAME_TYPE_PAD,
            FrameFlags::empty(),
            INITIAL_TERM_ID,
            b"",
        );

        let consumed = harness
            .image
            .controlled_poll(|_payload, _header| panic!("padding must not be delivered"), 10);

        assert_eq!(consumed, 0);
        assert_eq!(harness.image.position(), TERM_LENGTH as i64);
    }

    #[test]
    fn controlled_poll_handler_panic_consumes_the_frame() {
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_in_handler = Arc::clone(&failures);
        let harness = TestHarness::with_error_handler(Arc::new(move |_| {
            failures_in_handler.fetch_add(1, Ordering::Relaxed);
        }));
        two_small_frames(&harness);
        let mut calls = 0;

        let consumed = harness.image.controlled_poll(
            |_payload, _header| {
                calls += 1;
                if calls == 2 {
                    panic!("handler failure");
                }
                ControlledPollAction::Continue
            },
            10,
        );

        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert_eq!(consumed, 1);
        // No rewind on a panic: both frames' lengths are published.
        assert_eq!(harness.image.position(), 128);
    }

    #[test]
    fn bounded_controlled_poll_respects_max_position() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let consumed = harness.image.bounded_controlled_poll(
            |_payload, _header| ControlledPollAction::Continue,
            64,
            10,
        );

        assert_eq!(consumed, 1);
        assert_eq!(harness.image.position(), 64);
    }

    #[test]
    fn bounded_controlled_poll_with_past_max_position_is_empty() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let consumed = harness.image.bounded_controlled_poll(
            |_payload, _header| panic!("nothing should be delivered"),
            0,
            10,
        );

        assert_eq!(consumed, 0);
        assert_eq!(harness.image.position(), 0);
    }

    #[test]
    fn controlled_peek_requires_a_valid_position() {
        let harness = TestHarness::new();

        let unaligned = harness
            .image
            .controlled_peek(33, |_p, _h| ControlledPollAction::Continue, 1024);
        assert_eq!(unaligned, Err(PositionError::Unaligned { new_position: 33 }));

        let behind = harness.image.controlled_peek(
            -64,
            |_p, _h| ControlledPollAction::Continue,
            1024,
        );
        assert!(matches!(behind, Err(PositionError::OutOfRange { .. })));
    }

    #[test]
    fn controlled_peek_does_not_publish() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let result = harness
            .image
            .controlled_peek(0, |_p, _h| ControlledPollAction::Continue, 1024)
            .unwrap();

        assert_eq!(result, 128);
        assert_eq!(harness.image.position(), 0);
    }

    #[test]
    fn controlled_peek_waits_for_end_of_message() {
        let harness = TestHarness::new();
        let term = harness.term(0);
        write_frame(
            &term,
            0,
            48,
            FRAME_TYPE_DATA,
            FrameFlags::BEGIN_FRAGMENT,
            INITIAL_TERM_ID,
            b"AB",
        );
        write_frame(
            &term,
            64,
            40,
            FRAME_TYPE_DATA,
            FrameFlags::END_FRAGMENT,
            INITIAL_TERM_ID,
            b"CD",
        );

        // Limit between the fragments: no end-of-message seen yet.
        let partial = harness
            .image
            .controlled_peek(0, |_p, _h| ControlledPollAction::Continue, 64)
            .unwrap();
        assert_eq!(partial, 0);

        // Limit past both fragments: the message completes.
        let complete = harness
            .image
            .controlled_peek(0, |_p, _h| ControlledPollAction::Continue, 1024)
            .unwrap();
        assert_eq!(complete, 128);
    }

    #[test]
    fn controlled_peek_abort_keeps_the_starting_position() {
        let harness = TestHarness::new();
        two_small_frames(&harness);

        let result = harness
            .image
            .controlled_peek(0, |_p, _h| ControlledPollAction::Abort, 1024)
            .unwrap();

        assert_eq!(result, 0);
    }

    #[test]
    fn set_position_validates_and_publishes() {
        let harness = TestHarness::new();
        let image = &harness.image;

        image.set_position(128).unwrap();
        assert_eq!(image.position(), 128);

        assert!(matches!(
            image.set_position(64),
            Err(PositionError::OutOfRange { .. })
        ));
        assert_eq!(
            image.set_position(130),
            Err(PositionError::Unaligned { new_position: 130 })
        );
        assert!(matches!(
            image.set_position(TERM_LENGTH as i64 + 64),
            Err(PositionError::OutOfRange { .. })
        ));

        // The end of the current term is still in range.
        image.set_position(TERM_LENGTH as i64).unwrap();
        assert_eq!(image.position(), TERM_LENGTH as i64);
    }

    #[test]
    fn end_of_stream_tracks_the_driver_mark() {
        let harness = TestHarness::new();
        let image = &harness.image;

        assert!(!image.is_end_of_stream());
        assert_eq!(image.end_of_stream_position(), i64::MAX);

        harness
            .log
            .metadata()
            .end_of_stream_position
            .store(0, Ordering::Release);
        assert!(image.is_end_of_stream());

        harness
            .log
            .metadata()
            .end_of_stream_position
            .store(128, Ordering::Release);
        assert!(!image.is_end_of_stream());
    }

    #[test]
    fn close_snapshots_and_silences_the_image() {
        let harness = TestHarness::new();
        two_small_frames(&harness);
        let image = &harness.image;

        assert_eq!(image.poll(|_p, _h| {}, 10), 2);
        harness
            .log
            .metadata()
            .end_of_stream_position
            .store(128, Ordering::Release);

        image.close();
        assert!(image.is_closed());
        assert_eq!(image.position(), 128);
        assert!(image.is_end_of_stream());

        // Closing again is a no-op.
        image.close();
        assert!(image.is_closed());

        // Post-close polls deliver nothing and publish nothing; mutators
        // are silent no-ops.
        assert_eq!(image.poll(|_p, _h| panic!("closed"), 10), 0);
        assert_eq!(
            image.controlled_poll(|_p, _h| ControlledPollAction::Continue, 10),
            0
        );
        assert_eq!(
            image.bounded_controlled_poll(|_p, _h| ControlledPollAction::Continue, 1 << 20, 10),
            0
        );
        assert_eq!(image.block_poll(|_b, _s, _t| panic!("closed"), 1024), 0);
        assert_eq!(
            image.controlled_peek(0, |_p, _h| ControlledPollAction::Continue, 1024),
            Ok(0)
        );
        image.set_position(512).unwrap();
        assert_eq!(image.position(), 128);

        // The snapshot survives the driver moving on.
        harness
            .log
            .metadata()
            .end_of_stream_position
            .store(i64::MAX, Ordering::Release);
        assert!(image.is_end_of_stream());
    }

    #[test]
    fn close_from_another_thread_is_observed() {
        let harness = TestHarness::new();
        two_small_frames(&harness);
        let image = &harness.image;

        std::thread::scope(|scope| {
            scope.spawn(|| image.close());
        });

        assert!(image.is_closed());
        assert_eq!(image.poll(|_p, _h| panic!("closed"), 10), 0);
        assert_eq!(image.position(), 0);
    }

    #[test]
    fn block_poll_handler_panic_still_consumes_the_block() {
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_in_handler = Arc::clone(&failures);
        let harness = TestHarness::with_error_handler(Arc::new(move |_| {
            failures_in_handler.fetch_add(1, Ordering::Relaxed);
        }));
        two_small_frames(&harness);

        let consumed = harness
            .image
            .block_poll(|_block, _session, _term| panic!("handler failure"), 1024);

        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert_eq!(consumed, 128);
        assert_eq!(harness.image.position(), 128);
    }
}
