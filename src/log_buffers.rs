//! Handle over one publication's mapped log.
//!
//! A log is [`PARTITION_COUNT`](crate::layout::PARTITION_COUNT) term
//! buffers of identical power-of-two capacity plus a [`LogMetadata`]
//! section. The mapping itself is produced elsewhere (the driver maps log
//! files; tests and in-process embeddings use [`LogBuffers::allocate`]);
//! this handle validates the layout on attach and hands out [`Region`]
//! views. Ownership is shared between the image and its subscription via
//! `Arc`, so metadata stays readable after close.

use core::sync::atomic::Ordering;
use std::sync::Arc;

use crate::layout::{
    self, AttachError, LOG_METADATA_SIZE, LogMetadata, PARTITION_COUNT,
};
use crate::region::{HeapRegion, Region};

/// Shared handle over a mapped log: term partitions plus metadata.
pub struct LogBuffers {
    terms: [Region; PARTITION_COUNT],
    metadata: Region,
    // Keeps heap-allocated logs alive; mapped logs are kept alive by the
    // caller of `attach` per its safety contract.
    _backing: Vec<HeapRegion>,
}

impl LogBuffers {
    /// Attach to an externally-mapped log.
    ///
    /// Validates the metadata magic/version and that every term partition
    /// has the same supported power-of-two capacity.
    ///
    /// # Safety
    ///
    /// The regions must stay valid for the lifetime of the returned
    /// handle (and anything cloned from it).
    pub unsafe fn attach(
        terms: [Region; PARTITION_COUNT],
        metadata: Region,
    ) -> Result<Arc<Self>, AttachError> {
        if metadata.len() < LOG_METADATA_SIZE {
            return Err(AttachError::MetadataTooSmall {
                required: LOG_METADATA_SIZE,
                found: metadata.len(),
            });
        }

        let capacity = terms[0].len();
        if terms.iter().any(|t| t.len() != capacity) {
            return Err(AttachError::UnevenTermLengths);
        }

        let log = Self {
            terms,
            metadata,
            _backing: Vec::new(),
        };
        log.metadata().validate(capacity)?;
        Ok(Arc::new(log))
    }

    /// Allocate a zeroed, heap-backed log with initialized metadata.
    ///
    /// Intended for tests and in-process embeddings where no driver maps
    /// log files.
    pub fn allocate(term_length: usize, initial_term_id: i32) -> Arc<Self> {
        layout::check_term_length(term_length).expect("unsupported term length");

        let mut backing: Vec<HeapRegion> = (0..PARTITION_COUNT)
            .map(|_| HeapRegion::new_zeroed(term_length))
            .collect();
        backing.push(HeapRegion::new_zeroed(LOG_METADATA_SIZE));

        let metadata = backing[PARTITION_COUNT].region();
        unsafe { metadata.get_mut::<LogMetadata>(0) }.init(term_length as u32, initial_term_id);

        let terms = [
            backing[0].region(),
            backing[1].region(),
            backing[2].region(),
        ];

        Arc::new(Self {
            terms,
            metadata,
            _backing: backing,
        })
    }

    /// View of term partition `index`.
    #[inline]
    pub fn term(&self, index: usize) -> Region {
        self.terms[index]
    }

    /// Capacity of each term partition, in bytes.
    #[inline]
    pub fn term_length(&self) -> usize {
        self.terms[0].len()
    }

    /// The metadata section.
    #[inline]
    pub fn metadata(&self) -> &LogMetadata {
        unsafe { self.metadata.get::<LogMetadata>(0) }
    }

    /// Term id the stream started at.
    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.metadata().initial_term_id
    }

    /// Acquire read of the driver-published end-of-stream position.
    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.metadata().end_of_stream_position.load(Ordering::Acquire)
    }
}
