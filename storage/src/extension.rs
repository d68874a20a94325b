//! Per-file extension tracking used by bulk loading.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::page::PageId;

/// Type representing file id inside the log, should be used instead of bare `u32`.
pub type FileId = u32;

/// Watermark value meaning "no watermark set".
pub const PGNO_INVALID: PageId = 0;

/// Extension state of a single open file.
///
/// When a bulk loading transaction starts extending a file, the first page it allocates becomes
/// the watermark. Inserts onto pages at or above it are not logged: aborting the transaction
/// truncates the file back below the watermark. Each skipped log write is counted so extension
/// accounting can tell the pages apart from logged ones.
#[derive(Debug)]
pub struct FileExtension {
    file_id: FileId,
    watermark: AtomicU32,
    skipped_log_writes: AtomicU64,
}

impl FileExtension {
    pub fn new(file_id: FileId) -> Self {
        Self {
            file_id,
            watermark: AtomicU32::new(PGNO_INVALID),
            skipped_log_writes: AtomicU64::new(0),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn set_watermark(&self, pgno: PageId) {
        self.watermark.store(pgno, Ordering::Release);
    }

    /// Invalidates the watermark, e.g. after the bulk loading transaction resolved.
    pub fn clear_watermark(&self) {
        self.watermark.store(PGNO_INVALID, Ordering::Release);
    }

    pub fn watermark(&self) -> Option<PageId> {
        match self.watermark.load(Ordering::Acquire) {
            PGNO_INVALID => None,
            pgno => Some(pgno),
        }
    }

    pub fn note_skipped_log_write(&self) {
        self.skipped_log_writes.fetch_add(1, Ordering::AcqRel);
    }

    pub fn skipped_log_writes(&self) -> u64 {
        self.skipped_log_writes.load(Ordering::Acquire)
    }
}
