//! Logged page mutations.
//!
//! [`Cursor`] carries the logging context of a caller (log coordinator, transaction and the
//! extension state of the file) and wraps the unlogged operations of [`SlottedPage`] so every
//! change is written to the log before the page is touched.

use log::{debug, warn};
use storage::{
    extension::FileExtension,
    page::{Lsn, NOT_LOGGED_LSN, PageRead, PageWrite},
    txn::Transaction,
    write_ahead_log::{AddRemOp, AddRemRecord, LogCoordinator, WalError},
};
use thiserror::Error;

use crate::{
    entry::EntrySource,
    slotted_page::{SlotId, SlottedPage, SlottedPageError},
};

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("{0}")]
    SlottedPage(#[from] SlottedPageError),
    #[error("failed to append log record: {0}")]
    LogAppendFailure(#[from] WalError),
}

/// Logging context for page mutations.
///
/// Logging is active when a log coordinator is attached and the cursor does not belong to
/// recovery. Without it pages are stamped with [`NOT_LOGGED_LSN`].
pub struct Cursor<'a, L> {
    wal: Option<&'a L>,
    txn: Option<&'a Transaction>,
    file: &'a FileExtension,
    recovering: bool,
}

impl<'a, L: LogCoordinator> Cursor<'a, L> {
    /// Creates cursor for a non-durable file: nothing it does is logged.
    pub fn unlogged(file: &'a FileExtension) -> Self {
        Self {
            wal: None,
            txn: None,
            file,
            recovering: false,
        }
    }

    /// Creates cursor logging through `wal`.
    pub fn logged(wal: &'a L, txn: Option<&'a Transaction>, file: &'a FileExtension) -> Self {
        Self {
            wal: Some(wal),
            txn,
            file,
            recovering: false,
        }
    }

    /// Marks cursor as used by recovery, which must not log the changes it replays.
    pub fn for_recovery(mut self) -> Self {
        self.recovering = true;
        self
    }

    pub fn is_logging(&self) -> bool {
        self.wal.is_some() && !self.recovering
    }

    fn active_wal(&self) -> Option<&'a L> {
        self.wal.filter(|_| !self.recovering)
    }

    fn txn_id(&self) -> u32 {
        self.txn.map_or(0, Transaction::id)
    }

    /// Removes the `nbytes` long entry in slot `indx`, logging the removed bytes first.
    ///
    /// If the log append fails the page is left exactly as it was.
    pub fn remove_entry<P: PageRead + PageWrite>(
        &self,
        page: &mut SlottedPage<P>,
        indx: SlotId,
        nbytes: u16,
    ) -> Result<(), CursorError> {
        page.validate_remove(indx, nbytes)?;

        match self.active_wal() {
            Some(wal) => {
                let record = AddRemRecord {
                    txn_id: self.txn_id(),
                    op: AddRemOp::Remove,
                    page_type: page.page_type()?,
                    file_id: self.file.file_id(),
                    pgno: page.pgno()?,
                    indx: indx as u32,
                    nbytes: nbytes as u32,
                    hdr: page.entry_bytes(indx, nbytes)?.to_vec(),
                    dbt: Vec::new(),
                    page_lsn: page.lsn(),
                };
                let lsn = self.append(wal, &record)?;
                page.set_lsn(lsn);
            }
            None => page.set_lsn(NOT_LOGGED_LSN),
        }

        Ok(page.remove_entry_unlogged(indx, nbytes)?)
    }

    /// Inserts a new `nbytes` long entry at slot `indx`, logging the written bytes first.
    ///
    /// Inserts onto pages above the bulk loading extension watermark are not logged and keep
    /// their LSN; the skipped write is counted on the file instead.
    pub fn insert_entry<P: PageRead + PageWrite>(
        &self,
        page: &mut SlottedPage<P>,
        indx: SlotId,
        nbytes: u16,
        source: EntrySource<'_>,
    ) -> Result<(), CursorError> {
        page.validate_insert(indx, nbytes, &source)?;

        match self.active_wal() {
            Some(wal) => {
                let pgno = page.pgno()?;
                if wal.is_above_extension_watermark(self.txn, self.file, pgno) {
                    wal.note_skipped_write(self.file);
                    debug!(
                        "skipped logging insert into page {pgno} above extension watermark of file {}",
                        self.file.file_id()
                    );
                } else {
                    let record = AddRemRecord {
                        txn_id: self.txn_id(),
                        op: AddRemOp::Add,
                        page_type: page.page_type()?,
                        file_id: self.file.file_id(),
                        pgno,
                        indx: indx as u32,
                        nbytes: nbytes as u32,
                        hdr: source.header_bytes().map_err(SlottedPageError::from)?,
                        dbt: source.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        page_lsn: page.lsn(),
                    };
                    let lsn = self.append(wal, &record)?;
                    page.set_lsn(lsn);
                }
            }
            None => page.set_lsn(NOT_LOGGED_LSN),
        }

        Ok(page.insert_entry_unlogged(indx, nbytes, source)?)
    }

    fn append(&self, wal: &L, record: &AddRemRecord) -> Result<Lsn, CursorError> {
        wal.append(record).map_err(|e| {
            warn!(
                "failed to log {:?} of slot {} on page {}: {e}",
                record.op, record.indx, record.pgno
            );
            CursorError::LogAppendFailure(e)
        })
    }
}
