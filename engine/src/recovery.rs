//! Recovery of slotted page changes from add/remove log records.
//!
//! Page LSNs decide what to replay: a record is redone only on a page whose LSN equals the LSN the
//! page had before the change, and undone only on a page stamped with the record's own LSN.
//! Replaying goes through the unlogged operations so recovery itself writes nothing to the log.

use std::collections::HashMap;

use log::{debug, trace};
use storage::{
    page::{Lsn, PageBuf, PageId, PageRead, PageWrite},
    write_ahead_log::{AddRemOp, AddRemRecord},
};
use thiserror::Error;

use crate::{
    entry::EntrySource,
    slotted_page::{SlotId, SlottedPage, SlottedPageError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOp {
    Redo,
    Undo,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("log record for page {record} applied to page {page}")]
    PageMismatch { record: PageId, page: PageId },
    #[error("log record field {field} has invalid value {value}")]
    InvalidRecord { field: &'static str, value: u32 },
    #[error("{0}")]
    SlottedPage(#[from] SlottedPageError),
}

enum Change {
    Insert,
    Remove,
}

/// Entry bytes carried by `record`. An add carries the header and payload exactly as they were
/// written, a remove carries the whole removed entry in `hdr`.
fn entry_source(record: &AddRemRecord) -> EntrySource<'_> {
    match record.op {
        AddRemOp::Add => EntrySource::WithHeader {
            header: &record.hdr,
            payload: Some(&record.dbt),
        },
        AddRemOp::Remove => EntrySource::Prebuilt(&record.hdr),
    }
}

fn narrow(field: &'static str, value: u32) -> Result<u16, RecoveryError> {
    u16::try_from(value).map_err(|_| RecoveryError::InvalidRecord { field, value })
}

/// Redoes or undoes the change described by `record` (written at `lsn`) on `page`.
///
/// Returns `true` if the page was modified. Redo stamps the page with `lsn`, undo restores the LSN
/// the page had before the change.
pub fn recover_addrem<P: PageRead + PageWrite>(
    page: &mut SlottedPage<P>,
    lsn: Lsn,
    record: &AddRemRecord,
    op: RecoveryOp,
) -> Result<bool, RecoveryError> {
    let pgno = page.pgno()?;
    if pgno != record.pgno {
        return Err(RecoveryError::PageMismatch {
            record: record.pgno,
            page: pgno,
        });
    }
    let indx: SlotId = narrow("indx", record.indx)?;
    let nbytes = narrow("nbytes", record.nbytes)?;

    let page_lsn = page.lsn();
    let before_change = page_lsn == record.page_lsn;
    let after_change = page_lsn == lsn;

    let change = match (op, record.op) {
        (RecoveryOp::Redo, AddRemOp::Add) if before_change => Change::Insert,
        (RecoveryOp::Undo, AddRemOp::Remove) if after_change => Change::Insert,
        (RecoveryOp::Undo, AddRemOp::Add) if after_change => Change::Remove,
        (RecoveryOp::Redo, AddRemOp::Remove) if before_change => Change::Remove,
        _ => {
            trace!(
                "{op:?} of {:?} at lsn {lsn} not needed for page {pgno} with lsn {page_lsn}",
                record.op
            );
            return Ok(false);
        }
    };

    page.mark_dirty();
    match change {
        Change::Insert => page.insert_entry_unlogged(indx, nbytes, entry_source(record))?,
        Change::Remove => page.remove_entry_unlogged(indx, nbytes)?,
    }
    page.set_lsn(match op {
        RecoveryOp::Redo => lsn,
        RecoveryOp::Undo => record.page_lsn,
    });
    trace!(
        "{op:?} of {:?} at lsn {lsn} applied to slot {indx} of page {pgno}",
        record.op
    );
    Ok(true)
}

/// Replays `records` onto `pages`: forward for redo, backwards for undo. Records of pages that are
/// not present are skipped. Returns number of records that changed a page.
pub fn replay(
    records: &[(Lsn, AddRemRecord)],
    pages: &mut HashMap<PageId, PageBuf>,
    op: RecoveryOp,
) -> Result<usize, RecoveryError> {
    let mut apply = |(lsn, record): &(Lsn, AddRemRecord)| -> Result<bool, RecoveryError> {
        match pages.get_mut(&record.pgno) {
            Some(page) => recover_addrem(&mut SlottedPage::new(page), *lsn, record, op),
            None => Ok(false),
        }
    };

    let mut applied = 0;
    match op {
        RecoveryOp::Redo => {
            for entry in records {
                applied += apply(entry)? as usize;
            }
        }
        RecoveryOp::Undo => {
            for entry in records.iter().rev() {
                applied += apply(entry)? as usize;
            }
        }
    }
    debug!(
        "{op:?} applied {applied} of {} log records",
        records.len()
    );
    Ok(applied)
}
