//! Write-ahead log: the log coordinator consulted by page level operations before they mutate a
//! page, and the record codec read back by recovery.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    extension::{FileExtension, FileId},
    page::{Lsn, PageId},
    txn::{Transaction, TxnId},
};

/// Magic number placed at the start of every log file.
const LOG_MAGIC_NUMBER: u32 = 0x5741_4C31;
const LOG_VERSION: u32 = 1;

/// Size of the log file header. It is also the LSN of the first record.
pub const LOG_HEADER_SIZE: u64 = 2 * size_of::<u32>() as u64;

/// Size of the record prefix: LSN followed by the length of the rest of the record.
const RECORD_PREFIX_SIZE: usize = size_of::<Lsn>() + size_of::<u32>();

/// Error for write-ahead log related operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
    /// File used for loading the log has invalid format
    #[error("log file has invalid format: {0}")]
    InvalidLogFile(&'static str),
    #[error("log record at {lsn} is corrupted: {reason}")]
    CorruptedRecord { lsn: Lsn, reason: String },
    #[error("unknown log record type: {0}")]
    UnknownRecordType(u8),
    #[error("log is unusable after a failed write")]
    Poisoned,
}

/// Kind of slot directory change described by [`AddRemRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddRemOp {
    Add = 1,
    Remove = 2,
}

impl TryFrom<u8> for AddRemOp {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AddRemOp::Add),
            2 => Ok(AddRemOp::Remove),
            other => Err(other),
        }
    }
}

/// Log record describing insertion or removal of a single page entry.
///
/// It carries enough to replay the change in both directions:
/// - for [`AddRemOp::Add`], `hdr` and `dbt` are the header and payload written to the page,
///   byte for byte, the entry being their concatenation followed by zero padding,
/// - for [`AddRemOp::Remove`], `hdr` holds the removed entry bytes and `dbt` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRemRecord {
    pub txn_id: TxnId,
    pub op: AddRemOp,
    pub page_type: u8,
    pub file_id: FileId,
    pub pgno: PageId,
    pub indx: u32,
    pub nbytes: u32,
    pub hdr: Vec<u8>,
    pub dbt: Vec<u8>,
    /// LSN of the page before the change.
    pub page_lsn: Lsn,
}

/// Record is serialized as (big endian):
/// 1. LSN (u64)
/// 2. Total length of everything after the LSN (u32)
/// 3. Record type (u8)
/// 4. Transaction id (u32)
/// 5. Operation (u8) and page type (u8)
/// 6. File id, page number, slot index, entry length (u32 each)
/// 7. Header length (u32) and bytes
/// 8. Payload length (u32) and bytes
/// 9. Page LSN before the change (u64)
impl AddRemRecord {
    const TYPE_ID: u8 = 1;

    /// Serializes record stamped with `lsn`.
    pub fn serialize(&self, lsn: Lsn) -> Result<Vec<u8>, WalError> {
        let mut buffer =
            Vec::with_capacity(RECORD_PREFIX_SIZE + 40 + self.hdr.len() + self.dbt.len());

        buffer.write_u64::<BigEndian>(lsn)?;
        // Placeholder for total length.
        buffer.write_u32::<BigEndian>(0)?;

        buffer.write_u8(Self::TYPE_ID)?;
        buffer.write_u32::<BigEndian>(self.txn_id)?;
        buffer.write_u8(self.op as u8)?;
        buffer.write_u8(self.page_type)?;
        buffer.write_u32::<BigEndian>(self.file_id)?;
        buffer.write_u32::<BigEndian>(self.pgno)?;
        buffer.write_u32::<BigEndian>(self.indx)?;
        buffer.write_u32::<BigEndian>(self.nbytes)?;
        buffer.write_u32::<BigEndian>(self.hdr.len() as u32)?;
        buffer.write_all(&self.hdr)?;
        buffer.write_u32::<BigEndian>(self.dbt.len() as u32)?;
        buffer.write_all(&self.dbt)?;
        buffer.write_u64::<BigEndian>(self.page_lsn)?;

        let total_length = (buffer.len() - size_of::<Lsn>()) as u32;
        buffer[size_of::<Lsn>()..RECORD_PREFIX_SIZE].copy_from_slice(&total_length.to_be_bytes());

        Ok(buffer)
    }

    /// Deserializes a single record, returning it together with its LSN.
    pub fn deserialize(bytes: &[u8]) -> Result<(Lsn, AddRemRecord), WalError> {
        let mut cursor = Cursor::new(bytes);
        let lsn = cursor.read_u64::<BigEndian>().map_err(|e| corrupted(0, e))?;
        Self::read_body(&mut cursor, lsn).map_err(|e| match e {
            WalError::IoError(io) => corrupted(lsn, io),
            other => other,
        })
    }

    fn read_body(cursor: &mut Cursor<&[u8]>, lsn: Lsn) -> Result<(Lsn, AddRemRecord), WalError> {
        let total_length = cursor.read_u32::<BigEndian>()? as usize;
        if total_length + size_of::<Lsn>() != cursor.get_ref().len() {
            return Err(WalError::CorruptedRecord {
                lsn,
                reason: format!(
                    "record length {} does not match {} available bytes",
                    total_length + size_of::<Lsn>(),
                    cursor.get_ref().len()
                ),
            });
        }

        let type_id = cursor.read_u8()?;
        if type_id != Self::TYPE_ID {
            return Err(WalError::UnknownRecordType(type_id));
        }

        let txn_id = cursor.read_u32::<BigEndian>()?;
        let op = AddRemOp::try_from(cursor.read_u8()?).map_err(|op| WalError::CorruptedRecord {
            lsn,
            reason: format!("unknown operation: {op}"),
        })?;
        let page_type = cursor.read_u8()?;
        let file_id = cursor.read_u32::<BigEndian>()?;
        let pgno = cursor.read_u32::<BigEndian>()?;
        let indx = cursor.read_u32::<BigEndian>()?;
        let nbytes = cursor.read_u32::<BigEndian>()?;
        let hdr = read_bytes(cursor)?;
        let dbt = read_bytes(cursor)?;
        let page_lsn = cursor.read_u64::<BigEndian>()?;

        Ok((
            lsn,
            AddRemRecord {
                txn_id,
                op,
                page_type,
                file_id,
                pgno,
                indx,
                nbytes,
                hdr,
                dbt,
                page_lsn,
            },
        ))
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, WalError> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn corrupted(lsn: Lsn, err: io::Error) -> WalError {
    WalError::CorruptedRecord {
        lsn,
        reason: err.to_string(),
    }
}

/// Decides whether a page is above the file's extension watermark, i.e. whether an insert onto it
/// may skip logging.
///
/// True only for a bulk loading transaction, with a valid watermark, no hot backup in progress,
/// and `pgno` at or beyond the watermark.
pub fn pg_above_extension_watermark(
    txn: Option<&Transaction>,
    file: &FileExtension,
    pgno: PageId,
    hot_backup_in_progress: bool,
) -> bool {
    let Some(txn) = txn else {
        return false;
    };
    if !txn.is_bulk_load() || hot_backup_in_progress {
        return false;
    }
    file.watermark().is_some_and(|watermark| watermark <= pgno)
}

/// Write-ahead log manager as seen by page level operations.
pub trait LogCoordinator {
    /// Appends `record` to the log and returns the LSN it was assigned. The page must not be
    /// modified if this fails.
    fn append(&self, record: &AddRemRecord) -> Result<Lsn, WalError>;

    /// Returns true if logging of a change to page `pgno` of `file` may be skipped because the
    /// page sits beyond the bulk loading extension watermark.
    fn is_above_extension_watermark(
        &self,
        txn: Option<&Transaction>,
        file: &FileExtension,
        pgno: PageId,
    ) -> bool {
        pg_above_extension_watermark(txn, file, pgno, false)
    }

    /// Records that a log write for `file` was skipped.
    fn note_skipped_write(&self, file: &FileExtension) {
        file.note_skipped_log_write();
    }
}

/// Tunables of [`WalManager`].
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Number of appended records after which the log is flushed automatically.
    pub flush_threshold: usize,
    /// If set, [`WalManager::flush`] also syncs the file to disk.
    pub sync_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 1024,
            sync_on_flush: true,
        }
    }
}

/// Destination of log bytes.
trait LogSink: Write + Send {
    /// Makes everything written so far durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

struct WalInner {
    /// LSN the next record will get (end of the log).
    next_lsn: Lsn,
    /// LSN of the last appended record.
    last_lsn: Option<Lsn>,
    /// LSN of the last record known to be flushed.
    flushed_lsn: Option<Lsn>,
    unflushed_records: usize,
    /// Set once a write failed. Bytes of the failed record may be buffered, so no LSN handed out
    /// afterwards would match its offset.
    poisoned: bool,
    log_file: BufWriter<Box<dyn LogSink>>,
}

/// File backed [`LogCoordinator`].
///
/// LSN of each record is the offset at which it starts inside the log file.
pub struct WalManager {
    config: WalConfig,
    inner: Mutex<WalInner>,
    /// Number of hot backups currently running. While non-zero bulk loading must log everything.
    hot_backups: AtomicUsize,
}

impl WalManager {
    /// Opens log at `log_path`, creating it if needed. Existing logs are validated and appended to.
    pub fn open(log_path: impl AsRef<Path>, config: WalConfig) -> Result<Self, WalError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(log_path.as_ref())?;

        let len = file.metadata()?.len();
        let next_lsn = if len == 0 {
            let mut header = Vec::with_capacity(LOG_HEADER_SIZE as usize);
            header.write_u32::<BigEndian>(LOG_MAGIC_NUMBER)?;
            header.write_u32::<BigEndian>(LOG_VERSION)?;
            file.write_all(&header)?;
            file.sync_all()?;
            debug!("created log file {}", log_path.as_ref().display());
            LOG_HEADER_SIZE
        } else {
            let mut content = Vec::with_capacity(len as usize);
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut content)?;
            Self::validate_header(&mut content.as_slice(), len)?;

            let scan = scan_records(&content);
            if let Some(e) = scan.error {
                warn!(
                    "truncating log file {} from {len} to {} bytes: {e}",
                    log_path.as_ref().display(),
                    scan.valid_end
                );
                file.set_len(scan.valid_end)?;
                file.sync_all()?;
            }
            debug!(
                "opened log file {} with {} records",
                log_path.as_ref().display(),
                scan.records.len()
            );
            scan.valid_end
        };

        Ok(Self::with_sink(config, Box::new(file), next_lsn))
    }

    fn with_sink(config: WalConfig, sink: Box<dyn LogSink>, next_lsn: Lsn) -> Self {
        Self {
            config,
            inner: Mutex::new(WalInner {
                next_lsn,
                last_lsn: None,
                flushed_lsn: None,
                unflushed_records: 0,
                poisoned: false,
                log_file: BufWriter::new(sink),
            }),
            hot_backups: AtomicUsize::new(0),
        }
    }

    fn validate_header(reader: &mut impl Read, len: u64) -> Result<(), WalError> {
        if len < LOG_HEADER_SIZE {
            return Err(WalError::InvalidLogFile("file shorter than log header"));
        }
        if reader.read_u32::<BigEndian>()? != LOG_MAGIC_NUMBER {
            return Err(WalError::InvalidLogFile("invalid magic number"));
        }
        if reader.read_u32::<BigEndian>()? != LOG_VERSION {
            return Err(WalError::InvalidLogFile("unsupported log version"));
        }
        Ok(())
    }

    /// Flushes buffered records and returns LSN of the last durable record, if any.
    pub fn flush(&self) -> Result<Option<Lsn>, WalError> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        Ok(inner.flushed_lsn)
    }

    fn flush_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        inner.log_file.flush()?;
        if self.config.sync_on_flush {
            inner.log_file.get_mut().sync()?;
        }
        inner.flushed_lsn = inner.last_lsn;
        inner.unflushed_records = 0;
        trace!("log flushed up to {:?}", inner.flushed_lsn);
        Ok(())
    }

    /// LSN of the last record known to be durable.
    pub fn flushed_lsn(&self) -> Option<Lsn> {
        self.inner.lock().flushed_lsn
    }

    /// LSN the next appended record will get.
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn begin_hot_backup(&self) {
        self.hot_backups.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_hot_backup(&self) {
        let _ = self
            .hot_backups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn hot_backup_in_progress(&self) -> bool {
        self.hot_backups.load(Ordering::Acquire) > 0
    }

    /// Reads all records of the log at `log_path`, in log order.
    pub fn read_records(log_path: impl AsRef<Path>) -> Result<Vec<(Lsn, AddRemRecord)>, WalError> {
        let mut file = File::open(log_path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        Self::validate_header(&mut content.as_slice(), content.len() as u64)?;

        let scan = scan_records(&content);
        match scan.error {
            Some(e) => Err(e),
            None => Ok(scan.records),
        }
    }
}

/// Records decoded from a log file.
struct LogScan {
    records: Vec<(Lsn, AddRemRecord)>,
    /// Offset right after the last decoded record.
    valid_end: u64,
    /// Why decoding stopped before the end of the file.
    error: Option<WalError>,
}

/// Decodes records of a log file whose header was already validated, stopping at the first
/// record that cannot be decoded.
fn scan_records(content: &[u8]) -> LogScan {
    let mut records = Vec::new();
    let mut offset = LOG_HEADER_SIZE as usize;
    let mut error = None;
    while offset < content.len() {
        match decode_record_at(content, offset) {
            Ok((record, record_length)) => {
                records.push((offset as Lsn, record));
                offset += record_length;
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    LogScan {
        records,
        valid_end: offset as u64,
        error,
    }
}

/// Decodes the record starting at `offset`, returning it together with its length.
fn decode_record_at(content: &[u8], offset: usize) -> Result<(AddRemRecord, usize), WalError> {
    let lsn = offset as Lsn;
    let rest = &content[offset..];
    if rest.len() < RECORD_PREFIX_SIZE {
        return Err(WalError::CorruptedRecord {
            lsn,
            reason: "truncated record prefix".into(),
        });
    }
    let mut length_bytes = [0u8; size_of::<u32>()];
    length_bytes.copy_from_slice(&rest[size_of::<Lsn>()..RECORD_PREFIX_SIZE]);
    let record_length = size_of::<Lsn>() + u32::from_be_bytes(length_bytes) as usize;
    if record_length < RECORD_PREFIX_SIZE || record_length > rest.len() {
        return Err(WalError::CorruptedRecord {
            lsn,
            reason: format!("record of {record_length} bytes exceeds the log"),
        });
    }

    let (stored_lsn, record) = AddRemRecord::deserialize(&rest[..record_length])?;
    if stored_lsn != lsn {
        return Err(WalError::CorruptedRecord {
            lsn,
            reason: format!("record claims lsn {stored_lsn}"),
        });
    }
    Ok((record, record_length))
}

impl LogCoordinator for WalManager {
    fn append(&self, record: &AddRemRecord) -> Result<Lsn, WalError> {
        let mut inner = self.inner.lock();
        if inner.poisoned {
            return Err(WalError::Poisoned);
        }
        let lsn = inner.next_lsn;
        let bytes = record.serialize(lsn)?;

        if let Err(e) = inner.log_file.write_all(&bytes) {
            inner.poisoned = true;
            error!("failed to append log record at lsn {lsn}, refusing further appends: {e}");
            return Err(e.into());
        }
        inner.next_lsn += bytes.len() as Lsn;
        inner.last_lsn = Some(lsn);
        inner.unflushed_records += 1;
        trace!(
            "appended {:?} record for page {} slot {} at lsn {lsn}",
            record.op, record.pgno, record.indx
        );

        // The record is part of the log from here on, a failed flush only delays its durability.
        if inner.unflushed_records >= self.config.flush_threshold {
            if let Err(e) = self.flush_locked(&mut inner) {
                error!(
                    "automatic log flush failed, log durable up to {:?}: {e}",
                    inner.flushed_lsn
                );
            }
        }
        Ok(lsn)
    }

    fn is_above_extension_watermark(
        &self,
        txn: Option<&Transaction>,
        file: &FileExtension,
        pgno: PageId,
    ) -> bool {
        pg_above_extension_watermark(txn, file, pgno, self.hot_backup_in_progress())
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Err(e) = inner.log_file.flush() {
            error!("failed to flush log while dropping WalManager: {e}");
        }
    }
}
