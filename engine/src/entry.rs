//! On-page representation of slotted page entries.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Flag kept in the top bit of an entry's type byte.
pub const ENTRY_DELETED: u8 = 0x80;

/// Size of [`KeyDataHeader`] on the page. The payload starts right after it.
pub const KEYDATA_HEADER_SIZE: usize = size_of::<KeyDataHeader>();

/// Entry sizes reserved on the page are multiples of this.
const ENTRY_ALIGN: usize = size_of::<u32>();

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("entry of {actual} bytes is shorter than its {expected} byte header")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown entry type: {0}")]
    UnknownEntryType(u8),
    #[error("payload of {0} bytes does not fit into an entry")]
    PayloadTooLarge(usize),
}

/// Type tag stored in the low bits of an entry's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    /// Plain key or data item.
    KeyData = 1,
    /// Reference to an off-page duplicate tree.
    Duplicate = 2,
    /// Reference to an overflow page chain.
    Overflow = 3,
}

impl TryFrom<u8> for EntryType {
    type Error = EntryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & !ENTRY_DELETED {
            1 => Ok(EntryType::KeyData),
            2 => Ok(EntryType::Duplicate),
            3 => Ok(EntryType::Overflow),
            _ => Err(EntryError::UnknownEntryType(value)),
        }
    }
}

/// Header of a plain key/data entry, followed on the page by `len` payload bytes.
#[derive(Pod, Zeroable, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct KeyDataHeader {
    pub len: u16,
    pub type_: u8,
}

impl KeyDataHeader {
    pub fn new(entry_type: EntryType, len: u16) -> Self {
        let mut header = Self { len, type_: 0 };
        header.set_type(entry_type);
        header
    }

    /// Sets the type tag, keeping the deleted flag as it was.
    pub fn set_type(&mut self, entry_type: EntryType) {
        self.type_ = (self.type_ & ENTRY_DELETED) | entry_type as u8;
    }

    pub fn entry_type(&self) -> Result<EntryType, EntryError> {
        EntryType::try_from(self.type_)
    }

    pub fn is_deleted(&self) -> bool {
        self.type_ & ENTRY_DELETED != 0
    }

    pub fn mark_deleted(&mut self) {
        self.type_ |= ENTRY_DELETED;
    }
}

/// Number of bytes reserved on a page for a plain entry with `len` payload bytes.
pub fn keydata_size(len: usize) -> usize {
    (len + KEYDATA_HEADER_SIZE).next_multiple_of(ENTRY_ALIGN)
}

/// Decodes a plain key/data entry into its header and payload.
pub fn read_keydata(bytes: &[u8]) -> Result<(KeyDataHeader, &[u8]), EntryError> {
    if bytes.len() < KEYDATA_HEADER_SIZE {
        return Err(EntryError::Truncated {
            expected: KEYDATA_HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let header = *bytemuck::from_bytes::<KeyDataHeader>(&bytes[..KEYDATA_HEADER_SIZE]);
    let len = header.len as usize;
    let payload = &bytes[KEYDATA_HEADER_SIZE..];
    if payload.len() < len {
        return Err(EntryError::Truncated {
            expected: KEYDATA_HEADER_SIZE + len,
            actual: bytes.len(),
        });
    }
    Ok((header, &payload[..len]))
}

/// Bytes written onto the page by an insert.
#[derive(Debug, Clone, Copy)]
pub enum EntrySource<'a> {
    /// Entry built elsewhere, e.g. taken from a log record during recovery. Copied verbatim.
    Prebuilt(&'a [u8]),
    /// Caller supplied header followed by an optional payload.
    WithHeader {
        header: &'a [u8],
        payload: Option<&'a [u8]>,
    },
    /// Plain key/data entry: a [`KeyDataHeader`] is synthesized for the payload.
    KeyData(&'a [u8]),
}

impl<'a> EntrySource<'a> {
    /// Header bytes as they will appear on the page.
    pub fn header_bytes(&self) -> Result<Vec<u8>, EntryError> {
        match self {
            EntrySource::Prebuilt(bytes) => Ok(bytes.to_vec()),
            EntrySource::WithHeader { header, .. } => Ok(header.to_vec()),
            EntrySource::KeyData(payload) => {
                let len = u16::try_from(payload.len())
                    .map_err(|_| EntryError::PayloadTooLarge(payload.len()))?;
                Ok(bytemuck::bytes_of(&KeyDataHeader::new(EntryType::KeyData, len)).to_vec())
            }
        }
    }

    /// Payload bytes following the header, if any.
    pub fn payload(&self) -> Option<&'a [u8]> {
        match self {
            EntrySource::Prebuilt(_) => None,
            EntrySource::WithHeader { payload, .. } => *payload,
            EntrySource::KeyData(payload) => Some(*payload),
        }
    }

    /// Number of bytes the entry occupies before padding.
    pub fn encoded_len(&self) -> usize {
        match self {
            EntrySource::Prebuilt(bytes) => bytes.len(),
            EntrySource::WithHeader { header, payload } => {
                header.len() + payload.map_or(0, |p| p.len())
            }
            EntrySource::KeyData(payload) => KEYDATA_HEADER_SIZE + payload.len(),
        }
    }

    /// Writes the entry at the beginning of `dst` and zeroes the rest of it.
    ///
    /// `dst` must be at least [`EntrySource::encoded_len`] bytes long.
    pub(crate) fn write_into(&self, dst: &mut [u8]) -> Result<(), EntryError> {
        let header = self.header_bytes()?;
        dst[..header.len()].copy_from_slice(&header);
        let mut end = header.len();
        if let Some(payload) = self.payload() {
            dst[end..end + payload.len()].copy_from_slice(payload);
            end += payload.len();
        }
        dst[end..].fill(0);
        Ok(())
    }
}
