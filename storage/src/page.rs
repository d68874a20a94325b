//! Raw page buffers shared by the slotted page layer and recovery.

use bytemuck::{Pod, PodCastError, Zeroable};
use thiserror::Error;

/// Type representing page number, should be used instead of using bare `u32`.
pub type PageId = u32;

/// Log sequence number. Real LSNs are byte offsets of records inside the log file.
pub type Lsn = u64;

/// LSN of a page that was never touched by a logged or unlogged mutation.
pub const ZERO_LSN: Lsn = 0;

/// LSN stamped on pages modified without logging. It never collides with a real LSN, so such
/// pages are never treated as part of a valid log chain.
pub const NOT_LOGGED_LSN: Lsn = 1;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. The high-water offset of an empty page equals the page size and
/// must fit into a 16-bit slot offset.
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

/// Size of [`PageHeader`] on disk.
pub const HEADER_SIZE: usize = size_of::<PageHeader>();

/// Header placed at the start of every page.
///
/// Layout (26 bytes, no padding, host byte order):
/// ```text
/// Offset  Size  Field
///   0     8     lsn
///   8     4     pgno
///  12     4     prev_pgno
///  16     4     next_pgno
///  20     2     entries
///  22     2     hf_offset
///  24     1     level
///  25     1     page_type
/// ```
#[derive(Pod, Zeroable, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub pgno: PageId,
    pub prev_pgno: PageId,
    pub next_pgno: PageId,
    /// Number of live slots.
    pub entries: u16,
    /// High-water offset: lowest byte occupied by the entries region.
    pub hf_offset: u16,
    pub level: u8,
    pub page_type: u8,
}

impl PageHeader {
    fn empty(page_size: usize, pgno: PageId, page_type: PageType) -> Self {
        Self {
            lsn: ZERO_LSN,
            pgno,
            prev_pgno: 0,
            next_pgno: 0,
            entries: 0,
            hf_offset: page_size as u16,
            level: if page_type.is_leaf() { 1 } else { 0 },
            page_type: page_type as u8,
        }
    }
}

/// Kinds of pages that carry a slot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Invalid = 0,
    Duplicate = 1,
    InternalBtree = 3,
    InternalRecno = 4,
    LeafBtree = 5,
    LeafRecno = 6,
    LeafDuplicate = 12,
    Hash = 13,
}

impl PageType {
    pub fn is_leaf(self) -> bool {
        matches!(
            self,
            PageType::LeafBtree | PageType::LeafRecno | PageType::LeafDuplicate
        )
    }
}

impl TryFrom<u8> for PageType {
    type Error = PageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PageType::Invalid),
            1 => Ok(PageType::Duplicate),
            3 => Ok(PageType::InternalBtree),
            4 => Ok(PageType::InternalRecno),
            5 => Ok(PageType::LeafBtree),
            6 => Ok(PageType::LeafRecno),
            12 => Ok(PageType::LeafDuplicate),
            13 => Ok(PageType::Hash),
            other => Err(PageError::UnknownPageType(other)),
        }
    }
}

/// Error for page buffer related operations.
#[derive(Debug, Error)]
pub enum PageError {
    /// Page size is not a power of two inside the supported range.
    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),
    #[error("unknown page type: {0}")]
    UnknownPageType(u8),
    #[error("casting page header from bytes failed: {reason}")]
    CastError { reason: String },
}

impl From<PodCastError> for PageError {
    fn from(err: PodCastError) -> Self {
        Self::CastError {
            reason: err.to_string(),
        }
    }
}

/// Returns `true` if pages of `page_size` bytes can be managed.
pub fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

/// Reads LSN from the header of raw `page`.
pub fn get_page_lsn(page: &[u8]) -> Lsn {
    let mut lsn = [0u8; size_of::<Lsn>()];
    lsn.copy_from_slice(&page[..size_of::<Lsn>()]);
    Lsn::from_ne_bytes(lsn)
}

/// Writes `lsn` into the header of raw `page`.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[..size_of::<Lsn>()].copy_from_slice(&lsn.to_ne_bytes());
}

pub trait PageRead {
    fn data(&self) -> &[u8];
}

/// Write access to a pinned page.
///
/// Implementors are held exclusively (`&mut`) for the duration of a mutation, which is the only
/// latch the slotted page layer relies on.
pub trait PageWrite {
    fn data_mut(&mut self) -> &mut [u8];
    /// Returns true if the owner has marked the page as modified.
    fn is_dirty(&self) -> bool;
    fn mark_dirty(&mut self);
}

impl<T: PageRead> PageRead for &T {
    fn data(&self) -> &[u8] {
        (*self).data()
    }
}

impl<T: PageRead> PageRead for &mut T {
    fn data(&self) -> &[u8] {
        (**self).data()
    }
}

impl<T: PageWrite> PageWrite for &mut T {
    fn data_mut(&mut self) -> &mut [u8] {
        (*self).data_mut()
    }

    fn is_dirty(&self) -> bool {
        (**self).is_dirty()
    }

    fn mark_dirty(&mut self) {
        (*self).mark_dirty();
    }
}

/// Owned fixed-size page buffer together with its dirty flag.
///
/// Stands in for a buffer pool frame: the slotted page layer never allocates pages itself, it only
/// mutates buffers handed to it.
#[derive(Clone, PartialEq, Eq)]
pub struct PageBuf {
    data: Box<[u8]>,
    dirty: bool,
}

impl PageBuf {
    /// Creates a new empty page: no entries and the high-water offset at the end of the page.
    pub fn new(page_size: usize, pgno: PageId, page_type: PageType) -> Result<Self, PageError> {
        if !is_valid_page_size(page_size) {
            return Err(PageError::InvalidPageSize(page_size));
        }
        let mut data = vec![0u8; page_size].into_boxed_slice();
        let header = PageHeader::empty(page_size, pgno, page_type);
        data[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        Ok(Self { data, dirty: false })
    }

    /// Wraps bytes read from disk. The page starts clean.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PageError> {
        if !is_valid_page_size(bytes.len()) {
            return Err(PageError::InvalidPageSize(bytes.len()));
        }
        Ok(Self {
            data: bytes.into_boxed_slice(),
            dirty: false,
        })
    }

    pub fn header(&self) -> Result<PageHeader, PageError> {
        Ok(*bytemuck::try_from_bytes::<PageHeader>(
            &self.data[..HEADER_SIZE],
        )?)
    }

    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.header()?.page_type)
    }

    pub fn pgno(&self) -> Result<PageId, PageError> {
        Ok(self.header()?.pgno)
    }

    pub fn lsn(&self) -> Lsn {
        get_page_lsn(&self.data)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        set_page_lsn(&mut self.data, lsn);
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    /// Called by the owner once the page was written back.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_vec()
    }
}

impl std::fmt::Debug for PageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuf")
            .field("header", &self.header().ok())
            .field("page_size", &self.data.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl PageRead for PageBuf {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl PageWrite for PageBuf {
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}
