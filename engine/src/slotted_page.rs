use bytemuck::PodCastError;
use log::trace;
use storage::page::{
    HEADER_SIZE, Lsn, PageHeader, PageId, PageRead, PageWrite, get_page_lsn, set_page_lsn,
};
use thiserror::Error;

use crate::{
    config::{MutatorConfig, SpacePolicy},
    entry::{EntryError, EntrySource},
};

/// Type representing slot index, should be used instead of bare `u16`.
pub type SlotId = u16;

/// Width of a single slot directory entry (an offset into the page).
pub const SLOT_WIDTH: usize = size_of::<u16>();

#[derive(Debug, Error)]
pub enum SlottedPageError {
    #[error("tried to access slot {slot} while there were only {num_entries} entries")]
    InvalidSlot { num_entries: u16, slot: SlotId },
    #[error("entry of {requested} bytes (plus its slot) does not fit into {available} free bytes")]
    InsufficientSpace { requested: usize, available: usize },
    #[error("page must be marked dirty before it is modified")]
    PageNotDirty,
    #[error("entry of {encoded} bytes does not fit into the {nbytes} bytes reserved for it")]
    EntryTooLarge { encoded: usize, nbytes: usize },
    #[error("page is corrupted: {0}")]
    Corrupted(String),
    #[error("casting data from bytes failed for the following reason: {reason}")]
    CastError { reason: String },
    #[error("{0}")]
    Entry(#[from] EntryError),
}

impl From<PodCastError> for SlottedPageError {
    fn from(err: PodCastError) -> Self {
        Self::CastError {
            reason: err.to_string(),
        }
    }
}

/// Position of slot `slot` inside the page.
fn slot_position(slot: usize) -> usize {
    HEADER_SIZE + slot * SLOT_WIDTH
}

/// View of a page as a dense slot directory growing up from the header and packed entries growing
/// down from the end of the page.
///
/// The layout is:
/// ```text
/// | header | slot 0 | slot 1 | ... | free space | entries ... |
///                                               ^ hf_offset   ^ page size
/// ```
/// Slot order is the logical order chosen by the caller, physical order of entries is whatever
/// packing produced. Exclusive access is expressed by owning (or mutably borrowing) the page.
pub struct SlottedPage<P> {
    page: P,
    config: MutatorConfig,
}

impl<P> SlottedPage<P> {
    pub fn new(page: P) -> Self {
        Self::with_config(page, MutatorConfig::default())
    }

    pub fn with_config(page: P, config: MutatorConfig) -> Self {
        Self { page, config }
    }

    pub fn config(&self) -> &MutatorConfig {
        &self.config
    }

    pub fn into_inner(self) -> P {
        self.page
    }
}

impl<P: PageRead> SlottedPage<P> {
    pub fn header(&self) -> Result<&PageHeader, SlottedPageError> {
        let data = self.page.data();
        if data.len() < HEADER_SIZE {
            return Err(SlottedPageError::Corrupted(format!(
                "page of {} bytes cannot hold its header",
                data.len()
            )));
        }
        Ok(bytemuck::try_from_bytes(&data[..HEADER_SIZE])?)
    }

    pub fn inner(&self) -> &P {
        &self.page
    }

    pub fn page_size(&self) -> usize {
        self.page.data().len()
    }

    pub fn pgno(&self) -> Result<PageId, SlottedPageError> {
        Ok(self.header()?.pgno)
    }

    pub fn page_type(&self) -> Result<u8, SlottedPageError> {
        Ok(self.header()?.page_type)
    }

    pub fn lsn(&self) -> Lsn {
        get_page_lsn(self.page.data())
    }

    pub fn num_entries(&self) -> Result<u16, SlottedPageError> {
        Ok(self.header()?.entries)
    }

    pub fn is_empty(&self) -> Result<bool, SlottedPageError> {
        Ok(self.num_entries()? == 0)
    }

    pub fn high_water_offset(&self) -> Result<u16, SlottedPageError> {
        Ok(self.header()?.hf_offset)
    }

    /// Bytes between the end of the slot directory and the start of the entries region.
    ///
    /// Fails with [`SlottedPageError::Corrupted`] unless the header describes a layout that fits
    /// the page: `slot directory end <= hf_offset <= page size`.
    pub fn free_space(&self) -> Result<usize, SlottedPageError> {
        let header = self.header()?;
        let directory_end = slot_position(header.entries as usize);
        let hf_offset = header.hf_offset as usize;
        if hf_offset > self.page_size() {
            return Err(SlottedPageError::Corrupted(format!(
                "high-water offset {hf_offset} past the end of the {} byte page",
                self.page_size()
            )));
        }
        hf_offset.checked_sub(directory_end).ok_or_else(|| {
            SlottedPageError::Corrupted(format!(
                "slot directory ends at {directory_end} past high-water offset {hf_offset}"
            ))
        })
    }

    fn raw_slot(&self, slot: SlotId) -> u16 {
        let pos = slot_position(slot as usize);
        let data = self.page.data();
        u16::from_ne_bytes([data[pos], data[pos + 1]])
    }

    fn check_slot(&self, slot: SlotId) -> Result<(), SlottedPageError> {
        self.free_space()?;
        let num_entries = self.num_entries()?;
        if slot >= num_entries {
            return Err(SlottedPageError::InvalidSlot { num_entries, slot });
        }
        Ok(())
    }

    /// Offset of the entry stored in `slot`.
    pub fn slot_offset(&self, slot: SlotId) -> Result<u16, SlottedPageError> {
        self.check_slot(slot)?;
        Ok(self.raw_slot(slot))
    }

    /// Offsets of all entries, in slot order.
    pub fn slot_offsets(&self) -> Result<Vec<u16>, SlottedPageError> {
        self.free_space()?;
        let num_entries = self.num_entries()?;
        Ok((0..num_entries).map(|slot| self.raw_slot(slot)).collect())
    }

    /// Returns the `nbytes` bytes of the entry stored in `slot`.
    pub fn entry_bytes(&self, slot: SlotId, nbytes: u16) -> Result<&[u8], SlottedPageError> {
        let offset = self.entry_offset(slot, nbytes)? as usize;
        Ok(&self.page.data()[offset..offset + nbytes as usize])
    }

    /// Returns page bytes from the start of the entry in `slot` to the end of the page. The
    /// entry's own header tells how many of them belong to it.
    pub fn entry_at(&self, slot: SlotId) -> Result<&[u8], SlottedPageError> {
        let offset = self.entry_offset(slot, 0)? as usize;
        Ok(&self.page.data()[offset..])
    }

    /// Validates that an entry of `nbytes` stored in `slot` lies inside the entries region.
    fn entry_offset(&self, slot: SlotId, nbytes: u16) -> Result<u16, SlottedPageError> {
        let offset = self.slot_offset(slot)?;
        let hf_offset = self.high_water_offset()?;
        if offset < hf_offset || offset as usize + nbytes as usize > self.page_size() {
            return Err(SlottedPageError::Corrupted(format!(
                "entry of {nbytes} bytes at offset {offset} of slot {slot} is outside of [{hf_offset}, {})",
                self.page_size()
            )));
        }
        Ok(offset)
    }

    /// Verifies the layout invariants, given the length of the entry stored in each slot:
    /// - every slot points into `[hf_offset, page_size)`,
    /// - entries are disjoint and packed without gaps up to the end of the page,
    /// - the slot directory does not reach into the entries region.
    pub fn check_invariants(&self, entry_lengths: &[usize]) -> Result<(), SlottedPageError> {
        let num_entries = self.num_entries()? as usize;
        if entry_lengths.len() != num_entries {
            return Err(SlottedPageError::Corrupted(format!(
                "{} entry lengths given for {num_entries} slots",
                entry_lengths.len()
            )));
        }
        self.free_space()?;
        let hf_offset = self.high_water_offset()? as usize;

        let mut ranges: Vec<(usize, usize)> = self
            .slot_offsets()?
            .into_iter()
            .zip(entry_lengths)
            .map(|(offset, len)| (offset as usize, offset as usize + len))
            .collect();
        ranges.sort_unstable();

        let mut expected_start = hf_offset;
        for (start, end) in ranges {
            if start != expected_start {
                return Err(SlottedPageError::Corrupted(format!(
                    "entry at {start} does not start where the previous one ended ({expected_start})"
                )));
            }
            expected_start = end;
        }
        if expected_start != self.page_size() {
            return Err(SlottedPageError::Corrupted(format!(
                "entries end at {expected_start} instead of the end of the page"
            )));
        }
        Ok(())
    }
}

impl<P: PageRead + PageWrite> SlottedPage<P> {
    fn header_mut(&mut self) -> Result<&mut PageHeader, SlottedPageError> {
        Ok(bytemuck::try_from_bytes_mut(
            &mut self.page.data_mut()[..HEADER_SIZE],
        )?)
    }

    pub fn inner_mut(&mut self) -> &mut P {
        &mut self.page
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        set_page_lsn(self.page.data_mut(), lsn);
    }

    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    pub fn mark_dirty(&mut self) {
        self.page.mark_dirty();
    }

    fn set_raw_slot(&mut self, slot: SlotId, offset: u16) {
        let pos = slot_position(slot as usize);
        self.page.data_mut()[pos..pos + SLOT_WIDTH].copy_from_slice(&offset.to_ne_bytes());
    }

    fn ensure_dirty(&self) -> Result<(), SlottedPageError> {
        if !self.page.is_dirty() {
            return Err(SlottedPageError::PageNotDirty);
        }
        Ok(())
    }

    /// Checks everything [`SlottedPage::remove_entry_unlogged`] relies on and returns the offset
    /// of the entry to remove.
    pub(crate) fn validate_remove(
        &self,
        indx: SlotId,
        nbytes: u16,
    ) -> Result<u16, SlottedPageError> {
        self.ensure_dirty()?;
        self.free_space()?;
        self.entry_offset(indx, nbytes)
    }

    /// Checks everything [`SlottedPage::insert_entry_unlogged`] relies on.
    pub(crate) fn validate_insert(
        &self,
        indx: SlotId,
        nbytes: u16,
        source: &EntrySource<'_>,
    ) -> Result<(), SlottedPageError> {
        self.ensure_dirty()?;
        let num_entries = self.num_entries()?;
        if indx > num_entries {
            return Err(SlottedPageError::InvalidSlot {
                num_entries,
                slot: indx,
            });
        }
        let encoded = source.encoded_len();
        if encoded > nbytes as usize {
            return Err(SlottedPageError::EntryTooLarge {
                encoded,
                nbytes: nbytes as usize,
            });
        }

        let pgno = self.pgno()?;
        let available = self.free_space()?;
        let requested = nbytes as usize;
        if requested + SLOT_WIDTH > available {
            match self.config.space_policy {
                SpacePolicy::ReturnError => {
                    return Err(SlottedPageError::InsufficientSpace {
                        requested,
                        available,
                    });
                }
                SpacePolicy::Abort => panic!(
                    "insert of {requested} bytes into page {pgno} with only {available} free bytes"
                ),
            }
        }
        Ok(())
    }

    /// Removes the `nbytes` long entry stored in slot `indx` and packs the remaining entries at
    /// the end of the page. Does not log.
    ///
    /// Other entries keep their content, only their offsets and slot positions change.
    pub fn remove_entry_unlogged(
        &mut self,
        indx: SlotId,
        nbytes: u16,
    ) -> Result<(), SlottedPageError> {
        let offset = self.validate_remove(indx, nbytes)?;
        let num_entries = self.num_entries()?;
        let page_size = self.page_size() as u16;

        // Nothing left to pack.
        if num_entries == 1 {
            let header = self.header_mut()?;
            header.entries = 0;
            header.hf_offset = page_size;
            trace!("removed the only entry of page {}", self.pgno()?);
            return Ok(());
        }

        // Entries stored below the removed one move up by `nbytes`, the regions may overlap.
        let hf_offset = self.high_water_offset()?;
        self.page.data_mut().copy_within(
            hf_offset as usize..offset as usize,
            (hf_offset + nbytes) as usize,
        );

        for slot in 0..num_entries {
            let slot_offset = self.raw_slot(slot);
            if slot_offset < offset {
                self.set_raw_slot(slot, slot_offset + nbytes);
            }
        }

        let remaining = num_entries - 1;
        if indx != remaining {
            self.page.data_mut().copy_within(
                slot_position(indx as usize + 1)..slot_position(num_entries as usize),
                slot_position(indx as usize),
            );
        }

        let header = self.header_mut()?;
        header.hf_offset = hf_offset + nbytes;
        header.entries = remaining;
        trace!(
            "removed {nbytes} byte entry from slot {indx} of page {}",
            self.pgno()?
        );
        Ok(())
    }

    /// Writes a new `nbytes` long entry and makes it slot `indx`, shifting slots at and after
    /// `indx` up by one. Does not log.
    ///
    /// Encoded entries shorter than `nbytes` are followed by zero padding. Fails without touching
    /// the page if the entry and its slot don't fit.
    pub fn insert_entry_unlogged(
        &mut self,
        indx: SlotId,
        nbytes: u16,
        source: EntrySource<'_>,
    ) -> Result<(), SlottedPageError> {
        self.validate_insert(indx, nbytes, &source)?;
        let num_entries = self.num_entries()?;
        let offset = self.high_water_offset()? - nbytes;

        if indx != num_entries {
            self.page.data_mut().copy_within(
                slot_position(indx as usize)..slot_position(num_entries as usize),
                slot_position(indx as usize + 1),
            );
        }
        self.set_raw_slot(indx, offset);

        let start = offset as usize;
        source.write_into(&mut self.page.data_mut()[start..start + nbytes as usize])?;

        let header = self.header_mut()?;
        header.hf_offset = offset;
        header.entries = num_entries + 1;
        trace!(
            "inserted {nbytes} byte entry at slot {indx} of page {}",
            self.pgno()?
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{keydata_size, read_keydata};
    use storage::page::{PageBuf, PageType};

    fn dirty_page(page_size: usize) -> SlottedPage<PageBuf> {
        let mut page = PageBuf::new(page_size, 3, PageType::LeafBtree).unwrap();
        page.mark_dirty();
        SlottedPage::new(page)
    }

    fn filled(byte: u8, len: usize) -> Vec<u8> {
        vec![byte; len]
    }

    /// Inserts `entries` at consecutive slots starting from 0.
    fn with_entries(page_size: usize, entries: &[Vec<u8>]) -> SlottedPage<PageBuf> {
        let mut page = dirty_page(page_size);
        for (slot, entry) in entries.iter().enumerate() {
            page.insert_entry_unlogged(
                slot as SlotId,
                entry.len() as u16,
                EntrySource::Prebuilt(entry),
            )
            .unwrap();
        }
        page
    }

    fn assert_entries(page: &SlottedPage<PageBuf>, expected: &[Vec<u8>]) {
        assert_eq!(page.num_entries().unwrap() as usize, expected.len());
        for (slot, entry) in expected.iter().enumerate() {
            assert_eq!(
                page.entry_bytes(slot as SlotId, entry.len() as u16)
                    .unwrap(),
                entry.as_slice(),
                "content of slot {slot}"
            );
        }
        let lengths: Vec<usize> = expected.iter().map(Vec::len).collect();
        page.check_invariants(&lengths).unwrap();
    }

    #[test]
    fn empty_page_layout() {
        let page = dirty_page(4096);

        assert_eq!(page.num_entries().unwrap(), 0);
        assert_eq!(page.high_water_offset().unwrap(), 4096);
        assert_eq!(page.free_space().unwrap(), 4096 - 26);
        page.check_invariants(&[]).unwrap();
    }

    #[test]
    fn insert_three_then_remove_middle() {
        // given three entries of 20, 30 and 25 bytes at slots 0, 1, 2
        let entries = vec![filled(1, 20), filled(2, 30), filled(3, 25)];
        let mut page = with_entries(4096, &entries);

        assert_eq!(page.num_entries().unwrap(), 3);
        assert_eq!(page.high_water_offset().unwrap(), 4021);
        assert_eq!(page.free_space().unwrap(), 3989);
        assert_eq!(page.slot_offsets().unwrap(), vec![4076, 4046, 4021]);

        // when the middle one is removed
        page.remove_entry_unlogged(1, 30).unwrap();

        // then the entry packed below it moved up by 30 bytes and both survivors are intact
        assert_eq!(page.num_entries().unwrap(), 2);
        assert_eq!(page.high_water_offset().unwrap(), 4051);
        assert_eq!(page.slot_offsets().unwrap(), vec![4076, 4051]);
        assert_entries(&page, &[entries[0].clone(), entries[2].clone()]);
    }

    #[test]
    fn insert_in_the_middle_shifts_slots() {
        // given two entries
        let mut page = with_entries(1024, &[filled(1, 8), filled(2, 12)]);

        // when an entry is inserted between them
        page.insert_entry_unlogged(1, 16, EntrySource::Prebuilt(&filled(9, 16)))
            .unwrap();

        // then it takes slot 1 and the previous slot 1 becomes slot 2
        assert_entries(&page, &[filled(1, 8), filled(9, 16), filled(2, 12)]);
        assert_eq!(page.slot_offset(1).unwrap(), 1024 - 8 - 12 - 16);
    }

    #[test]
    fn insert_at_front() {
        let mut page = with_entries(1024, &[filled(1, 8)]);

        page.insert_entry_unlogged(0, 4, EntrySource::Prebuilt(&filled(7, 4)))
            .unwrap();

        assert_entries(&page, &[filled(7, 4), filled(1, 8)]);
    }

    #[test]
    fn remove_only_entry_resets_page() {
        // given a page with a single entry
        let mut page = with_entries(4096, &[filled(5, 40)]);
        let before = page.inner().data()[4056..].to_vec();

        // when it's removed
        page.remove_entry_unlogged(0, 40).unwrap();

        // then the page is empty and the old bytes were not moved
        assert_eq!(page.num_entries().unwrap(), 0);
        assert_eq!(page.high_water_offset().unwrap(), 4096);
        assert_eq!(page.free_space().unwrap(), 4096 - 26);
        assert_eq!(&page.inner().data()[4056..], before.as_slice());
    }

    #[test]
    fn remove_first_and_last_slots() {
        let entries = vec![filled(1, 10), filled(2, 20), filled(3, 30), filled(4, 40)];
        let mut page = with_entries(2048, &entries);

        page.remove_entry_unlogged(3, 40).unwrap();
        assert_entries(&page, &entries[..3]);

        page.remove_entry_unlogged(0, 10).unwrap();
        assert_entries(&page, &entries[1..3]);
    }

    #[test]
    fn insert_then_remove_restores_page() {
        // given a page with some entries
        let entries = vec![filled(1, 12), filled(2, 24), filled(3, 36)];
        let mut page = with_entries(1024, &entries);
        let offsets = page.slot_offsets().unwrap();
        let free = page.free_space().unwrap();

        // when an entry is inserted and immediately removed again
        page.insert_entry_unlogged(1, 20, EntrySource::Prebuilt(&filled(8, 20)))
            .unwrap();
        page.remove_entry_unlogged(1, 20).unwrap();

        // then the page looks as before
        assert_eq!(page.slot_offsets().unwrap(), offsets);
        assert_eq!(page.free_space().unwrap(), free);
        assert_entries(&page, &entries);
    }

    #[test]
    fn free_space_accounts_for_entry_and_slot() {
        let mut page = with_entries(1024, &[filled(1, 12)]);
        let free = page.free_space().unwrap();
        let hf_offset = page.high_water_offset().unwrap();

        page.insert_entry_unlogged(0, 30, EntrySource::Prebuilt(&filled(2, 30)))
            .unwrap();
        assert_eq!(page.high_water_offset().unwrap(), hf_offset - 30);
        assert_eq!(page.free_space().unwrap(), free - 30 - SLOT_WIDTH);

        page.remove_entry_unlogged(0, 30).unwrap();
        assert_eq!(page.high_water_offset().unwrap(), hf_offset);
        assert_eq!(page.free_space().unwrap(), free);
    }

    #[test]
    fn insufficient_space_leaves_page_untouched() {
        // given an almost full page
        let mut page = with_entries(512, &[filled(1, 200), filled(2, 200)]);
        let before = page.inner().data().to_vec();
        let free = page.free_space().unwrap();

        // when an entry larger than the free space is inserted
        let result = page.insert_entry_unlogged(1, free as u16, EntrySource::Prebuilt(&[]));

        // then an error is returned and not a single byte changed
        assert!(matches!(
            result,
            Err(SlottedPageError::InsufficientSpace { requested, available })
                if requested == free && available == free
        ));
        assert_eq!(page.inner().data(), before.as_slice());
    }

    #[test]
    fn entry_filling_the_page_exactly_fits() {
        let mut page = dirty_page(512);
        let nbytes = (page.free_space().unwrap() - SLOT_WIDTH) as u16;

        page.insert_entry_unlogged(0, nbytes, EntrySource::Prebuilt(&[]))
            .unwrap();

        assert_eq!(page.free_space().unwrap(), 0);
        page.check_invariants(&[nbytes as usize]).unwrap();
    }

    #[test]
    #[should_panic(expected = "into page 1 with only 486 free bytes")]
    fn abort_policy_panics_on_insufficient_space() {
        let mut buf = PageBuf::new(512, 1, PageType::LeafBtree).unwrap();
        buf.mark_dirty();
        let config = MutatorConfig::default().with_space_policy(SpacePolicy::Abort);
        let mut page = SlottedPage::with_config(buf, config);

        let _ = page.insert_entry_unlogged(0, 1000, EntrySource::Prebuilt(&[]));
    }

    #[test]
    fn invalid_slots_are_rejected() {
        let mut page = with_entries(1024, &[filled(1, 8), filled(2, 8)]);
        let before = page.inner().data().to_vec();

        assert!(matches!(
            page.remove_entry_unlogged(2, 8),
            Err(SlottedPageError::InvalidSlot {
                num_entries: 2,
                slot: 2
            })
        ));
        assert!(matches!(
            page.insert_entry_unlogged(3, 8, EntrySource::Prebuilt(&[0; 8])),
            Err(SlottedPageError::InvalidSlot {
                num_entries: 2,
                slot: 3
            })
        ));
        assert_eq!(page.inner().data(), before.as_slice());
    }

    #[test]
    fn remove_past_end_of_page_is_rejected() {
        let mut page = with_entries(1024, &[filled(1, 8)]);

        assert!(matches!(
            page.remove_entry_unlogged(0, 9),
            Err(SlottedPageError::Corrupted(_))
        ));
        assert_eq!(page.num_entries().unwrap(), 1);
    }

    fn corrupt_header(page: &mut SlottedPage<PageBuf>, entries: u16, hf_offset: u16) {
        let header: &mut PageHeader =
            bytemuck::from_bytes_mut(&mut page.inner_mut().data_mut()[..HEADER_SIZE]);
        header.entries = entries;
        header.hf_offset = hf_offset;
    }

    #[test]
    fn high_water_offset_past_page_end_is_rejected() {
        // given a page whose header claims entries start beyond its end
        let mut page = dirty_page(512);
        corrupt_header(&mut page, 0, 60000);
        let before = page.inner().data().to_vec();

        // when an entry is inserted
        let result = page.insert_entry_unlogged(0, 4, EntrySource::Prebuilt(&[1, 2, 3, 4]));

        // then the corruption is reported and nothing was written
        assert!(matches!(result, Err(SlottedPageError::Corrupted(_))));
        assert_eq!(page.inner().data(), before.as_slice());
        assert!(matches!(
            page.free_space(),
            Err(SlottedPageError::Corrupted(_))
        ));
    }

    #[test]
    fn slot_directory_past_page_end_is_rejected() {
        // given a page with more slots than the page can hold
        let mut page = with_entries(512, &[filled(1, 8)]);
        corrupt_header(&mut page, 1000, 504);
        let before = page.inner().data().to_vec();

        // then no slot is read past the end of the buffer
        assert!(matches!(
            page.remove_entry_unlogged(999, 8),
            Err(SlottedPageError::Corrupted(_))
        ));
        assert!(matches!(
            page.slot_offset(999),
            Err(SlottedPageError::Corrupted(_))
        ));
        assert!(matches!(
            page.slot_offsets(),
            Err(SlottedPageError::Corrupted(_))
        ));
        assert!(matches!(
            page.insert_entry_unlogged(0, 4, EntrySource::Prebuilt(&[0; 4])),
            Err(SlottedPageError::Corrupted(_))
        ));
        assert_eq!(page.inner().data(), before.as_slice());
    }

    #[test]
    fn clean_page_is_not_modified() {
        let buf = PageBuf::new(1024, 1, PageType::LeafBtree).unwrap();
        let mut page = SlottedPage::new(buf);

        assert!(matches!(
            page.insert_entry_unlogged(0, 8, EntrySource::KeyData(b"abc")),
            Err(SlottedPageError::PageNotDirty)
        ));
        assert_eq!(page.num_entries().unwrap(), 0);
    }

    #[test]
    fn oversized_source_is_rejected() {
        let mut page = dirty_page(1024);

        assert!(matches!(
            page.insert_entry_unlogged(0, 4, EntrySource::KeyData(b"abcdef")),
            Err(SlottedPageError::EntryTooLarge {
                encoded: 9,
                nbytes: 4
            })
        ));
    }

    #[test]
    fn keydata_entry_is_readable() {
        // given a plain entry inserted with a synthesized header
        let mut page = dirty_page(1024);
        let nbytes = keydata_size(2) as u16;
        page.insert_entry_unlogged(0, nbytes, EntrySource::KeyData(b"hi"))
            .unwrap();

        // then it can be decoded back
        let (header, payload) = read_keydata(page.entry_at(0).unwrap()).unwrap();
        assert_eq!({ header.len }, 2);
        assert_eq!(payload, b"hi");
        // and the alignment padding is zeroed
        assert_eq!(nbytes, 8);
        assert_eq!(&page.entry_bytes(0, nbytes).unwrap()[5..], &[0u8; 3]);
    }

    #[test]
    fn works_on_borrowed_page() {
        let mut buf = PageBuf::new(1024, 1, PageType::LeafBtree).unwrap();
        buf.mark_dirty();

        {
            let mut page = SlottedPage::new(&mut buf);
            page.insert_entry_unlogged(0, 4, EntrySource::Prebuilt(&[1, 2, 3, 4]))
                .unwrap();
        }

        assert_eq!(SlottedPage::new(&buf).num_entries().unwrap(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert { seed: u16, len: u16 },
            Remove { seed: u16 },
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (any::<u16>(), 1u16..300).prop_map(|(seed, len)| Op::Insert { seed, len }),
                any::<u16>().prop_map(|seed| Op::Remove { seed }),
            ]
        }

        proptest! {
            #[test]
            fn layout_invariants_hold_for_any_sequence(ops in prop::collection::vec(op(), 1..120)) {
                let mut page = dirty_page(2048);
                // Entries in slot order, as the caller sees them.
                let mut model: Vec<Vec<u8>> = Vec::new();

                for (step, op) in ops.into_iter().enumerate() {
                    match op {
                        Op::Insert { seed, len } => {
                            let indx = seed % (model.len() as u16 + 1);
                            let entry: Vec<u8> = (0..len).map(|i| (step as u16 ^ i) as u8).collect();
                            let free = page.free_space().unwrap();
                            let before = page.inner().data().to_vec();
                            let result = page.insert_entry_unlogged(indx, len, EntrySource::Prebuilt(&entry));
                            if len as usize + SLOT_WIDTH <= free {
                                prop_assert!(result.is_ok());
                                prop_assert_eq!(page.free_space().unwrap(), free - len as usize - SLOT_WIDTH);
                                model.insert(indx as usize, entry);
                            } else {
                                let is_space_error = matches!(result, Err(SlottedPageError::InsufficientSpace { .. }));
                                prop_assert!(is_space_error);
                                prop_assert_eq!(page.inner().data(), before.as_slice());
                            }
                        }
                        Op::Remove { seed } => {
                            if model.is_empty() {
                                continue;
                            }
                            let indx = seed % model.len() as u16;
                            let free = page.free_space().unwrap();
                            let entry = model.remove(indx as usize);
                            page.remove_entry_unlogged(indx, entry.len() as u16).unwrap();
                            prop_assert_eq!(page.free_space().unwrap(), free + entry.len() + SLOT_WIDTH);
                        }
                    }

                    let lengths: Vec<usize> = model.iter().map(Vec::len).collect();
                    prop_assert!(page.check_invariants(&lengths).is_ok());
                    for (slot, entry) in model.iter().enumerate() {
                        prop_assert_eq!(page.entry_bytes(slot as SlotId, entry.len() as u16).unwrap(), entry.as_slice());
                    }
                }
            }
        }
    }
}
