//! # Regions
//!
//! A region is a fixed-size block of `REGION_SIZE` bytes holding chunks back
//! to back. Regions are the unit of paging: each one is either resident in a
//! region cache buffer or lives only in the swap file at
//! `region_id * REGION_SIZE`.
//!
//! ## Buffer Layout
//!
//! ```text
//! +-----------------------+  offset 0
//! | RegionHeader (8B)     |  region_id, first_free, reserved
//! +-----------------------+  offset 8 (FIRST_CHUNK_OFFSET)
//! | chunk | chunk | free  |
//! | chunk | free  | chunk |  REGION_CAPACITY bytes, fully tiled by
//! | ...                   |  used and free chunks
//! +-----------------------+  offset REGION_SIZE
//! ```
//!
//! ## Accounting
//!
//! Each region also has a [`Region`] record that stays in memory while the
//! buffer is paged out. Placement decisions read only these records, so a
//! region never has to be paged in just to learn that a chunk will not fit.
//! The counters always equal what a full scan of the buffer would derive;
//! paranoid mode checks exactly that after every mutation.
//!
//! ## Deref Decay
//!
//! The store keeps a global period counter. When a region is touched in a
//! later period than it was last decayed, every used chunk's deref count is
//! shifted right once per missed period (or reset to zero after more than
//! `DEREF_RESET_PERIODS` periods). Free chunks are skipped: their deref slot
//! holds a free-chain link.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::chunk::header;
use crate::config::{
    DEREF_RESET_PERIODS, FIRST_CHUNK_OFFSET, NUM_ODDBALLS, REGION_CAPACITY, REGION_HEADER_SIZE,
    REGION_SIZE,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RegionHeader {
    region_id: U16,
    first_free: U16,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == REGION_HEADER_SIZE);

impl RegionHeader {
    pub fn new(region_id: u16, first_free: u16) -> Self {
        Self {
            region_id: U16::new(region_id),
            first_free: U16::new(first_free),
            reserved: [0u8; 4],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= REGION_HEADER_SIZE,
            "buffer too small for RegionHeader: {} < {}",
            bytes.len(),
            REGION_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..REGION_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse RegionHeader: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= REGION_HEADER_SIZE,
            "buffer too small for RegionHeader: {} < {}",
            bytes.len(),
            REGION_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..REGION_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse RegionHeader: {:?}", e))
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        bytes[..REGION_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    zerocopy_accessors! {
        region_id: u16,
        first_free: u16,
    }
}

/// Head of a region buffer's free chain, zero when the region is full.
pub fn first_free(page: &[u8]) -> Result<u16> {
    Ok(RegionHeader::from_bytes(page)?.first_free())
}

pub fn set_first_free(page: &mut [u8], offset: u16) -> Result<()> {
    RegionHeader::from_bytes_mut(page)?.set_first_free(offset);
    Ok(())
}

/// Lays out an empty region: header plus one free chunk spanning the
/// whole capacity.
pub fn format_page(page: &mut [u8], region_id: u16) {
    RegionHeader::new(region_id, FIRST_CHUNK_OFFSET).write_to(page);
    header::write_free(page, FIRST_CHUNK_OFFSET, REGION_CAPACITY as u16, 0);
}

/// Iterates the offsets of every chunk in a region buffer, used or free.
pub fn chunk_offsets(page: &[u8]) -> ChunkOffsets<'_> {
    ChunkOffsets {
        page,
        next: FIRST_CHUNK_OFFSET as usize,
    }
}

pub struct ChunkOffsets<'a> {
    page: &'a [u8],
    next: usize,
}

impl Iterator for ChunkOffsets<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.next >= REGION_SIZE.min(self.page.len()) {
            return None;
        }
        let offset = self.next;
        let full_len = header::ChunkHeader::try_decode(&self.page[offset..])?.full_len();
        self.next = offset + full_len as usize;
        Some(offset as u16)
    }
}

/// In-memory accounting for one region.
#[derive(Debug, Clone)]
pub struct Region {
    pub used_count: u16,
    pub free_count: u16,
    pub free_bytes: u16,
    pub largest_free_chunk: u16,
    pub total_derefs: u32,
    pub period_last_touched: u32,
    /// Cache slot holding the region, if resident.
    pub in_memory: Option<usize>,
    /// Chunks far from the region's average deref, recorded at page-out.
    pub oddballs: [u16; NUM_ODDBALLS],
}

impl Region {
    pub fn new(period: u32) -> Self {
        Self {
            used_count: 0,
            free_count: 1,
            free_bytes: REGION_CAPACITY as u16,
            largest_free_chunk: REGION_CAPACITY as u16,
            total_derefs: 0,
            period_last_touched: period,
            in_memory: None,
            oddballs: [0; NUM_ODDBALLS],
        }
    }

    /// Resets the accounting to that of a freshly formatted page.
    pub fn reset(&mut self, period: u32) {
        let in_memory = self.in_memory;
        *self = Self::new(period);
        self.in_memory = in_memory;
    }

    #[inline]
    pub fn is_resident(&self) -> bool {
        self.in_memory.is_some()
    }

    /// Total derefs as they would be after lazy decay to `period`.
    #[inline]
    fn decayed_total(&self, period: u32) -> u32 {
        let shift = period.saturating_sub(self.period_last_touched);
        self.total_derefs.checked_shr(shift).unwrap_or(0)
    }

    /// Average deref count of the region's chunks, decayed to `period`.
    pub fn average_derefs(&self, period: u32) -> u8 {
        if self.used_count == 0 {
            return 0;
        }
        (self.decayed_total(period) / u32::from(self.used_count)).min(255) as u8
    }

    /// Average deref count if a chunk with `derefs` were added.
    pub fn average_derefs_with(&self, period: u32, derefs: u8) -> u8 {
        ((self.decayed_total(period) + u32::from(derefs)) / (u32::from(self.used_count) + 1))
            .min(255) as u8
    }

    /// Brings deref counts in `page` up to `period`.
    pub fn decay(&mut self, page: &mut [u8], period: u32) {
        let shift = period.saturating_sub(self.period_last_touched);
        if shift == 0 {
            return;
        }

        let mut total = 0u32;
        let offsets: Vec<u16> = chunk_offsets(page).collect();
        for offset in offsets {
            if header::is_free(page, offset) {
                continue;
            }
            let deref = if shift > DEREF_RESET_PERIODS {
                0
            } else {
                header::deref_at(page, offset).checked_shr(shift).unwrap_or(0)
            };
            header::set_deref(page, offset, deref);
            total += u32::from(deref);
        }
        self.total_derefs = total;
        self.period_last_touched = period;
    }

    /// Records up to `NUM_ODDBALLS` used chunks whose deref count differs
    /// from the region average by at least `threshold`, most divergent first.
    pub fn find_oddballs(&mut self, page: &[u8], period: u32, threshold: u32) {
        let mean = i32::from(self.average_derefs(period));
        let mut found: SmallVec<[(u32, u16); NUM_ODDBALLS + 1]> = SmallVec::new();

        for offset in chunk_offsets(page) {
            if header::is_free(page, offset) {
                continue;
            }
            let divergence = (mean - i32::from(header::deref_at(page, offset))).unsigned_abs();
            if divergence < threshold {
                continue;
            }
            let at = found
                .iter()
                .position(|&(d, _)| divergence > d)
                .unwrap_or(found.len());
            if at < NUM_ODDBALLS {
                found.insert(at, (divergence, offset));
                found.truncate(NUM_ODDBALLS);
            }
        }

        self.oddballs = [0; NUM_ODDBALLS];
        for (slot, &(_, offset)) in self.oddballs.iter_mut().zip(found.iter()) {
            *slot = offset;
        }
    }

    pub fn is_oddball(&self, offset: u16) -> bool {
        offset != 0 && self.oddballs.contains(&offset)
    }
}
