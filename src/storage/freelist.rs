//! # Free Chunk Management
//!
//! Every region keeps its free chunks on a singly linked chain threaded
//! through the free chunks themselves. The chain head is `first_free` in the
//! region header; each free chunk stores the offset of the next one (see
//! [`header`](crate::chunk::header) for the encoding).
//!
//! ## Chain Invariants
//!
//! After every operation in this module:
//!
//! 1. The chain is sorted by offset.
//! 2. No two free chunks are byte-adjacent (the chain is fully coalesced).
//! 3. `Region::free_count`, `free_bytes` and `largest_free_chunk` describe
//!    the chain exactly.
//!
//! ## Splitting
//!
//! ```text
//! Align::Left                       Align::Right
//! +---------+-----------+           +-----------+---------+
//! | new     | remainder |           | remainder | new     |
//! +---------+-----------+           +-----------+---------+
//! ^ hole offset                     ^ hole offset
//! ```
//!
//! `Align::Auto` takes the left edge of the chain head and the right edge of
//! any other hole. That keeps the head hole's remainder at the top of the
//! chain and avoids relinking a predecessor for every other split.
//!
//! A split must leave either nothing or at least `MIN_REMNANT_LEN` bytes;
//! callers pick holes with [`fits_in_space`] to guarantee it.
//!
//! ## Ownership
//!
//! The functions here do not write used chunks and do not touch deref
//! totals; callers write the chunk into the returned space and account for
//! its deref count themselves.

use eyre::Result;

use super::region::{first_free, set_first_free, Region};
use crate::chunk::header::{self, full_len_at, next_free, set_next_free, write_free};
use crate::config::MIN_REMNANT_LEN;
use crate::error::FatalStorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    /// Left edge for the chain head, right edge otherwise.
    Auto,
    /// New chunk at the hole's left edge, remainder on the right.
    Left,
    /// New chunk at the hole's right edge, remainder on the left.
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    None,
    /// The hole is exactly the requested size.
    Exact,
    /// Splitting the hole leaves a legal remainder.
    Split,
}

impl Fit {
    #[inline]
    pub fn fits(self) -> bool {
        self != Fit::None
    }
}

/// Whether a chunk of `full_len` bytes can be carved out of `capacity`.
#[inline]
pub fn fits_in_space(full_len: u16, capacity: u16) -> Fit {
    if full_len == capacity {
        Fit::Exact
    } else if usize::from(full_len) + MIN_REMNANT_LEN <= usize::from(capacity) {
        Fit::Split
    } else {
        Fit::None
    }
}

/// Walks the chain for the free chunk whose next link is `offset`.
fn predecessor(page: &[u8], region_id: u16, offset: u16) -> Result<u16> {
    let mut prev = first_free(page)?;
    while prev != 0 {
        let next = next_free(page, prev);
        if next == offset {
            return Ok(prev);
        }
        prev = next;
    }
    Err(FatalStorageError::corrupt(
        region_id,
        format!("free chunk {:#06x} is not on the free chain", offset),
    )
    .into())
}

/// Replaces the chain link that points at `old` with `new`.
fn relink(page: &mut [u8], region_id: u16, old: u16, new: u16) -> Result<()> {
    if first_free(page)? == old {
        set_first_free(page, new)
    } else {
        let prev = predecessor(page, region_id, old)?;
        set_next_free(page, prev, new);
        Ok(())
    }
}

/// Size of the largest free chunk on the chain.
pub fn largest_hole(page: &[u8]) -> Result<u16> {
    let mut largest = 0;
    let mut offset = first_free(page)?;
    while offset != 0 {
        largest = largest.max(full_len_at(page, offset));
        offset = next_free(page, offset);
    }
    Ok(largest)
}

/// Merges the free chunk at `offset` with its chain successor when the two
/// are byte-adjacent.
pub fn coalesce_frees(region: &mut Region, page: &mut [u8], offset: u16) {
    let len = full_len_at(page, offset);
    let next = next_free(page, offset);
    if next == 0 || usize::from(offset) + usize::from(len) != usize::from(next) {
        return;
    }

    let merged = len + full_len_at(page, next);
    let after = next_free(page, next);
    write_free(page, offset, merged, after);
    region.free_count -= 1;
    if region.largest_free_chunk < merged {
        region.largest_free_chunk = merged;
    }
}

/// Allocates `full_len` bytes out of the free chunk at `offset` and returns
/// the offset of the allocated space.
pub fn split_hole(
    region: &mut Region,
    page: &mut [u8],
    region_id: u16,
    offset: u16,
    full_len: u16,
    align: Align,
) -> Result<u16> {
    let hole_len = full_len_at(page, offset);
    let next = next_free(page, offset);

    region.used_count += 1;

    if hole_len == full_len {
        relink(page, region_id, offset, next)?;
        region.free_count -= 1;
        region.free_bytes -= full_len;
        if region.largest_free_chunk == hole_len {
            region.largest_free_chunk = largest_hole(page)?;
        }
        return Ok(offset);
    }

    let align = match align {
        Align::Auto if first_free(page)? == offset => Align::Left,
        Align::Auto => Align::Right,
        other => other,
    };

    let placed = match align {
        Align::Left => {
            let remainder = offset + full_len;
            write_free(page, remainder, hole_len - full_len, next);
            relink(page, region_id, offset, remainder)?;
            offset
        }
        _ => {
            write_free(page, offset, hole_len - full_len, next);
            offset + hole_len - full_len
        }
    };

    region.free_bytes -= full_len;
    if region.largest_free_chunk == hole_len {
        region.largest_free_chunk = largest_hole(page)?;
    }
    Ok(placed)
}

/// Turns the used chunk at `offset` into a free chunk, links it into the
/// chain in offset order and coalesces it with both neighbours.
pub fn free_chunk(region: &mut Region, page: &mut [u8], offset: u16) -> Result<()> {
    let full_len = full_len_at(page, offset);

    region.total_derefs -= u32::from(header::deref_at(page, offset));
    region.used_count -= 1;
    region.free_count += 1;
    region.free_bytes += full_len;
    if region.largest_free_chunk < full_len {
        region.largest_free_chunk = full_len;
    }

    let head = first_free(page)?;
    let left = if head == 0 {
        write_free(page, offset, full_len, 0);
        region.largest_free_chunk = full_len;
        set_first_free(page, offset)?;
        None
    } else if head > offset {
        write_free(page, offset, full_len, head);
        set_first_free(page, offset)?;
        None
    } else {
        let mut left = head;
        let mut next = next_free(page, left);
        while next != 0 && next < offset {
            left = next;
            next = next_free(page, left);
        }
        write_free(page, offset, full_len, next);
        set_next_free(page, left, offset);
        Some(left)
    };

    coalesce_frees(region, page, offset);
    if let Some(left) = left {
        coalesce_frees(region, page, left);
    }
    Ok(())
}

/// Swaps the used chunk at `chunk` with the free chunk `hole` it touches.
/// The chunk keeps its bytes and moves to the far side of the hole; the
/// hole reappears where the chunk was and is coalesced with whatever free
/// space it now touches. Returns the chunk's new offset.
pub fn slide_chunk(
    region: &mut Region,
    page: &mut [u8],
    region_id: u16,
    hole: u16,
    chunk: u16,
) -> Result<u16> {
    let hole_len = full_len_at(page, hole);
    let next = next_free(page, hole);
    let chunk_len = full_len_at(page, chunk);
    let span = usize::from(chunk)..usize::from(chunk) + usize::from(chunk_len);

    let (placed, freed) = if chunk > hole {
        page.copy_within(span, usize::from(hole));
        (hole, hole + chunk_len)
    } else {
        let placed = hole + hole_len - chunk_len;
        page.copy_within(span, usize::from(placed));
        (placed, chunk)
    };

    write_free(page, freed, hole_len, next);
    coalesce_frees(region, page, freed);
    if first_free(page)? == hole {
        set_first_free(page, freed)?;
    } else {
        let prev = predecessor(page, region_id, hole)?;
        set_next_free(page, prev, freed);
        coalesce_frees(region, page, prev);
    }
    Ok(placed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::header::{is_free, write_used};
    use crate::config::{FIRST_CHUNK_OFFSET, REGION_CAPACITY, REGION_SIZE};
    use crate::storage::region::{chunk_offsets, format_page};

    fn fresh() -> (Region, Vec<u8>) {
        let mut page = vec![0u8; REGION_SIZE];
        format_page(&mut page, 0);
        (Region::new(0), page)
    }

    fn alloc(region: &mut Region, page: &mut [u8], data: &[u8]) -> u16 {
        let full = header::full_len_for(data.len());
        let hole = first_free(page).unwrap();
        let at = split_hole(region, page, 0, hole, full, Align::Auto).unwrap();
        write_used(page, at, data, 0);
        at
    }

    fn chain(page: &[u8]) -> Vec<(u16, u16)> {
        let mut out = Vec::new();
        let mut offset = first_free(page).unwrap();
        while offset != 0 {
            out.push((offset, full_len_at(page, offset)));
            offset = next_free(page, offset);
        }
        out
    }

    #[test]
    fn test_fits_in_space() {
        assert_eq!(fits_in_space(10, 10), Fit::Exact);
        assert_eq!(fits_in_space(10, 13), Fit::Split);
        assert_eq!(fits_in_space(10, 12), Fit::None);
        assert_eq!(fits_in_space(10, 9), Fit::None);
        assert!(!fits_in_space(10, 11).fits());
    }

    #[test]
    fn test_split_head_hole_takes_left_edge() {
        let (mut region, mut page) = fresh();
        let at = alloc(&mut region, &mut page, b"hello");

        assert_eq!(at, FIRST_CHUNK_OFFSET);
        assert_eq!(chain(&page), vec![(FIRST_CHUNK_OFFSET + 7, REGION_CAPACITY as u16 - 7)]);
        assert_eq!(region.used_count, 1);
        assert_eq!(region.free_count, 1);
        assert_eq!(region.free_bytes as usize, REGION_CAPACITY - 7);
        assert_eq!(region.largest_free_chunk as usize, REGION_CAPACITY - 7);
    }

    #[test]
    fn test_split_right_keeps_remainder_in_place() {
        let (mut region, mut page) = fresh();
        let at = split_hole(&mut region, &mut page, 0, FIRST_CHUNK_OFFSET, 10, Align::Right).unwrap();

        assert_eq!(at as usize, REGION_SIZE - 10);
        assert_eq!(chain(&page), vec![(FIRST_CHUNK_OFFSET, REGION_CAPACITY as u16 - 10)]);
    }

    #[test]
    fn test_exact_fit_unlinks_hole() {
        let (mut region, mut page) = fresh();
        let at = split_hole(
            &mut region,
            &mut page,
            0,
            FIRST_CHUNK_OFFSET,
            REGION_CAPACITY as u16,
            Align::Auto,
        )
        .unwrap();

        assert_eq!(at, FIRST_CHUNK_OFFSET);
        assert_eq!(first_free(&page).unwrap(), 0);
        assert_eq!(region.free_count, 0);
        assert_eq!(region.free_bytes, 0);
        assert_eq!(region.largest_free_chunk, 0);
    }

    #[test]
    fn test_free_coalesces_both_neighbours() {
        let (mut region, mut page) = fresh();
        let a = alloc(&mut region, &mut page, b"aaaa");
        let b = alloc(&mut region, &mut page, b"bbbb");
        let c = alloc(&mut region, &mut page, b"cccc");
        let _d = alloc(&mut region, &mut page, b"dddd");

        free_chunk(&mut region, &mut page, a).unwrap();
        free_chunk(&mut region, &mut page, c).unwrap();
        assert_eq!(chain(&page).len(), 3);
        assert_eq!(region.free_count, 3);

        free_chunk(&mut region, &mut page, b).unwrap();
        assert_eq!(chain(&page)[0], (a, 18));
        assert_eq!(region.free_count, 2);
        assert_eq!(region.used_count, 1);
        assert!(is_free(&page, a));
    }

    #[test]
    fn test_free_into_full_region_resets_largest() {
        let (mut region, mut page) = fresh();
        let data = vec![1u8; REGION_CAPACITY - 4];
        let at = alloc(&mut region, &mut page, &data);
        assert_eq!(region.free_count, 0);

        free_chunk(&mut region, &mut page, at).unwrap();
        assert_eq!(first_free(&page).unwrap(), at);
        assert_eq!(region.largest_free_chunk as usize, REGION_CAPACITY);
        assert_eq!(region.free_bytes as usize, REGION_CAPACITY);
    }

    #[test]
    fn test_slide_chunk_left_into_hole() {
        let (mut region, mut page) = fresh();
        let _a = alloc(&mut region, &mut page, b"aaaa");
        let b = alloc(&mut region, &mut page, b"bbbb");
        let c = alloc(&mut region, &mut page, b"cccc");
        free_chunk(&mut region, &mut page, b).unwrap();

        let placed = slide_chunk(&mut region, &mut page, 0, b, c).unwrap();

        assert_eq!(placed, b);
        assert_eq!(header::data_at(&page, placed), b"cccc");
        assert_eq!(chain(&page)[0].0, b + 6);
        assert_eq!(chain(&page).len(), 1);
        assert_eq!(region.free_count, 1);
    }

    #[test]
    fn test_slide_chunk_right_into_hole() {
        let (mut region, mut page) = fresh();
        let _a = alloc(&mut region, &mut page, b"aaaa");
        let b = alloc(&mut region, &mut page, b"bbbb");
        let c = alloc(&mut region, &mut page, b"cccc");
        let _d = alloc(&mut region, &mut page, b"dddd");
        free_chunk(&mut region, &mut page, c).unwrap();

        let placed = slide_chunk(&mut region, &mut page, 0, c, b).unwrap();

        assert_eq!(placed, c);
        assert_eq!(header::data_at(&page, placed), b"bbbb");
        assert_eq!(chain(&page)[0], (b, 6));
        assert_eq!(region.free_count, 2);
    }

    #[test]
    fn test_slide_relinks_predecessor_and_coalesces() {
        let (mut region, mut page) = fresh();
        let a = alloc(&mut region, &mut page, b"aaaa");
        let _b = alloc(&mut region, &mut page, b"bbbb");
        let c = alloc(&mut region, &mut page, b"cccc");
        let d = alloc(&mut region, &mut page, b"dddd");
        free_chunk(&mut region, &mut page, a).unwrap();
        free_chunk(&mut region, &mut page, c).unwrap();
        assert_eq!(region.free_count, 3);

        let placed = slide_chunk(&mut region, &mut page, 0, c, d).unwrap();

        assert_eq!(placed, c);
        assert_eq!(header::data_at(&page, placed), b"dddd");
        let links = chain(&page);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0], (a, 6));
        assert_eq!(links[1].0, d);
        assert_eq!(region.free_count, 2);
        assert_eq!(largest_hole(&page).unwrap(), region.largest_free_chunk);
    }

    #[test]
    fn test_chain_stays_sorted_and_tiles_region() {
        let (mut region, mut page) = fresh();
        let offsets: Vec<u16> = (0..20)
            .map(|i| alloc(&mut region, &mut page, &vec![i as u8; 1 + i * 7]))
            .collect();
        for &o in offsets.iter().step_by(3) {
            free_chunk(&mut region, &mut page, o).unwrap();
        }

        let links = chain(&page);
        assert!(links.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(links
            .windows(2)
            .all(|w| usize::from(w[0].0) + usize::from(w[0].1) < usize::from(w[1].0)));

        let end = chunk_offsets(&page)
            .map(|o| usize::from(o) + usize::from(full_len_at(&page, o)))
            .last()
            .unwrap();
        assert_eq!(end, REGION_SIZE);
        assert_eq!(largest_hole(&page).unwrap(), region.largest_free_chunk);
        assert_eq!(
            links.iter().map(|&(_, l)| usize::from(l)).sum::<usize>(),
            usize::from(region.free_bytes)
        );
    }
}
