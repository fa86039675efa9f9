//! # Migration Engine
//!
//! Callers periodically hand the store a batch of chunk references (the
//! server walks its objects a few at a time). Each chunk in the batch is
//! re-placed as if it were being created now, and moved when a better spot
//! exists. Over time this packs chunks of similar deref counts together:
//! hot chunks end up sharing resident regions, cold chunks drift into
//! regions that can stay in the swap file.
//!
//! ## Pass Structure
//!
//! ```text
//! migrate(refs)
//!   ├─ too many hot regions? ──▶ new_period()
//!   ├─ sort refs by value (groups them by region)
//!   └─ for each region with refs:
//!        paged out and no ref is an oddball ──▶ skip (not worth a page-in)
//!        migrate_region()
//!          for each ref in the region:
//!            find_best_region / find_best_offset
//!            hole touches the chunk ──▶ slide
//!            otherwise             ──▶ move (split hole left, copy, free)
//!          re-sort refs
//! ```
//!
//! References are rewritten in place, so the caller's copies stay valid.
//! A chunk moved into a higher-numbered region may be considered again when
//! the pass reaches that region.
//!
//! ## Periods
//!
//! A new period halves every deref count. It starts when more regions are
//! hot (average deref above `HOT_REGION_DEREFS`) than there are cache
//! buffers, or than half of all regions. Resident regions are decayed
//! immediately; paged-out regions catch up when they are next paged in.

use eyre::{eyre, Result};
use tracing::{debug, info};

use crate::chunk::header::{self, full_len_at};
use crate::chunk::ChunkReference;
use crate::config::{HOT_REGION_DEREFS, INVALID_REGION_ID};
use crate::error::FatalStorageError;
use crate::storage::freelist::{self, fits_in_space, Align};
use crate::store::ChunkStore;

fn sort_references(references: &mut [&mut ChunkReference]) {
    references.sort_by_key(|reference| **reference);
}

impl ChunkStore {
    /// Offers a batch of chunks for relocation. Every reference that moves
    /// is updated in place.
    pub fn migrate(&mut self, references: &mut [&mut ChunkReference]) -> Result<()> {
        debug!(count = references.len(), "migration starts");

        let period = self.stats.period;
        let hot = self
            .regions
            .iter()
            .filter(|r| r.average_derefs(period) > HOT_REGION_DEREFS)
            .count();
        if hot > self.cache.len() || hot > self.regions.len() / 2 {
            self.new_period();
        }

        sort_references(references);

        let mut index = 0;
        while index < self.regions.len() {
            let region = index as u16;
            index += 1;

            if !references.iter().any(|r| r.region() == region) {
                continue;
            }
            let record = &self.regions[usize::from(region)];
            if !record.is_resident()
                && !references
                    .iter()
                    .filter(|r| r.region() == region)
                    .any(|r| record.is_oddball(r.offset()))
            {
                continue;
            }
            self.migrate_region(region, references)?;
        }

        debug!("migration ends");
        Ok(())
    }

    /// Starts a new period: clears the per-period counters and halves the
    /// deref counts of every resident region.
    pub fn new_period(&mut self) {
        self.stats.reset_period();
        let period = self.stats.period;

        let slots: Vec<usize> = self.cache.iter_mru().collect();
        for slot in slots {
            let id = self.cache.region_of(slot);
            if id == INVALID_REGION_ID {
                continue;
            }
            self.regions[usize::from(id)].decay(self.cache.data_mut(slot), period);
        }
        info!(period, "new chunk period");
    }

    fn migrate_region(
        &mut self,
        region: u16,
        references: &mut [&mut ChunkReference],
    ) -> Result<()> {
        for j in 0..references.len() {
            let reference = *references[j];
            if !reference.is_in_region(region) {
                continue;
            }

            // an earlier move may have paged this region out again
            let (_, offset, slot) = self.locate(reference)?;
            let page = self.cache.data(slot);
            let derefs = header::deref_at(page, offset);
            let full_len = full_len_at(page, offset);

            let best_region = self.find_best_region(full_len, derefs, Some(region))?;
            if let Some(hole) = self.find_best_offset(full_len, best_region, Some(reference))? {
                *references[j] = self.migrate_move(best_region, hole, reference, Align::Left)?;
            }
            if best_region != region {
                self.stats.migrate_away += 1;
            }
        }
        sort_references(references);
        Ok(())
    }

    /// Moves the chunk at `source` into the free chunk at `hole` in region
    /// `dest`. Returns the chunk's new reference.
    fn migrate_move(
        &mut self,
        dest: u16,
        hole: u16,
        source: ChunkReference,
        align: Align,
    ) -> Result<ChunkReference> {
        let (s_reg, s_off) = (source.region(), source.offset());

        let dest_slot = self.bring_in_region(dest)?;
        if !self.regions[usize::from(s_reg)].is_resident() {
            self.cache.touch(dest_slot);
            self.bring_in_region(s_reg)?;
            self.cache.touch(dest_slot);
        }
        let src_slot = self.regions[usize::from(s_reg)]
            .in_memory
            .ok_or_else(|| eyre!("region {:#06x} not resident for migration", s_reg))?;

        let s_len = full_len_at(self.cache.data(src_slot), s_off);
        let h_len = full_len_at(self.cache.data(dest_slot), hole);
        let touching = usize::from(s_off) + usize::from(s_len) == usize::from(hole)
            || usize::from(hole) + usize::from(h_len) == usize::from(s_off);
        if s_reg == dest && touching {
            return self.migrate_slide(dest, hole, source);
        }

        if !fits_in_space(s_len, h_len).fits() {
            self.log.flush();
            return Err(FatalStorageError::corrupt(
                dest,
                format!(
                    "migrating {:#06x} bytes into a {:#06x} byte hole",
                    s_len, h_len
                ),
            )
            .into());
        }

        let span = usize::from(s_off)..usize::from(s_off) + usize::from(s_len);
        let record = &mut self.regions[usize::from(dest)];
        let placed = if src_slot == dest_slot {
            let page = self.cache.data_mut(dest_slot);
            let placed = freelist::split_hole(record, page, dest, hole, s_len, align)?;
            page.copy_within(span, usize::from(placed));
            placed
        } else {
            let (to, from) = self.cache.pair_mut(dest_slot, src_slot);
            let placed = freelist::split_hole(record, to, dest, hole, s_len, align)?;
            let at = usize::from(placed);
            to[at..at + usize::from(s_len)].copy_from_slice(&from[span]);
            placed
        };
        record.total_derefs += u32::from(header::deref_at(self.cache.data(dest_slot), placed));

        freelist::free_chunk(
            &mut self.regions[usize::from(s_reg)],
            self.cache.data_mut(src_slot),
            s_off,
        )?;
        self.stats.migrate_move += 1;

        let moved = ChunkReference::new(dest, placed);
        debug!(from = %source, to = %moved, "moved chunk");
        self.log.record(format_args!("move {} to {}", source, moved));

        self.check_region(dest)?;
        if s_reg != dest {
            self.check_region(s_reg)?;
        }
        Ok(moved)
    }

    /// Swaps a chunk with the hole it touches in its own region.
    fn migrate_slide(
        &mut self,
        region: u16,
        hole: u16,
        source: ChunkReference,
    ) -> Result<ChunkReference> {
        let slot = self.bring_in_region(region)?;
        let record = &mut self.regions[usize::from(region)];
        let placed = freelist::slide_chunk(
            record,
            self.cache.data_mut(slot),
            region,
            hole,
            source.offset(),
        )?;
        self.stats.migrate_slide += 1;

        let moved = ChunkReference::new(region, placed);
        debug!(from = %source, to = %moved, "slid chunk");
        self.log.record(format_args!("slide {} to {}", source, moved));

        self.check_region(region)?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ChunkConfig, REGION_SIZE};
    use crate::store::ChunkStore;

    fn store(dir: &tempfile::TempDir, cache_regions: usize) -> ChunkStore {
        let config = ChunkConfig::new(dir.path().join("chunkswap"))
            .with_swap_initial_kib(0)
            .with_cache_memory(cache_regions * REGION_SIZE)
            .with_paranoid(true);
        ChunkStore::init(config).unwrap()
    }

    #[test]
    fn test_chunk_slides_into_touching_hole() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        store.create(b"aaaa", 0).unwrap();
        let b = store.create(b"bbbb", 0).unwrap();
        let mut c = store.create(b"cccc", 0).unwrap();
        store.create(b"dddd", 0).unwrap();
        store.delete(b).unwrap();

        store.migrate(&mut [&mut c]).unwrap();

        assert_eq!(c, b);
        assert_eq!(store.statistics().migrate_slide, 1);
        assert_eq!(store.statistics().migrate_move, 0);
        assert_eq!(store.fetch_vec(c).unwrap(), b"cccc");
        store.verify_all().unwrap();
    }

    #[test]
    fn test_chunk_moves_into_earlier_hole() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        store.create(b"aaaa", 0).unwrap();
        let b = store.create(b"bbbb", 0).unwrap();
        store.create(b"cccc", 0).unwrap();
        let mut d = store.create(b"dddd", 3).unwrap();
        store.create(b"eeee", 0).unwrap();
        store.delete(b).unwrap();

        store.migrate(&mut [&mut d]).unwrap();

        assert_eq!(d, b);
        assert_eq!(store.statistics().migrate_move, 1);
        assert_eq!(store.statistics().migrate_away, 0);
        assert_eq!(store.derefs(d).unwrap(), 3);
        assert_eq!(store.fetch_vec(d).unwrap(), b"dddd");
        store.verify_all().unwrap();
    }

    #[test]
    fn test_hot_regions_start_new_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        let reference = store.create(b"warm", 200).unwrap();
        store.migrate(&mut []).unwrap();

        assert_eq!(store.period(), 1);
        assert_eq!(store.derefs(reference).unwrap(), 100);
        store.verify_all().unwrap();
    }

    #[test]
    fn test_paged_out_region_needs_oddball() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 2);

        let mut cold = store.create(b"cold", 0).unwrap();
        let hot = store.create(b"hot", 200).unwrap();
        let filler = store.create(&vec![7u8; 60000], 100).unwrap();
        store.create(&vec![1u8; 40000], 0).unwrap();
        store.create(&vec![2u8; 40000], 0).unwrap();

        assert_eq!(store.region_count(), 3);
        assert!(!store.region(0).unwrap().is_resident());
        assert_eq!(store.statistics().page_in, 0);

        // a chunk that matches its region's average is not worth a page-in
        let mut plain = filler;
        store.migrate(&mut [&mut plain]).unwrap();
        assert_eq!(store.statistics().page_in, 0);
        assert_eq!(plain, filler);

        // the cold chunk is an oddball in a warm region
        store.migrate(&mut [&mut cold]).unwrap();
        assert_eq!(store.statistics().page_in, 1);
        assert_eq!(cold.region(), 2);
        assert_eq!(store.statistics().migrate_move, 1);
        assert_eq!(store.statistics().migrate_away, 1);

        assert_eq!(store.derefs(cold).unwrap(), 0);
        assert_eq!(store.fetch_vec(cold).unwrap(), b"cold");
        assert_eq!(store.fetch_vec(hot).unwrap(), b"hot");
        store.verify_all().unwrap();
    }
}
