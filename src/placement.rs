//! # Placement Heuristic
//!
//! Chunks are placed to keep chunks of similar "temperature" (deref count)
//! together, so that hot chunks share a few resident regions and cold ones
//! can sit in the swap file.
//!
//! ## Region Choice
//!
//! Every region whose largest hole can take the chunk is scored:
//!
//! ```text
//! unhappiness = |derefs - region average|
//!             + in_memory_bias                       if paged out
//!             + 2^(loneliness_limit - used_count)    if used_count <= limit
//! ```
//!
//! The region average includes the candidate chunk, except for the region
//! the chunk already lives in. The least unhappy region wins. A new region
//! is formatted when nothing fits, or when the winner is still unhappier
//! than `unhappiness_limit()` and overall free space has dropped below
//! `free_percent_limit` percent.
//!
//! A region with exactly two holes also qualifies when the smaller hole is
//! an exact fit, even though the larger one cannot be split for the chunk.
//!
//! ## Offset Choice
//!
//! Within the chosen region the free chain is walked in offset order: an
//! exact fit wins immediately, otherwise the first hole that leaves a legal
//! remainder. When relocating inside the chunk's own region only holes to
//! its left count, and a hole directly touching the chunk is taken as a
//! slide target unless an earlier fitting hole was seen.

use eyre::Result;

use crate::chunk::header::{full_len_at, next_free};
use crate::chunk::ChunkReference;
use crate::config::{MIN_REMNANT_LEN, REGION_CAPACITY};
use crate::storage::freelist::fits_in_space;
use crate::storage::region::first_free;
use crate::store::ChunkStore;

impl ChunkStore {
    /// Picks the region for a chunk of `full_len` bytes, creating one when
    /// the existing regions are full or too unhappy.
    pub(crate) fn find_best_region(
        &mut self,
        full_len: u16,
        derefs: u8,
        old_region: Option<u16>,
    ) -> Result<u16> {
        let period = self.stats.period;
        let heuristics = self.config.heuristics;
        let mut best: Option<(u32, u16)> = None;
        let mut free_bytes = 0u64;

        for (index, region) in self.regions.iter().enumerate() {
            let id = index as u16;
            free_bytes += u64::from(region.free_bytes);

            let two_hole_fit = region.free_count == 2
                && region.free_bytes - region.largest_free_chunk == full_len;
            if !fits_in_space(full_len, region.largest_free_chunk).fits() && !two_hole_fit {
                continue;
            }

            let estimate = if old_region == Some(id) {
                region.average_derefs(period)
            } else {
                region.average_derefs_with(period, derefs)
            };
            let mut score = u32::from(derefs.abs_diff(estimate));
            if !region.is_resident() {
                score += heuristics.in_memory_bias;
            }
            score += heuristics.loneliness_penalty(region.used_count);

            if best.map_or(true, |(best_score, _)| score < best_score) {
                best = Some((score, id));
            }
        }

        match best {
            None => self.create_region(),
            Some((score, _))
                if score > heuristics.unhappiness_limit()
                    && free_bytes * 100 / ((REGION_CAPACITY * self.regions.len()) as u64)
                        < u64::from(heuristics.free_percent_limit) =>
            {
                self.create_region()
            }
            Some((_, id)) => Ok(id),
        }
    }

    /// Picks the hole in `region` for a chunk of `full_len` bytes. `old` is
    /// the chunk's current location when it is being relocated.
    pub(crate) fn find_best_offset(
        &mut self,
        full_len: u16,
        region: u16,
        old: Option<ChunkReference>,
    ) -> Result<Option<u16>> {
        let slot = self.bring_in_region(region)?;
        let page = self.cache.data(slot);
        let old_offset = old.filter(|o| o.region() == region).map(|o| o.offset());

        let mut fits = None;
        let mut offset = first_free(page)?;
        while offset != 0 {
            let len = full_len_at(page, offset);
            if let Some(old_offset) = old_offset {
                if offset > old_offset {
                    break;
                }
                if usize::from(offset) + usize::from(len) == usize::from(old_offset) {
                    return Ok(fits.or(Some(offset)));
                }
            }
            if len == full_len {
                return Ok(Some(offset));
            }
            if fits.is_none() && usize::from(len) >= usize::from(full_len) + MIN_REMNANT_LEN {
                fits = Some(offset);
            }
            offset = next_free(page, offset);
        }
        Ok(fits)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ChunkConfig, Heuristics, FIRST_CHUNK_OFFSET, MAX_CHUNK_LEN, REGION_SIZE};
    use crate::store::ChunkStore;

    fn store(dir: &tempfile::TempDir, cache_regions: usize) -> ChunkStore {
        let config = ChunkConfig::new(dir.path().join("chunkswap"))
            .with_swap_initial_kib(0)
            .with_cache_memory(cache_regions * REGION_SIZE)
            .with_paranoid(true);
        ChunkStore::init(config).unwrap()
    }

    #[test]
    fn test_first_region_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        assert_eq!(store.find_best_region(10, 0, None).unwrap(), 0);
        assert_eq!(store.region_count(), 1);
        assert_eq!(
            store.find_best_offset(10, 0, None).unwrap(),
            Some(FIRST_CHUNK_OFFSET)
        );
    }

    #[test]
    fn test_hot_and_cold_chunks_separate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 8);

        // fill a region with cold chunks until it is nearly full
        let cold = vec![0u8; 8000];
        let mut refs = Vec::new();
        while store.region_count() < 2 {
            refs.push(store.create(&cold, 0).unwrap());
        }
        let last = refs.pop().unwrap();
        assert_eq!(last.region(), 1);

        // eight cold chunks make region 0 the unhappier home for a hot one
        let hot = store.create(b"hot", 255).unwrap();
        assert_eq!(hot.region(), 1);
        store.verify_all().unwrap();
    }

    #[test]
    fn test_unhappy_fit_opens_region_when_space_is_low() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        // one cold chunk leaving 600 free bytes, under 2% of the store
        store.create(&vec![0u8; MAX_CHUNK_LEN - 600], 0).unwrap();
        assert_eq!(store.region(0).unwrap().free_bytes, 600);

        assert_eq!(store.find_best_region(10, 0, None).unwrap(), 0);
        assert_eq!(store.region_count(), 1);
        assert_eq!(store.find_best_region(10, 255, None).unwrap(), 1);
        assert_eq!(store.region_count(), 2);
    }

    #[test]
    fn test_unhappy_fit_kept_without_free_space_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChunkConfig::new(dir.path().join("chunkswap"))
            .with_swap_initial_kib(0)
            .with_paranoid(true)
            .with_heuristics(Heuristics {
                free_percent_limit: 0,
                ..Heuristics::default()
            });
        let mut store = ChunkStore::init(config).unwrap();

        store.create(&vec![0u8; MAX_CHUNK_LEN - 600], 0).unwrap();
        assert_eq!(store.find_best_region(10, 255, None).unwrap(), 0);
        assert_eq!(store.region_count(), 1);
    }

    #[test]
    fn test_exact_fit_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        let a = store.create(b"aaaaaaaa", 0).unwrap();
        let _b = store.create(b"bb", 0).unwrap();
        store.delete(a).unwrap();

        // the 10-byte hole at the front is an exact fit for another 8 bytes
        let offset = store.find_best_offset(10, 0, None).unwrap();
        assert_eq!(offset, Some(a.offset()));

        // a 9-byte chunk would leave a 1-byte remainder there
        let offset = store.find_best_offset(9, 0, None).unwrap();
        assert_ne!(offset, Some(a.offset()));
    }

    #[test]
    fn test_relocation_only_looks_left() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 4);

        let a = store.create(b"aaaa", 0).unwrap();
        let b = store.create(b"bbbb", 0).unwrap();
        let c = store.create(b"cccc", 0).unwrap();
        store.create(b"dddd", 0).unwrap();

        // nothing to the left of `a`
        assert_eq!(store.find_best_offset(6, 0, Some(a)).unwrap(), None);

        // the hole left by `b` touches `c`
        store.delete(b).unwrap();
        assert_eq!(
            store.find_best_offset(6, 0, Some(c)).unwrap(),
            Some(b.offset())
        );
        assert_eq!(store.find_best_offset(6, 0, Some(a)).unwrap(), None);
    }
}
