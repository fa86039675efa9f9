//! # Chunk Store
//!
//! `ChunkStore` owns every piece of allocator state: the region table, the
//! resident region buffers, the swap file, the statistics and the activity
//! log. There are no globals; every operation takes `&mut self`.
//!
//! ## Data Flow
//!
//! ```text
//!   create(data, derefs)
//!        │
//!        ▼
//!   find_best_region ──▶ find_best_offset ──▶ split_hole ──▶ write_used
//!        │ (scores Region records,            (free chain)   (chunk codec)
//!        │  may create a region)
//!        ▼
//!   bring_in_region ──▶ RegionCache (LRU) ──evict──▶ SwapFile
//!                              ▲                        │
//!                              └──────── page in ───────┘
//! ```
//!
//! ## References
//!
//! A [`ChunkReference`] is `region << 16 | offset`. It stays valid until the
//! chunk is deleted or moved by `migrate()`, which rewrites the caller's
//! reference in place. Using a stale reference is a fatal error: the region
//! bounds and header are always checked, and paranoid mode additionally
//! walks the region to prove the offset starts a used chunk.
//!
//! ## Deref Counts
//!
//! Every fetch bumps the chunk's 8-bit deref count, saturating at 255. The
//! counts are never used for anything but placement; they decay as periods
//! advance (see [`Region::decay`]).
//!
//! ## Paranoid Mode
//!
//! With `ChunkConfig::paranoid` set, every mutated region is rescanned and
//! compared with its accounting, and the last operations are kept in a
//! rolling log. Both are dumped through `tracing::error!` on the first
//! inconsistency.

use std::path::Path;

use eyre::{eyre, Result, WrapErr};
use tracing::{debug, error, info};

use crate::chunk::header::{self, ChunkHeader};
use crate::chunk::ChunkReference;
use crate::config::{
    ChunkConfig, CHUNK_DEREF_MAX, FIRST_CHUNK_OFFSET, INVALID_REGION_ID, MAX_CHUNK_LEN,
    MAX_REGIONS, MIN_CHUNK_LEN, REGION_SIZE,
};
use crate::error::FatalStorageError;
use crate::stats::ChunkStats;
use crate::storage::cache::RegionCache;
use crate::storage::freelist::{self, Align};
use crate::storage::region::{format_page, Region};
use crate::storage::swap::{Advice, SwapFile};
use crate::validate::{self, RollingLog};

/// Outcome of [`ChunkStore::fetch`]. Either way the value is the chunk's
/// payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// The payload was copied to the front of the buffer.
    Copied(u16),
    /// The buffer was too small and was left untouched.
    TooSmall(u16),
}

impl Fetch {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(self) -> u16 {
        match self {
            Fetch::Copied(len) | Fetch::TooSmall(len) => len,
        }
    }

    pub fn is_copied(self) -> bool {
        matches!(self, Fetch::Copied(_))
    }
}

#[derive(Debug)]
pub struct ChunkStore {
    pub(crate) config: ChunkConfig,
    pub(crate) regions: Vec<Region>,
    pub(crate) cache: RegionCache,
    pub(crate) swap: SwapFile,
    pub(crate) stats: ChunkStats,
    pub(crate) log: RollingLog,
}

impl ChunkStore {
    /// Opens (and truncates) the swap file and sets up an empty store.
    pub fn init(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        let swap = SwapFile::create(&config.swap_file, config.swap_initial_kib)?;
        let cache = RegionCache::new(config.cache_memory);

        info!(
            swap_file = %config.swap_file.display(),
            cache_bytes = cache.budget(),
            paranoid = config.paranoid,
            "chunk store initialized"
        );

        Ok(Self {
            log: RollingLog::new(config.paranoid),
            config,
            regions: Vec::new(),
            cache,
            swap,
            stats: ChunkStats::default(),
        })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Path of the swap file currently in use. Changes in a fork child.
    pub fn swap_path(&self) -> &Path {
        self.swap.path()
    }

    pub fn statistics(&self) -> &ChunkStats {
        &self.stats
    }

    pub fn period(&self) -> u32 {
        self.stats.period
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Number of region buffers allocated for the cache.
    pub fn cached_region_count(&self) -> usize {
        self.cache.len()
    }

    pub fn region(&self, id: u16) -> Option<&Region> {
        self.regions.get(usize::from(id))
    }

    /// Number of regions currently paged out to the swap file.
    pub fn num_swapped(&self) -> usize {
        self.regions.iter().filter(|r| !r.is_resident()).count()
    }

    pub fn create(&mut self, data: &[u8], derefs: u8) -> Result<ChunkReference> {
        if data.len() < MIN_CHUNK_LEN || data.len() > MAX_CHUNK_LEN {
            return Err(FatalStorageError::IllegalLength { len: data.len() }.into());
        }

        let full_len = header::full_len_for(data.len());
        let mut region = self.find_best_region(full_len, derefs, None)?;
        let offset = match self.find_best_offset(full_len, region, None)? {
            Some(offset) => offset,
            None => {
                region = self.create_region()?;
                FIRST_CHUNK_OFFSET
            }
        };

        let slot = self.bring_in_region(region)?;
        let r = &mut self.regions[usize::from(region)];
        let page = self.cache.data_mut(slot);
        let offset = freelist::split_hole(r, page, region, offset, full_len, Align::Auto)?;
        header::write_used(page, offset, data, derefs);
        r.total_derefs += u32::from(derefs);
        self.cache.touch(slot);

        self.stats.record_alloc(data.len());
        self.stats.creates += 1;

        let reference = ChunkReference::new(region, offset);
        self.log.record(format_args!(
            "create {} len {:#06x} derefs {}",
            reference,
            data.len(),
            derefs
        ));
        self.check_region(region)?;
        Ok(reference)
    }

    /// Copies a chunk's payload into `buf` if it fits.
    pub fn fetch(&mut self, reference: ChunkReference, buf: &mut [u8]) -> Result<Fetch> {
        let (region, offset, slot) = self.locate(reference)?;

        let data = header::data_at(self.cache.data(slot), offset);
        let len = data.len() as u16;
        let fetched = if data.len() <= buf.len() {
            buf[..data.len()].copy_from_slice(data);
            Fetch::Copied(len)
        } else {
            Fetch::TooSmall(len)
        };

        self.cache.touch(slot);
        self.bump_deref(region, offset, slot);
        Ok(fetched)
    }

    /// Fetches a chunk into a freshly allocated buffer of exactly its size.
    pub fn fetch_vec(&mut self, reference: ChunkReference) -> Result<Vec<u8>> {
        let (region, offset, slot) = self.locate(reference)?;
        let data = header::data_at(self.cache.data(slot), offset).to_vec();
        self.cache.touch(slot);
        self.bump_deref(region, offset, slot);
        Ok(data)
    }

    /// Payload length. Counts as a fetch.
    pub fn len(&mut self, reference: ChunkReference) -> Result<u16> {
        Ok(self.fetch(reference, &mut [])?.len())
    }

    /// Current deref count, without bumping it.
    pub fn derefs(&mut self, reference: ChunkReference) -> Result<u8> {
        let (_, offset, slot) = self.locate(reference)?;
        Ok(header::deref_at(self.cache.data(slot), offset))
    }

    pub fn delete(&mut self, reference: ChunkReference) -> Result<()> {
        let (region, offset, slot) = self.locate(reference)?;

        let r = &mut self.regions[usize::from(region)];
        let page = self.cache.data_mut(slot);
        let data_len = header::data_len_at(page, offset);
        freelist::free_chunk(r, page, offset)?;
        self.cache.touch(slot);

        self.stats.record_free(data_len.into());
        self.stats.deletes += 1;
        self.log.record(format_args!("delete {}", reference));
        self.check_region(region)
    }

    /// Runs the full consistency check on every region, resident or not.
    /// Paged-out regions are read from the swap file into one scratch
    /// buffer; they stay paged out.
    pub fn verify_all(&mut self) -> Result<()> {
        let mut scratch = None;
        for index in 0..self.regions.len() {
            let id = index as u16;
            if self.regions[index].is_resident() {
                self.verify_region(id)?;
                continue;
            }

            let slot = match scratch {
                Some(slot) => slot,
                None => {
                    self.swap.advise(Advice::Sequential);
                    *scratch.insert(self.find_available_buffer()?)
                }
            };
            self.swap
                .read_region(id, self.cache.data_mut(slot))
                .wrap_err_with(|| format!("failed to read region {:#06x} for verification", id))?;
            self.verify_page(id, Some(slot))?;
        }
        if scratch.is_some() {
            self.swap.advise(Advice::Random);
        }
        Ok(())
    }

    fn bump_deref(&mut self, region: u16, offset: u16, slot: usize) {
        self.stats.deref_count += 1;
        let page = self.cache.data_mut(slot);
        let deref = header::deref_at(page, offset);
        if deref < CHUNK_DEREF_MAX {
            header::set_deref(page, offset, deref + 1);
            self.regions[usize::from(region)].total_derefs += 1;
            if deref + 1 == CHUNK_DEREF_MAX {
                self.stats.deref_maxxed += 1;
            }
        }
    }

    /// Resolves a reference to a used chunk, paging its region in.
    /// Returns `(region, offset, cache slot)`.
    pub(crate) fn locate(&mut self, reference: ChunkReference) -> Result<(u16, u16, usize)> {
        let (region, offset) = (reference.region(), reference.offset());
        let invalid = || FatalStorageError::InvalidReference { reference };

        if usize::from(region) >= self.regions.len()
            || offset < FIRST_CHUNK_OFFSET
            || usize::from(offset) >= REGION_SIZE
        {
            return Err(invalid().into());
        }

        let slot = self.bring_in_region(region)?;
        let page = self.cache.data(slot);
        let chunk = ChunkHeader::try_decode(&page[usize::from(offset)..]).ok_or_else(invalid)?;
        if usize::from(offset) + usize::from(chunk.full_len()) > REGION_SIZE {
            return Err(invalid().into());
        }
        if header::is_free(page, offset) {
            return Err(FatalStorageError::FreeChunkReference { reference }.into());
        }
        if self.config.paranoid {
            validate::verify_used_chunk(page, reference)?;
        }
        Ok((region, offset, slot))
    }

    /// Makes a region resident and returns its cache slot. Does not touch
    /// the slot when the region was already resident.
    pub(crate) fn bring_in_region(&mut self, id: u16) -> Result<usize> {
        if let Some(slot) = self.regions[usize::from(id)].in_memory {
            return Ok(slot);
        }

        let slot = self.find_available_buffer()?;
        debug!(region = id, slot, "paging in region");
        self.swap
            .read_region(id, self.cache.data_mut(slot))
            .wrap_err_with(|| format!("failed to page in region {:#06x}", id))?;
        self.cache.set_region(slot, id);

        let period = self.stats.period;
        let region = &mut self.regions[usize::from(id)];
        region.in_memory = Some(slot);
        region.decay(self.cache.data_mut(slot), period);
        self.cache.touch(slot);

        self.stats.page_in += 1;
        self.stats.record_paging(region.average_derefs(period));
        Ok(slot)
    }

    /// Returns an empty buffer, allocating one while the budget allows and
    /// paging out the least recently used region otherwise.
    pub(crate) fn find_available_buffer(&mut self) -> Result<usize> {
        if self.cache.can_grow() {
            return Ok(self.cache.grow());
        }
        let slot = self
            .cache
            .lru()
            .ok_or_else(|| eyre!("region cache has no buffers"))?;
        if self.cache.region_of(slot) != INVALID_REGION_ID {
            self.page_out(slot)?;
        }
        Ok(slot)
    }

    fn page_out(&mut self, slot: usize) -> Result<()> {
        let id = self.cache.region_of(slot);
        let period = self.stats.period;
        let region = &mut self.regions[usize::from(id)];

        region.find_oddballs(
            self.cache.data(slot),
            period,
            self.config.heuristics.oddball_threshold,
        );
        debug!(region = id, slot, "paging out region");
        self.swap
            .write_region(id, self.cache.data(slot))
            .wrap_err_with(|| format!("failed to page out region {:#06x}", id))?;

        self.stats.record_paging(region.average_derefs(period));
        self.stats.page_out += 1;
        region.in_memory = None;
        self.cache.set_region(slot, INVALID_REGION_ID);
        Ok(())
    }

    /// Formats an empty region, recycling the first region with no used
    /// chunks before growing the table.
    pub(crate) fn create_region(&mut self) -> Result<u16> {
        let period = self.stats.period;
        let index = match self.regions.iter().position(|r| r.used_count == 0) {
            Some(index) => index,
            None => {
                if self.regions.len() >= MAX_REGIONS {
                    return Err(FatalStorageError::RegionTableFull {
                        count: self.regions.len(),
                    }
                    .into());
                }
                self.regions.push(Region::new(period));
                self.regions.len() - 1
            }
        };
        let id = index as u16;

        self.regions[index].reset(period);
        let slot = match self.regions[index].in_memory {
            Some(slot) => slot,
            None => {
                let slot = self.find_available_buffer()?;
                self.regions[index].in_memory = Some(slot);
                slot
            }
        };
        self.cache.set_region(slot, id);
        format_page(self.cache.data_mut(slot), id);
        self.cache.touch(slot);

        debug!(region = id, slot, "created region");
        Ok(id)
    }

    /// Validates a region after a mutation when paranoid mode is on.
    pub(crate) fn check_region(&mut self, id: u16) -> Result<()> {
        if self.config.paranoid {
            self.verify_region(id)
        } else {
            Ok(())
        }
    }

    pub(crate) fn verify_region(&mut self, id: u16) -> Result<()> {
        let slot = self.regions[usize::from(id)].in_memory;
        self.verify_page(id, slot)
    }

    /// Checks region `id` against the bytes in cache slot `slot`, or its
    /// accounting alone when there is no slot.
    fn verify_page(&mut self, id: u16, slot: Option<usize>) -> Result<()> {
        let period = self.stats.period;
        let region = &self.regions[usize::from(id)];
        let page = slot.map(|slot| self.cache.data(slot));

        let problems = validate::region_problems(region, page);
        let Some(first) = problems.first() else {
            return Ok(());
        };

        for problem in &problems {
            error!(region = id, "{}", problem.message);
        }
        if problems.iter().any(|p| p.needs_map) {
            for line in validate::dump_region(id, region, page, period) {
                error!("{}", line);
            }
        }
        let reason = first.message.clone();
        self.log.flush();
        Err(FatalStorageError::corrupt(id, reason).into())
    }
}
