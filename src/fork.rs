//! # Fork Support
//!
//! A server that dumps its database from a forked child shares the store's
//! memory copy-on-write, but not the swap file: the parent keeps paging
//! while the child reads. Before forking, the swap file is cloned so each
//! process owns a file nobody else writes.
//!
//! ```text
//! parent                                   child
//! ------                                   -----
//! fork_file()   copy paged-out regions
//!               into <swap>.N
//! fork()  ───────────────────────────────▶
//! fork_parent() forget the clone           fork_child()  swap := clone
//! ...           keeps paging               ... dump ...
//!                                          fork_done()   close and unlink
//! ```
//!
//! Resident regions are not copied: the child sees them in its copy of the
//! parent's memory. If `fork()` itself fails, the parent calls
//! `fork_done()` to remove the clone.

use eyre::Result;
use tracing::{info, warn};

use crate::storage::swap::Advice;
use crate::store::ChunkStore;

impl ChunkStore {
    /// Clones the swap file for a forked child. Returns false when a clone
    /// already exists or none could be created.
    pub fn fork_file(&mut self) -> Result<bool> {
        if self.swap.has_clone() {
            return Ok(false);
        }
        if !self.swap.create_clone()? {
            warn!(swap_file = %self.swap.path().display(), "unable to clone chunk swap file");
            return Ok(false);
        }

        self.swap.advise(Advice::Sequential);
        let scratch = self.find_available_buffer()?;
        let mut copied = 0usize;
        for (id, region) in self.regions.iter().enumerate() {
            if region.is_resident() {
                continue;
            }
            self.swap
                .copy_to_clone(id as u16, self.cache.data_mut(scratch))?;
            copied += 1;
        }
        self.swap.advise(Advice::Random);

        info!(regions = copied, "cloned chunk swap file for fork");
        Ok(true)
    }

    /// Parent side after a successful fork.
    pub fn fork_parent(&mut self) {
        self.swap.release_clone();
    }

    /// Child side after a successful fork.
    pub fn fork_child(&mut self) {
        self.swap.adopt_clone();
    }

    /// Removes the clone: the child's cleanup when its dump is finished, or
    /// the parent's when `fork()` failed.
    pub fn fork_done(&mut self) -> Result<()> {
        self.swap.finish_clone()
    }
}
