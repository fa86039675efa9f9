//! # Storage Module
//!
//! The storage layer holds chunk data in fixed-size regions. A region is
//! `REGION_SIZE` bytes: an 8-byte header followed by chunks that tile the
//! rest of the region exactly. Free chunks form a chain ordered by offset,
//! rooted in the header.
//!
//! ## Region Layout
//!
//! ```text
//! Offset  Size  Content
//! ------  ----  ---------------------------------
//! 0       2     region id
//! 2       2     offset of first free chunk (0 = none)
//! 4       4     reserved
//! 8       ...   chunks, back to back, up to REGION_SIZE
//! ```
//!
//! ## Residency
//!
//! Regions are either resident in one of the cache's buffers or paged out
//! to the swap file at byte offset `id * REGION_SIZE`. The per-region
//! accounting record ([`region::Region`]) is always in memory, so placement
//! can score a region without paging it in.
//!
//! ```text
//!   Region records (always resident)     RegionCache buffers (LRU)
//!   ┌────┬────┬────┬────┐                ┌────────┬────────┐
//!   │ r0 │ r1 │ r2 │ r3 │                │ r3 buf │ r1 buf │
//!   └────┴────┴────┴────┘                └────────┴────────┘
//!     │         │                              ▲ page in
//!     ▼         ▼                              │ page out
//!   ┌──────────────────────────────────────────┴──┐
//!   │ SwapFile: [ r0 ][ r1 ][ r2 ][ r3 ] ...       │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - `region`: on-disk header, chunk walk, per-region accounting
//! - `freelist`: free chain maintenance, hole splitting, coalescing
//! - `cache`: resident region buffers with LRU ordering
//! - `swap`: the swap file and fork clones
//!
//! ## Thread Safety
//!
//! Nothing here is `Sync`-aware. The store is single-threaded and every
//! mutation goes through `&mut ChunkStore`.

pub mod cache;
pub mod freelist;
pub mod region;
pub mod swap;

pub use cache::RegionCache;
pub use freelist::{Align, Fit};
pub use region::{Region, RegionHeader};
pub use swap::SwapFile;
