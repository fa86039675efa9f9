//! # chunkstore - Pageable Chunk Allocator
//!
//! chunkstore stores many small, immutable byte strings ("chunks", typically
//! object attribute values) in fixed-size regions that can be paged out to a
//! swap file. The working set stays in a bounded region cache while the bulk
//! of the data lives on disk.
//!
//! - **Low overhead**: two to four header bytes per chunk
//! - **Bounded memory**: only `cache_memory` bytes of regions are resident
//! - **Locality**: chunks migrate so that frequently read ones share regions
//!
//! ## Quick Start
//!
//! ```ignore
//! use chunkstore::{ChunkConfig, ChunkStore, Fetch};
//!
//! let mut store = ChunkStore::init(ChunkConfig::new("data/chunkswap"))?;
//!
//! let reference = store.create(b"hello", 0)?;
//! let mut buf = [0u8; 16];
//! if let Fetch::Copied(len) = store.fetch(reference, &mut buf)? {
//!     assert_eq!(&buf[..len as usize], b"hello");
//! }
//! store.delete(reference)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │       ChunkStore (create/fetch/delete)    │
//! ├───────────────────┬──────────────────────┤
//! │ Placement scoring │  Migration engine     │
//! ├───────────────────┴──────────────────────┤
//! │  Regions: free chain, deref accounting    │
//! ├──────────────────────────────────────────┤
//! │  Region cache (LRU)  ◀──▶  Swap file      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`chunk`]: header codec and chunk references
//! - [`storage`]: regions, free chain, region cache, swap file
//! - [`config`]: layout constants and runtime settings
//! - [`stats`]: counters and text reports
//! - [`validate`]: region consistency checks and the activity log
//! - [`error`]: fatal error type and the abort handler
//!
//! Placement, migration and fork support are `impl ChunkStore` blocks in
//! private modules.

#[macro_use]
mod macros;

pub mod chunk;
pub mod config;
pub mod error;
pub mod stats;
pub mod storage;
pub mod validate;

mod fork;
mod migration;
mod placement;
mod store;

pub use chunk::ChunkReference;
pub use config::{ChunkConfig, Heuristics};
pub use error::{FatalStorageError, OrAbort};
pub use stats::StatsKind;
pub use store::{ChunkStore, Fetch};
