//! # Chunk Store Layout Constants
//!
//! This module centralizes the layout constants of the chunk store, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! REGION_SIZE (65500 bytes)
//!       │
//!       ├─> REGION_HEADER_SIZE (8 bytes: region_id, first_free, reserved)
//!       │
//!       ├─> FIRST_CHUNK_OFFSET (== REGION_HEADER_SIZE)
//!       │
//!       ├─> REGION_CAPACITY (derived: REGION_SIZE - REGION_HEADER_SIZE)
//!       │     │
//!       │     └─> MAX_LONG_CHUNK_LEN (REGION_CAPACITY - LONG_DATA_OFFSET)
//!       │           A long chunk may fill an empty region completely.
//!       │
//!       └─> MIN_CACHE_MEMORY (2 * REGION_SIZE)
//!             Migration holds a source and a destination region at once.
//!
//! SHORT_DATA_OFFSET (2) ──> MAX_SHORT_CHUNK_LEN (63, 6 bit length)
//! MEDIUM_DATA_OFFSET (3) ─> MAX_MEDIUM_CHUNK_LEN (8191, 13 bit length)
//! LONG_DATA_OFFSET (4) ───> MAX_LONG_CHUNK_LEN (16 bit length)
//!
//! MIN_REMNANT_LEN (SHORT_DATA_OFFSET + 1)
//!       The smallest free chunk. A free chunk stores the high byte of its
//!       next pointer in its first data byte, so it needs one data byte.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `REGION_SIZE <= u16::MAX` (chunk offsets are 16 bit)
//! 2. `REGION_CAPACITY == REGION_SIZE - REGION_HEADER_SIZE`
//! 3. `MAX_LONG_CHUNK_LEN` fits in the 16 bit long length field
//! 4. `MIN_CACHE_MEMORY >= 2 * REGION_SIZE`
//!
//! ## Placement Heuristics
//!
//! The `DEFAULT_*` heuristic values below are the defaults of
//! [`Heuristics`](super::Heuristics) and can be overridden per store.

// ============================================================================
// REGION LAYOUT
// ============================================================================

/// Size of a region in bytes, including its header.
/// This is the unit of paging between the region cache and the swap file.
pub const REGION_SIZE: usize = 65500;

/// Size of the on-buffer region header.
pub const REGION_HEADER_SIZE: usize = 8;

/// Offset of the first chunk in a region. Never zero, so a zero offset can
/// terminate free chains and a zero reference can mean "no chunk".
pub const FIRST_CHUNK_OFFSET: u16 = REGION_HEADER_SIZE as u16;

/// Bytes available for chunks in each region.
pub const REGION_CAPACITY: usize = REGION_SIZE - REGION_HEADER_SIZE;

/// Region id sentinel for unused cache buffers.
pub const INVALID_REGION_ID: u16 = 0xFFFF;

/// Maximum number of regions. Ids run from 0 to `INVALID_REGION_ID - 1`.
pub const MAX_REGIONS: usize = INVALID_REGION_ID as usize;

const _: () = assert!(REGION_SIZE <= u16::MAX as usize, "chunk offsets must fit in 16 bits");

const _: () = assert!(
    REGION_CAPACITY == REGION_SIZE - REGION_HEADER_SIZE,
    "REGION_CAPACITY must be derived from REGION_SIZE"
);

// ============================================================================
// CHUNK HEADER LAYOUT
// ============================================================================

/// Byte 0 flag marking a free chunk.
pub const CHUNK_FREE_FLAG: u8 = 0x80;

/// Byte 0 tag: clear for short chunks, set for medium and long chunks.
pub const CHUNK_TAG1: u8 = 0x40;

/// Byte 0 tag: clear for medium chunks, set for long chunks.
pub const CHUNK_TAG2: u8 = 0x20;

/// Offset of the deref count (or free chain low byte) in every header class.
pub const CHUNK_DEREF_OFFSET: usize = 1;

pub const SHORT_DATA_OFFSET: usize = 2;
pub const MEDIUM_DATA_OFFSET: usize = 3;
pub const LONG_DATA_OFFSET: usize = 4;

pub const MAX_SHORT_CHUNK_LEN: usize = 0x3F;
pub const MAX_MEDIUM_CHUNK_LEN: usize = 0x1FFF;
pub const MAX_LONG_CHUNK_LEN: usize = REGION_CAPACITY - LONG_DATA_OFFSET;

/// Smallest payload a caller may store.
pub const MIN_CHUNK_LEN: usize = 1;

/// Largest payload a caller may store.
pub const MAX_CHUNK_LEN: usize = MAX_LONG_CHUNK_LEN;

/// Smallest free chunk that may be left behind when a hole is split.
pub const MIN_REMNANT_LEN: usize = SHORT_DATA_OFFSET + 1;

/// Deref counts saturate here.
pub const CHUNK_DEREF_MAX: u8 = 0xFF;

const _: () = assert!(MAX_LONG_CHUNK_LEN <= u16::MAX as usize);
const _: () = assert!(MAX_MEDIUM_CHUNK_LEN < MAX_LONG_CHUNK_LEN);
const _: () = assert!(MIN_REMNANT_LEN >= MIN_CHUNK_LEN + SHORT_DATA_OFFSET);

// ============================================================================
// PERIODS AND MIGRATION
// ============================================================================

/// A region whose deref estimate exceeds this counts as hot when deciding
/// whether migration should start a new period.
pub const HOT_REGION_DEREFS: u8 = CHUNK_DEREF_MAX / 2;

/// When a region has missed more than this many periods its deref counts
/// are reset to zero instead of shifted.
pub const DEREF_RESET_PERIODS: u32 = 8;

/// Oddball offsets remembered per region while it is paged out.
pub const NUM_ODDBALLS: usize = 10;

pub const DEFAULT_IN_MEMORY_BIAS: u32 = 4;
pub const DEFAULT_LONELINESS_LIMIT: u32 = 5;
pub const DEFAULT_ODDBALL_THRESHOLD: u32 = 8;
pub const DEFAULT_FREE_PERCENT_LIMIT: u32 = 2;

/// Upper bound for `loneliness_limit`; the loneliness penalty is a shift.
pub const MAX_LONELINESS_LIMIT: u32 = 16;

// ============================================================================
// SWAP FILE AND CACHE
// ============================================================================

/// Seek attempts before a swap file transfer is abandoned (non-Unix only).
pub const SWAP_SEEK_ATTEMPTS: usize = 3;

/// Read or write attempts before a swap file transfer is abandoned.
pub const SWAP_IO_ATTEMPTS: usize = 10;

/// Number of `<swap>.N` names tried when cloning the swap file for a fork.
pub const FORK_CLONE_ATTEMPTS: usize = 10;

pub const DEFAULT_SWAP_FILE: &str = "data/chunkswap";
pub const DEFAULT_SWAP_INITIAL_KIB: u64 = 2048;
pub const DEFAULT_CACHE_MEMORY: usize = 1_000_000;
pub const DEFAULT_MIGRATE_AMOUNT: usize = 50;

/// The region cache never holds fewer than two regions.
pub const MIN_CACHE_MEMORY: usize = 2 * REGION_SIZE;

const _: () = assert!(
    MIN_CACHE_MEMORY >= 2 * REGION_SIZE,
    "migration needs source and destination regions resident together"
);

// ============================================================================
// DIAGNOSTICS
// ============================================================================

/// Entries kept in the rolling trace log.
pub const ROLLING_LOG_SIZE: usize = 200;

/// Columns of a deref histogram; each covers four deref values.
pub const HISTOGRAM_COLUMNS: usize = 64;

/// Rows of a deref histogram.
pub const HISTOGRAM_ROWS: usize = 20;

const _: () = assert!(HISTOGRAM_COLUMNS * 4 == CHUNK_DEREF_MAX as usize + 1);
