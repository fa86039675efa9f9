//! # Chunks
//!
//! A chunk is an immutable, variable-length byte record stored inside a
//! region. This module owns the two pieces of the chunk format that the
//! rest of the store builds on:
//!
//! - [`header`]: the tagged short/medium/long header codec, free-chunk links,
//!   and raw read/write helpers over region buffers
//! - [`reference`]: the packed 32-bit `(region, offset)` handle handed to
//!   callers

pub mod header;
pub mod reference;

pub use header::{ChunkHeader, SizeClass};
pub use reference::ChunkReference;
