//! # Chunk Store Configuration Module
//!
//! This module centralizes the configuration of the chunk store. Layout
//! constants are grouped by their functional area and interdependencies are
//! enforced through compile-time assertions; runtime settings live in
//! serde structs loaded from TOML.
//!
//! ## Module Organization
//!
//! - [`constants`]: Region and chunk layout values with dependency documentation
//! - [`settings`]: `ChunkConfig` and placement `Heuristics`

pub mod constants;
pub mod settings;

pub use constants::*;
pub use settings::{ChunkConfig, Heuristics};
