//! # Chunk Store Settings
//!
//! Runtime configuration for a [`ChunkStore`](crate::ChunkStore). Settings are
//! plain serde structs so they can be loaded from a TOML file, built in code,
//! or mixed (load a file, then override a field).
//!
//! ```toml
//! swap_file = "data/chunkswap"
//! swap_initial_kib = 2048
//! cache_memory = 1000000
//! migrate_amount = 50
//! paranoid = false
//!
//! [heuristics]
//! in_memory_bias = 4
//! loneliness_limit = 5
//! oddball_threshold = 8
//! free_percent_limit = 2
//! ```
//!
//! Every key is optional; missing keys take the defaults from
//! [`constants`](super::constants). `cache_memory` below two regions is
//! clamped up rather than rejected, matching how the region cache treats
//! its budget.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_CACHE_MEMORY, DEFAULT_FREE_PERCENT_LIMIT, DEFAULT_IN_MEMORY_BIAS,
    DEFAULT_LONELINESS_LIMIT, DEFAULT_MIGRATE_AMOUNT, DEFAULT_ODDBALL_THRESHOLD,
    DEFAULT_SWAP_FILE, DEFAULT_SWAP_INITIAL_KIB, MAX_LONELINESS_LIMIT,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Path of the swap file. Truncated on open.
    pub swap_file: PathBuf,
    /// Space reserved for the swap file up front, in KiB. Zero disables it.
    pub swap_initial_kib: u64,
    /// Bytes of region buffers kept resident.
    pub cache_memory: usize,
    /// References a caller should offer to each migration pass.
    pub migrate_amount: usize,
    /// Validate touched regions after every mutation.
    pub paranoid: bool,
    pub heuristics: Heuristics,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            swap_file: PathBuf::from(DEFAULT_SWAP_FILE),
            swap_initial_kib: DEFAULT_SWAP_INITIAL_KIB,
            cache_memory: DEFAULT_CACHE_MEMORY,
            migrate_amount: DEFAULT_MIGRATE_AMOUNT,
            paranoid: cfg!(any(debug_assertions, feature = "paranoid")),
            heuristics: Heuristics::default(),
        }
    }
}

impl ChunkConfig {
    pub fn new(swap_file: impl Into<PathBuf>) -> Self {
        Self {
            swap_file: swap_file.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {:?}", path))?;
        Self::parse_str(&contents).wrap_err_with(|| format!("in config file {:?}", path))
    }

    pub fn parse_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| eyre::eyre!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.swap_file.as_os_str().is_empty(),
            "swap_file cannot be empty"
        );
        ensure!(self.migrate_amount > 0, "migrate_amount cannot be 0");
        self.heuristics.validate()
    }

    pub fn with_cache_memory(mut self, bytes: usize) -> Self {
        self.cache_memory = bytes;
        self
    }

    pub fn with_swap_initial_kib(mut self, kib: u64) -> Self {
        self.swap_initial_kib = kib;
        self
    }

    pub fn with_paranoid(mut self, paranoid: bool) -> Self {
        self.paranoid = paranoid;
        self
    }

    pub fn with_heuristics(mut self, heuristics: Heuristics) -> Self {
        self.heuristics = heuristics;
        self
    }
}

/// Tuning knobs for region placement.
///
/// A region's unhappiness with a chunk is the distance between the chunk's
/// deref count and the region's average, plus `in_memory_bias` when the
/// region is paged out, plus `2^(loneliness_limit - used)` for regions with
/// at most `loneliness_limit` chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heuristics {
    pub in_memory_bias: u32,
    pub loneliness_limit: u32,
    pub oddball_threshold: u32,
    pub free_percent_limit: u32,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            in_memory_bias: DEFAULT_IN_MEMORY_BIAS,
            loneliness_limit: DEFAULT_LONELINESS_LIMIT,
            oddball_threshold: DEFAULT_ODDBALL_THRESHOLD,
            free_percent_limit: DEFAULT_FREE_PERCENT_LIMIT,
        }
    }
}

impl Heuristics {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.loneliness_limit <= MAX_LONELINESS_LIMIT,
            "loneliness_limit must be at most {}, got {}",
            MAX_LONELINESS_LIMIT,
            self.loneliness_limit
        );
        ensure!(
            self.free_percent_limit <= 100,
            "free_percent_limit is a percentage, got {}",
            self.free_percent_limit
        );
        Ok(())
    }

    /// Score above which a poor fit is rejected in favour of a new region
    /// once free space runs low.
    pub fn unhappiness_limit(&self) -> u32 {
        (1 << self.loneliness_limit) + self.in_memory_bias
    }

    pub fn loneliness_penalty(&self, used_count: u16) -> u32 {
        let used = u32::from(used_count);
        if used <= self.loneliness_limit {
            1 << (self.loneliness_limit - used)
        } else {
            0
        }
    }
}
