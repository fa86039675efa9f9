//! # Fatal Storage Errors
//!
//! Every failure the chunk store can report is fatal to the caller: a bad
//! reference or a failed swap transfer means the in-memory picture of the
//! heap can no longer be trusted. Operations return `eyre::Result` so that
//! context (region ids, file offsets) accumulates on the way up, with a
//! [`FatalStorageError`] at the root of the chain for callers that want to
//! match on the cause.
//!
//! Callers that have nothing better to do with an error route it through
//! [`OrAbort::or_abort`], the single place that logs the whole chain and
//! terminates the process.
//!
//! ```ignore
//! let reference = store.create(b"hello", 0).or_abort();
//! ```

use std::io;

use thiserror::Error;

use crate::chunk::ChunkReference;

#[derive(Debug, Error)]
pub enum FatalStorageError {
    #[error("illegal chunk length requested: {len} bytes")]
    IllegalLength { len: usize },

    #[error("invalid reference to non-chunk as used: {reference}")]
    InvalidReference { reference: ChunkReference },

    #[error("invalid reference to free chunk as used: {reference}")]
    FreeChunkReference { reference: ChunkReference },

    #[error("chunk swap file seek to {offset} failed after {attempts} attempts")]
    SwapSeek {
        offset: u64,
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("chunk swap file read of region {region:#06x}: {remaining} bytes remaining")]
    SwapRead {
        region: u16,
        remaining: usize,
        #[source]
        source: io::Error,
    },

    #[error("chunk swap file write of region {region:#06x}: {remaining} bytes remaining")]
    SwapWrite {
        region: u16,
        remaining: usize,
        #[source]
        source: io::Error,
    },

    #[error("chunk swap file is closed")]
    SwapDetached,

    #[error("region table full: {count} regions")]
    RegionTableFull { count: usize },

    #[error("region {region:#06x} is not valid: {reason}")]
    CorruptRegion { region: u16, reason: String },
}

impl FatalStorageError {
    pub fn corrupt(region: u16, reason: impl Into<String>) -> Self {
        FatalStorageError::CorruptRegion {
            region,
            reason: reason.into(),
        }
    }
}

/// Terminates the process on a fatal storage error.
pub trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for eyre::Result<T> {
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(report) => {
                tracing::error!("chunk store failure: {:?}", report);
                std::process::abort();
            }
        }
    }
}

/// Finds the typed root cause of a report, if it has one.
pub fn fatal_cause(report: &eyre::Report) -> Option<&FatalStorageError> {
    report
        .chain()
        .find_map(|cause| cause.downcast_ref::<FatalStorageError>())
}
