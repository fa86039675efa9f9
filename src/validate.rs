//! # Region Validation and Trace Log
//!
//! Paranoid mode re-derives a region's accounting from its bytes after every
//! mutation and compares it with the cached [`Region`] counters. Any
//! disagreement means the heap is corrupt; the store then dumps a map of the
//! region and the recent-activity log before failing with
//! `FatalStorageError::CorruptRegion`.
//!
//! ## Checks
//!
//! ```text
//! accounting only (always)      full scan (bytes at hand)
//! ------------------------      ------------------------------------------
//! used_count plausible          chunks tile the region exactly
//! free_count plausible          no two adjacent free chunks      (map)
//! largest <= free_bytes
//!                               free chain visits free chunks
//!                                 in offset order and ends        (map)
//!                               medium/long chunks not undersized (map)
//!                               counters equal the scan
//! ```
//!
//! Problems marked `(map)` also request a region map in the dump.
//! Mutations rescan the resident region they touched. `verify_all` also
//! reads every paged-out region from the swap file and scans it.
//!
//! ## Rolling Log
//!
//! [`RollingLog`] keeps the last `ROLLING_LOG_SIZE` operations as text. It
//! costs nothing unless enabled (paranoid mode) and is emptied into the
//! error log when corruption is detected.

use std::collections::VecDeque;
use std::fmt;

use eyre::Result;
use tracing::{error, trace};

use crate::chunk::header::{self, ChunkHeader, SizeClass};
use crate::chunk::ChunkReference;
use crate::config::{
    CHUNK_DEREF_MAX, FIRST_CHUNK_OFFSET, MAX_MEDIUM_CHUNK_LEN, MAX_SHORT_CHUNK_LEN,
    MIN_REMNANT_LEN, REGION_SIZE, ROLLING_LOG_SIZE,
};
use crate::error::FatalStorageError;
use crate::storage::region::{chunk_offsets, Region, RegionHeader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub message: String,
    pub needs_map: bool,
}

impl Problem {
    fn new(message: String) -> Self {
        Self {
            message,
            needs_map: false,
        }
    }

    fn mapped(message: String) -> Self {
        Self {
            message,
            needs_map: true,
        }
    }
}

/// Compares a region's counters with its bytes. With `page` as `None` only
/// the accounting checks run.
pub fn region_problems(region: &Region, page: Option<&[u8]>) -> Vec<Problem> {
    let mut problems = Vec::new();
    let ludicrous = (REGION_SIZE / MIN_REMNANT_LEN) as u16;

    if region.used_count > ludicrous {
        problems.push(Problem::new(format!(
            "chunk count is ludicrous: {:#06x}",
            region.used_count
        )));
    }
    if region.free_count > ludicrous {
        problems.push(Problem::new(format!(
            "free count is ludicrous: {:#06x}",
            region.free_count
        )));
    }
    if region.largest_free_chunk > region.free_bytes {
        problems.push(Problem::new(format!(
            "largest free chunk > free bytes: {:#06x} > {:#06x}",
            region.largest_free_chunk, region.free_bytes
        )));
    }

    let Some(page) = page else {
        return problems;
    };

    let mut used_count = 0u16;
    let mut free_count = 0u16;
    let mut free_bytes = 0u32;
    let mut largest_free = 0u16;
    let mut total_derefs = 0u32;
    let mut was_free = false;
    let mut next_free = match RegionHeader::from_bytes(page) {
        Ok(h) => h.first_free(),
        Err(e) => {
            problems.push(Problem::new(format!("unreadable header: {}", e)));
            return problems;
        }
    };

    let mut offset = FIRST_CHUNK_OFFSET as usize;
    while offset < REGION_SIZE {
        let Some(chunk) = ChunkHeader::try_decode(&page[offset..]) else {
            break;
        };
        let len = chunk.full_len();
        if offset + usize::from(len) > REGION_SIZE {
            break;
        }
        let at = offset as u16;
        let free = header::is_free(page, at);

        if was_free && free {
            problems.push(Problem::mapped(format!(
                "uncoalesced free chunk: {:#06x}",
                at
            )));
        }
        was_free = free;

        if free {
            free_count += 1;
            free_bytes += u32::from(len);
            largest_free = largest_free.max(len);
            if next_free != at {
                problems.push(Problem::mapped(format!(
                    "free chain broken: {:#06x}, expecting {:#06x}",
                    at, next_free
                )));
            }
            next_free = header::next_free(page, at);
        } else {
            used_count += 1;
            total_derefs += u32::from(chunk.deref());
            match chunk.class() {
                SizeClass::Medium if usize::from(chunk.len()) <= MAX_SHORT_CHUNK_LEN => {
                    problems.push(Problem::mapped(format!(
                        "medium chunk too small: {:#06x}",
                        at
                    )));
                }
                SizeClass::Long if usize::from(chunk.len()) <= MAX_MEDIUM_CHUNK_LEN => {
                    problems.push(Problem::mapped(format!(
                        "long chunk too small: {:#06x}",
                        at
                    )));
                }
                _ => {}
            }
        }
        offset += usize::from(len);
    }

    if offset != REGION_SIZE {
        problems.push(Problem::mapped(format!(
            "last chunk past bounds at {:#06x}",
            offset
        )));
    }
    if next_free != 0 {
        problems.push(Problem::mapped(format!(
            "free chain unterminated: expecting {:#06x}",
            next_free
        )));
    }

    let mut compare = |what: &str, cached: u32, scanned: u32| {
        if cached != scanned {
            problems.push(Problem::new(format!(
                "{} is wrong: {:#06x} should be {:#06x}",
                what, cached, scanned
            )));
        }
    };
    compare("used count", region.used_count.into(), used_count.into());
    compare("total derefs", region.total_derefs, total_derefs);
    compare("free count", region.free_count.into(), free_count.into());
    compare("free bytes", region.free_bytes.into(), free_bytes);
    compare(
        "largest free",
        region.largest_free_chunk.into(),
        largest_free.into(),
    );

    problems
}

/// Checks that `reference` names a used chunk by walking the region from
/// its first chunk.
pub fn verify_used_chunk(page: &[u8], reference: ChunkReference) -> Result<()> {
    let target = reference.offset();
    for offset in chunk_offsets(page) {
        if offset == target {
            if header::is_free(page, offset) {
                return Err(FatalStorageError::FreeChunkReference { reference }.into());
            }
            return Ok(());
        }
        if offset > target {
            break;
        }
    }
    Err(FatalStorageError::InvalidReference { reference }.into())
}

/// Human-readable map of a region, one line per chunk.
pub fn dump_region(id: u16, region: &Region, page: Option<&[u8]>, period: u32) -> Vec<String> {
    let mut lines = vec![format!(
        "region: id:{:04x} period:{:<8x} deref:{:<8x} ({:<2x} per chunk)",
        id,
        region.period_last_touched,
        region.total_derefs,
        region.average_derefs(period)
    )];

    let counts = format!(
        "        #used:{:<4x} #free:{:<4x} fbytes:{:<4x} hole:{:<4x} ",
        region.used_count, region.free_count, region.free_bytes, region.largest_free_chunk
    );
    let Some(page) = page else {
        lines.push(counts + "PAGED");
        return lines;
    };
    match RegionHeader::from_bytes(page) {
        Ok(h) => lines.push(format!(
            "{}first:{:<4x} h_id:{:<4x}",
            counts,
            h.first_free(),
            h.region_id()
        )),
        Err(_) => lines.push(counts + "UNREADABLE"),
    }

    for offset in chunk_offsets(page) {
        let chunk = header::header_at(page, offset);
        let free = header::is_free(page, offset);
        let mut line = format!(
            "chunk: {:>4} {:<6} off:{:04x} full:{:04x} ",
            if free { "FREE" } else { "" },
            chunk.class().name(),
            offset,
            chunk.full_len()
        );
        if free {
            line.push_str(&format!("next:{:04x}", header::next_free(page, offset)));
        } else {
            line.push_str(&format!(
                "doff:{:04x} len:{:04x} ",
                usize::from(offset) + chunk.data_offset(),
                chunk.len()
            ));
            if chunk.deref() == CHUNK_DEREF_MAX {
                line.push_str("deref:many");
            } else {
                line.push_str(&format!("deref:{:04x}", chunk.deref()));
            }
        }
        lines.push(line);
    }
    lines
}

#[derive(Debug)]
pub struct RollingLog {
    entries: VecDeque<String>,
    enabled: bool,
}

impl RollingLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: VecDeque::with_capacity(if enabled { ROLLING_LOG_SIZE } else { 0 }),
            enabled,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&mut self, entry: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        if self.entries.len() == ROLLING_LOG_SIZE {
            self.entries.pop_front();
        }
        let entry = entry.to_string();
        trace!(target: "chunkstore::activity", "{}", entry);
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes every entry to the error log, oldest first, and clears the log.
    pub fn flush(&mut self) {
        error!("Recent chunk activity:");
        for entry in self.entries.drain(..) {
            error!("{}", entry);
        }
        error!("End of recent chunk activity.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REGION_CAPACITY;
    use crate::storage::freelist::{free_chunk, split_hole, Align};
    use crate::storage::region::format_page;

    fn region_with(chunks: &[&[u8]]) -> (Region, Vec<u8>, Vec<u16>) {
        let mut page = vec![0u8; REGION_SIZE];
        format_page(&mut page, 4);
        let mut region = Region::new(0);
        let mut offsets = Vec::new();
        for data in chunks {
            let full = header::full_len_for(data.len());
            let hole = crate::storage::region::first_free(&page).unwrap();
            let at = split_hole(&mut region, &mut page, 4, hole, full, Align::Auto).unwrap();
            header::write_used(&mut page, at, data, 3);
            region.total_derefs += 3;
            offsets.push(at);
        }
        (region, page, offsets)
    }

    #[test]
    fn test_fresh_region_is_valid() {
        let (region, page, _) = region_with(&[]);
        assert!(region_problems(&region, Some(&page)).is_empty());
        assert_eq!(region.free_bytes as usize, REGION_CAPACITY);
    }

    #[test]
    fn test_populated_region_is_valid() {
        let (mut region, mut page, offsets) =
            region_with(&[b"one", b"two", &[9u8; 100], &[1u8; 9000]]);
        assert!(region_problems(&region, Some(&page)).is_empty());

        free_chunk(&mut region, &mut page, offsets[1]).unwrap();
        assert!(region_problems(&region, Some(&page)).is_empty());
    }

    #[test]
    fn test_detects_wrong_counters() {
        let (mut region, page, _) = region_with(&[b"one"]);
        region.used_count = 2;
        region.total_derefs = 0;

        let problems = region_problems(&region, Some(&page));
        assert_eq!(problems.len(), 2);
        assert!(problems[0].message.starts_with("used count is wrong"));
        assert!(problems[1].message.starts_with("total derefs is wrong"));
    }

    #[test]
    fn test_detects_uncoalesced_frees() {
        let (region, mut page, offsets) = region_with(&[b"aaaa", b"bbbb"]);
        header::write_free(&mut page, offsets[0], 6, offsets[1]);
        header::write_free(&mut page, offsets[1], 6, offsets[1] + 6);
        crate::storage::region::set_first_free(&mut page, offsets[0]).unwrap();

        let problems = region_problems(&region, Some(&page));
        assert!(problems.iter().any(|p| p.needs_map
            && p.message.starts_with("uncoalesced free chunk")));
    }

    #[test]
    fn test_missing_page_checks_accounting_only() {
        let mut region = Region::new(0);
        region.largest_free_chunk = 10;
        region.free_bytes = 5;
        let problems = region_problems(&region, None);
        assert_eq!(problems.len(), 1);
    }

    #[test]
    fn test_verify_used_chunk() {
        let (mut region, mut page, offsets) = region_with(&[b"one", b"two", b"six"]);
        free_chunk(&mut region, &mut page, offsets[1]).unwrap();

        assert!(verify_used_chunk(&page, ChunkReference::new(4, offsets[0])).is_ok());

        let err = verify_used_chunk(&page, ChunkReference::new(4, offsets[1])).unwrap_err();
        assert!(matches!(
            crate::error::fatal_cause(&err),
            Some(FatalStorageError::FreeChunkReference { .. })
        ));

        let err = verify_used_chunk(&page, ChunkReference::new(4, offsets[0] + 1)).unwrap_err();
        assert!(matches!(
            crate::error::fatal_cause(&err),
            Some(FatalStorageError::InvalidReference { .. })
        ));
    }

    #[test]
    fn test_dump_region_lists_chunks() {
        let (region, page, _) = region_with(&[b"one"]);
        let lines = dump_region(4, &region, Some(&page), 0);

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("region: id:0004"));
        assert!(lines[2].contains("SHORT"));
        assert!(lines[2].contains("len:0003"));
        assert!(lines[3].contains("FREE"));

        let paged = dump_region(4, &region, None, 0);
        assert!(paged[1].ends_with("PAGED"));
    }

    #[test]
    fn test_rolling_log_keeps_recent_entries() {
        let mut log = RollingLog::new(true);
        for i in 0..ROLLING_LOG_SIZE + 5 {
            log.record(format_args!("op {}", i));
        }
        assert_eq!(log.len(), ROLLING_LOG_SIZE);
        log.flush();
        assert!(log.is_empty());

        let mut quiet = RollingLog::new(false);
        quiet.record(format_args!("ignored"));
        assert!(quiet.is_empty());
    }
}
