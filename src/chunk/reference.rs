//! # Chunk References
//!
//! A chunk reference is the only durable handle callers hold on a chunk. It
//! packs the region id and the byte offset inside that region into 32 bits:
//!
//! ```text
//! 31            16 15             0
//! +---------------+---------------+
//! |   region id   |    offset     |
//! +---------------+---------------+
//! ```
//!
//! Chunks never start before `FIRST_CHUNK_OFFSET`, so the all-zero value is
//! free to mean "no chunk". References order by region first and offset
//! second, which migration relies on to group candidates per region.

use std::fmt;

use crate::config::REGION_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChunkReference(u32);

impl ChunkReference {
    pub const NULL: ChunkReference = ChunkReference(0);

    #[inline]
    pub fn new(region: u16, offset: u16) -> Self {
        Self((u32::from(region) << 16) | u32::from(offset))
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn region(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub fn offset(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True if this reference lies strictly inside `region`.
    #[inline]
    pub fn is_in_region(self, region: u16) -> bool {
        let low = Self::new(region, 0);
        let high = Self::new(region, REGION_SIZE as u16);
        low < self && self < high
    }
}

impl fmt::Display for ChunkReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}{:04x}", self.region(), self.offset())
    }
}

impl From<ChunkReference> for u32 {
    fn from(reference: ChunkReference) -> u32 {
        reference.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_packs_region_and_offset() {
        let r = ChunkReference::new(0x0102, 0x0304);
        assert_eq!(r.raw(), 0x0102_0304);
        assert_eq!(r.region(), 0x0102);
        assert_eq!(r.offset(), 0x0304);
        assert_eq!(r.to_string(), "01020304");
    }

    #[test]
    fn test_null_reference() {
        assert!(ChunkReference::NULL.is_null());
        assert!(ChunkReference::default().is_null());
        assert!(!ChunkReference::new(0, 8).is_null());
    }

    #[test]
    fn test_ordering_is_region_major() {
        let a = ChunkReference::new(1, 60000);
        let b = ChunkReference::new(2, 8);
        let c = ChunkReference::new(2, 9);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_is_in_region() {
        assert!(ChunkReference::new(3, 8).is_in_region(3));
        assert!(!ChunkReference::new(3, 8).is_in_region(2));
        assert!(!ChunkReference::new(3, 0).is_in_region(3));
    }
}
