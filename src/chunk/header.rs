//! # Chunk Header Codec
//!
//! Chunks are stored back to back inside a region, each starting with a
//! tagged header of two, three or four bytes. The header class is picked from
//! the payload length so that small attribute values pay only two bytes of
//! overhead.
//!
//! ## Header Layout
//!
//! ```text
//! byte 0 bits:  7     6     5     4..0
//!               FREE  TAG1  TAG2  length bits
//!
//! Short  (TAG1=0):        [F 0 L5..L0] [deref]                  data @ 2
//! Medium (TAG1=1,TAG2=0): [F 1 0 L12..L8] [deref] [L7..L0]      data @ 3
//! Long   (TAG1=1,TAG2=1): [F 1 1 00000]  [deref] [L15..L8] [L7..L0]  data @ 4
//! ```
//!
//! The deref count lives at byte 1 in every class, so it can be read and
//! bumped without decoding the length.
//!
//! ## Free Chunks
//!
//! A free chunk uses the same layout with the FREE bit set. It has no deref
//! count; instead the byte offset of the next free chunk in the region is
//! split across the deref slot (low byte) and the first data byte (high
//! byte). A next offset of zero ends the chain.
//!
//! The class of a free chunk is chosen from its full length, so a free chunk
//! of N bytes is encoded exactly like a used chunk of N bytes would be.
//!
//! ## Offsets
//!
//! All functions take the region buffer and the byte offset of the chunk's
//! first header byte inside it. Callers are responsible for passing offsets
//! that point at real chunks; [`ChunkHeader::try_decode`] exists for the one
//! place that has to handle untrusted offsets.

use crate::config::{
    CHUNK_DEREF_OFFSET, CHUNK_FREE_FLAG, CHUNK_TAG1, CHUNK_TAG2, LONG_DATA_OFFSET,
    MAX_MEDIUM_CHUNK_LEN, MAX_SHORT_CHUNK_LEN, MEDIUM_DATA_OFFSET, SHORT_DATA_OFFSET,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Short,
    Medium,
    Long,
}

impl SizeClass {
    #[inline]
    pub fn for_data_len(len: usize) -> Self {
        if len <= MAX_SHORT_CHUNK_LEN {
            SizeClass::Short
        } else if len <= MAX_MEDIUM_CHUNK_LEN {
            SizeClass::Medium
        } else {
            SizeClass::Long
        }
    }

    #[inline]
    pub fn for_full_len(full_len: usize) -> Self {
        if full_len <= MAX_SHORT_CHUNK_LEN + SHORT_DATA_OFFSET {
            SizeClass::Short
        } else if full_len <= MAX_MEDIUM_CHUNK_LEN + MEDIUM_DATA_OFFSET {
            SizeClass::Medium
        } else {
            SizeClass::Long
        }
    }

    #[inline]
    pub fn data_offset(self) -> usize {
        match self {
            SizeClass::Short => SHORT_DATA_OFFSET,
            SizeClass::Medium => MEDIUM_DATA_OFFSET,
            SizeClass::Long => LONG_DATA_OFFSET,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SizeClass::Short => "SHORT",
            SizeClass::Medium => "MEDIUM",
            SizeClass::Long => "LONG",
        }
    }
}

/// Full length (header plus payload) of a chunk holding `data_len` bytes.
#[inline]
pub fn full_len_for(data_len: usize) -> u16 {
    (data_len + SizeClass::for_data_len(data_len).data_offset()) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    Short { len: u16, deref: u8 },
    Medium { len: u16, deref: u8 },
    Long { len: u16, deref: u8 },
}

impl ChunkHeader {
    /// Decodes the header at the start of `bytes`.
    #[inline]
    pub fn decode(bytes: &[u8]) -> Self {
        let tag = bytes[0];
        let deref = bytes[CHUNK_DEREF_OFFSET];
        if tag & CHUNK_TAG1 == 0 {
            ChunkHeader::Short {
                len: u16::from(tag & 0x3F),
                deref,
            }
        } else if tag & CHUNK_TAG2 == 0 {
            ChunkHeader::Medium {
                len: (u16::from(tag & 0x1F) << 8) | u16::from(bytes[2]),
                deref,
            }
        } else {
            ChunkHeader::Long {
                len: (u16::from(bytes[2]) << 8) | u16::from(bytes[3]),
                deref,
            }
        }
    }

    /// Like [`decode`](Self::decode), but returns `None` when `bytes` ends
    /// before the header does.
    pub fn try_decode(bytes: &[u8]) -> Option<Self> {
        let tag = *bytes.first()?;
        let needed = if tag & CHUNK_TAG1 == 0 {
            SHORT_DATA_OFFSET
        } else if tag & CHUNK_TAG2 == 0 {
            MEDIUM_DATA_OFFSET
        } else {
            LONG_DATA_OFFSET
        };
        if bytes.len() < needed {
            return None;
        }
        Some(Self::decode(bytes))
    }

    #[inline]
    pub fn class(&self) -> SizeClass {
        match self {
            ChunkHeader::Short { .. } => SizeClass::Short,
            ChunkHeader::Medium { .. } => SizeClass::Medium,
            ChunkHeader::Long { .. } => SizeClass::Long,
        }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        match *self {
            ChunkHeader::Short { len, .. }
            | ChunkHeader::Medium { len, .. }
            | ChunkHeader::Long { len, .. } => len,
        }
    }

    #[inline]
    pub fn deref(&self) -> u8 {
        match *self {
            ChunkHeader::Short { deref, .. }
            | ChunkHeader::Medium { deref, .. }
            | ChunkHeader::Long { deref, .. } => deref,
        }
    }

    #[inline]
    pub fn data_offset(&self) -> usize {
        self.class().data_offset()
    }

    #[inline]
    pub fn full_len(&self) -> u16 {
        self.len().saturating_add(self.data_offset() as u16)
    }
}

#[inline]
fn at(offset: u16) -> usize {
    offset as usize
}

#[inline]
pub fn header_at(page: &[u8], offset: u16) -> ChunkHeader {
    ChunkHeader::decode(&page[at(offset)..])
}

#[inline]
pub fn is_free(page: &[u8], offset: u16) -> bool {
    page[at(offset)] & CHUNK_FREE_FLAG != 0
}

#[inline]
pub fn full_len_at(page: &[u8], offset: u16) -> u16 {
    header_at(page, offset).full_len()
}

#[inline]
pub fn data_len_at(page: &[u8], offset: u16) -> u16 {
    header_at(page, offset).len()
}

#[inline]
pub fn deref_at(page: &[u8], offset: u16) -> u8 {
    page[at(offset) + CHUNK_DEREF_OFFSET]
}

#[inline]
pub fn set_deref(page: &mut [u8], offset: u16, deref: u8) {
    page[at(offset) + CHUNK_DEREF_OFFSET] = deref;
}

pub fn data_at(page: &[u8], offset: u16) -> &[u8] {
    let header = header_at(page, offset);
    let start = at(offset) + header.data_offset();
    &page[start..start + header.len() as usize]
}

#[inline]
pub fn next_free(page: &[u8], offset: u16) -> u16 {
    let header = header_at(page, offset);
    let high = page[at(offset) + header.data_offset()];
    (u16::from(high) << 8) | u16::from(page[at(offset) + CHUNK_DEREF_OFFSET])
}

#[inline]
pub fn set_next_free(page: &mut [u8], offset: u16, next: u16) {
    let header = header_at(page, offset);
    page[at(offset) + CHUNK_DEREF_OFFSET] = next as u8;
    page[at(offset) + header.data_offset()] = (next >> 8) as u8;
}

fn write_header(page: &mut [u8], offset: u16, full_len: u16, free: bool, slot: u8) -> usize {
    let class = SizeClass::for_full_len(full_len as usize);
    let data_offset = class.data_offset();
    let len = full_len as usize - data_offset;
    let flag = if free { CHUNK_FREE_FLAG } else { 0 };
    let bytes = &mut page[at(offset)..];

    match class {
        SizeClass::Short => {
            bytes[0] = flag | len as u8;
        }
        SizeClass::Medium => {
            bytes[0] = flag | CHUNK_TAG1 | (len >> 8) as u8;
            bytes[2] = len as u8;
        }
        SizeClass::Long => {
            bytes[0] = flag | CHUNK_TAG1 | CHUNK_TAG2;
            bytes[2] = (len >> 8) as u8;
            bytes[3] = len as u8;
        }
    }
    bytes[CHUNK_DEREF_OFFSET] = slot;
    at(offset) + data_offset
}

/// Writes a used chunk holding `data` at `offset`. Returns its full length.
pub fn write_used(page: &mut [u8], offset: u16, data: &[u8], deref: u8) -> u16 {
    let full_len = full_len_for(data.len());
    let start = write_header(page, offset, full_len, false, deref);
    page[start..start + data.len()].copy_from_slice(data);
    full_len
}

/// Writes a free chunk of `full_len` bytes linking to `next`.
pub fn write_free(page: &mut [u8], offset: u16, full_len: u16, next: u16) {
    let start = write_header(page, offset, full_len, true, next as u8);
    page[start] = (next >> 8) as u8;
}
