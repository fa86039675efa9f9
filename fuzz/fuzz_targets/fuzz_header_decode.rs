//! Fuzz testing for the chunk header codec.
//!
//! Decodes arbitrary bytes as a chunk header and, when the header fits in a
//! region, re-encodes a chunk of the same length and checks that it decodes
//! back to the same class, length and deref count.

#![no_main]

use libfuzzer_sys::fuzz_target;

use chunkstore::chunk::header::{self, ChunkHeader};
use chunkstore::config::{MAX_CHUNK_LEN, MIN_CHUNK_LEN};

fuzz_target!(|data: &[u8]| {
    let Some(decoded) = ChunkHeader::try_decode(data) else {
        return;
    };
    let _ = decoded.full_len();

    let len = usize::from(decoded.len());
    if !(MIN_CHUNK_LEN..=MAX_CHUNK_LEN).contains(&len) {
        return;
    }
    let payload = vec![0xA5u8; len];
    let mut page = vec![0u8; usize::from(header::full_len_for(len))];
    header::write_used(&mut page, 0, &payload, decoded.deref());

    let again = header::header_at(&page, 0);
    assert_eq!(again.len(), decoded.len());
    assert_eq!(again.deref(), decoded.deref());
    assert_eq!(header::data_at(&page, 0), &payload[..]);
});
