//! Fuzz testing for chunk store operations.
//!
//! Runs an arbitrary sequence of creates, fetches, deletes and migrations
//! against a paranoid store with a two-region cache, and checks every
//! live chunk against an in-memory model afterwards.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use chunkstore::config::{MAX_CHUNK_LEN, REGION_SIZE};
use chunkstore::{ChunkConfig, ChunkReference, ChunkStore};

#[derive(Debug, Arbitrary)]
enum Op {
    Create { len: u16, fill: u8, derefs: u8 },
    Fetch { index: u8 },
    Delete { index: u8 },
    Migrate { start: u8, count: u8 },
    NewPeriod,
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let config = ChunkConfig::new(dir.path().join("chunkswap"))
        .with_swap_initial_kib(0)
        .with_cache_memory(2 * REGION_SIZE)
        .with_paranoid(true);
    let mut store = ChunkStore::init(config).unwrap();
    let mut live: Vec<(ChunkReference, Vec<u8>)> = Vec::new();

    for op in ops.into_iter().take(512) {
        match op {
            Op::Create { len, fill, derefs } => {
                let len = usize::from(len) % MAX_CHUNK_LEN + 1;
                let data = vec![fill; len];
                let reference = store.create(&data, derefs).unwrap();
                live.push((reference, data));
            }
            Op::Fetch { index } if !live.is_empty() => {
                let (reference, data) = &live[usize::from(index) % live.len()];
                assert_eq!(&store.fetch_vec(*reference).unwrap(), data);
            }
            Op::Delete { index } if !live.is_empty() => {
                let (reference, _) = live.swap_remove(usize::from(index) % live.len());
                store.delete(reference).unwrap();
            }
            Op::Migrate { start, count } if !live.is_empty() => {
                let start = usize::from(start) % live.len();
                let end = (start + usize::from(count)).min(live.len());
                let mut refs: Vec<&mut ChunkReference> =
                    live[start..end].iter_mut().map(|(r, _)| r).collect();
                store.migrate(&mut refs).unwrap();
            }
            Op::NewPeriod => store.new_period(),
            _ => {}
        }
    }

    for (reference, data) in &live {
        assert_eq!(&store.fetch_vec(*reference).unwrap(), data);
    }
    store.verify_all().unwrap();
});
