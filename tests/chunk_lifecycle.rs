//! # Chunk Lifecycle Integration Tests
//!
//! End-to-end checks of create, fetch, len, derefs and delete through the
//! public `ChunkStore` API:
//!
//! - round trips across every header class
//! - deref counting and saturation
//! - space accounting: used plus free bytes always tile the regions
//! - coalescing and reuse of deleted space
//! - region accounting against a full rescan (paranoid mode)
//! - fatal errors for bad references and lengths

use chunkstore::config::{MAX_CHUNK_LEN, REGION_CAPACITY};
use chunkstore::error::fatal_cause;
use chunkstore::{ChunkConfig, ChunkReference, ChunkStore, FatalStorageError, Fetch};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn create_test_store() -> (ChunkStore, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = ChunkConfig::new(dir.path().join("chunkswap"))
        .with_swap_initial_kib(0)
        .with_paranoid(true);
    (ChunkStore::init(config).unwrap(), dir)
}

/// Payload plus header bytes of every live chunk, plus every region's free
/// bytes, must equal the regions' combined capacity.
fn assert_space_accounted(store: &ChunkStore) {
    let stats = store.statistics();
    let free: u64 = (0..store.region_count() as u16)
        .map(|id| u64::from(store.region(id).unwrap().free_bytes))
        .sum();
    assert_eq!(
        stats.total_bytes() + stats.header_bytes() + free,
        (store.region_count() * REGION_CAPACITY) as u64
    );
}

mod round_trip_tests {
    use super::*;

    #[test]
    fn hello_then_world2_reuses_the_region() {
        let (mut store, _dir) = create_test_store();

        let reference = store.create(b"hello", 0).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(store.fetch(reference, &mut buf).unwrap(), Fetch::Copied(5));
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(store.derefs(reference).unwrap(), 1);
        assert_eq!(store.len(reference).unwrap(), 5);
        assert_eq!(store.derefs(reference).unwrap(), 2);

        store.delete(reference).unwrap();
        let world = store.create(b"world2", 0).unwrap();

        assert_eq!(store.region_count(), 1);
        assert_eq!(store.fetch_vec(world).unwrap(), b"world2");
        store.verify_all().unwrap();
    }

    #[test]
    fn every_header_class_round_trips() {
        let (mut store, _dir) = create_test_store();
        let lengths = [1usize, 2, 0x3F, 0x40, 0x100, 0x1FFF, 0x2000, 40000, MAX_CHUNK_LEN];

        let chunks: Vec<(ChunkReference, Vec<u8>, u8)> = lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let data: Vec<u8> = (0..len).map(|b| (b * 31 + i) as u8).collect();
                let derefs = (i * 37) as u8;
                (store.create(&data, derefs).unwrap(), data, derefs)
            })
            .collect();

        for (reference, data, derefs) in &chunks {
            assert_eq!(store.derefs(*reference).unwrap(), *derefs);
            assert_eq!(&store.fetch_vec(*reference).unwrap(), data);
            assert_eq!(usize::from(store.len(*reference).unwrap()), data.len());
        }

        let stats = store.statistics();
        assert_eq!(stats.short.count, 3);
        assert_eq!(stats.medium.count, 3);
        assert_eq!(stats.long.count, 3);
        assert_space_accounted(&store);
        store.verify_all().unwrap();
    }

    #[test]
    fn too_small_buffer_reports_length_and_still_counts() {
        let (mut store, _dir) = create_test_store();
        let reference = store.create(&[9u8; 300], 0).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(store.fetch(reference, &mut buf).unwrap(), Fetch::TooSmall(300));
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(store.derefs(reference).unwrap(), 1);

        let mut buf = vec![0u8; 300];
        assert_eq!(store.fetch(reference, &mut buf).unwrap(), Fetch::Copied(300));
        assert!(buf.iter().all(|&b| b == 9));
    }
}

mod deref_tests {
    use super::*;

    #[test]
    fn fetch_and_len_saturate_at_255() {
        let (mut store, _dir) = create_test_store();
        let reference = store.create(b"popular", 250).unwrap();

        for expected in 251..=255u8 {
            store.fetch_vec(reference).unwrap();
            assert_eq!(store.derefs(reference).unwrap(), expected);
        }
        for _ in 0..10 {
            store.len(reference).unwrap();
            store.fetch_vec(reference).unwrap();
        }
        assert_eq!(store.derefs(reference).unwrap(), 255);
        assert_eq!(store.statistics().deref_maxxed, 1);
        store.verify_all().unwrap();
    }

    #[test]
    fn derefs_query_does_not_count() {
        let (mut store, _dir) = create_test_store();
        let reference = store.create(b"quiet", 4).unwrap();

        for _ in 0..5 {
            assert_eq!(store.derefs(reference).unwrap(), 4);
        }
        assert_eq!(store.statistics().deref_count, 0);
    }
}

mod space_tests {
    use super::*;

    #[test]
    fn random_churn_never_leaks_space() {
        let (mut store, _dir) = create_test_store();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<(ChunkReference, Vec<u8>)> = Vec::new();

        for step in 0..3000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let len = if rng.gen_bool(0.05) {
                    rng.gen_range(0x2000..20000)
                } else {
                    rng.gen_range(1..300)
                };
                let mut data = vec![0u8; len];
                rng.fill(&mut data[..]);
                let reference = store.create(&data, rng.gen_range(0..64)).unwrap();
                live.push((reference, data));
            } else {
                let (reference, _) = live.swap_remove(rng.gen_range(0..live.len()));
                store.delete(reference).unwrap();
            }
            if step % 100 == 0 {
                assert_space_accounted(&store);
            }
        }

        assert_space_accounted(&store);
        for (reference, data) in &live {
            assert_eq!(&store.fetch_vec(*reference).unwrap(), data);
        }
        store.verify_all().unwrap();
    }

    #[test]
    fn deleting_neighbours_coalesces_into_one_hole() {
        let (mut store, _dir) = create_test_store();

        let refs: Vec<ChunkReference> = (0..10u8)
            .map(|i| store.create(&[i; 100], 0).unwrap())
            .collect();
        assert_eq!(store.region(0).unwrap().free_count, 1);

        // odd ones first: five separate holes
        for reference in refs.iter().skip(1).step_by(2) {
            store.delete(*reference).unwrap();
        }
        assert_eq!(store.region(0).unwrap().free_count, 5);

        for reference in refs.iter().step_by(2) {
            store.delete(*reference).unwrap();
        }
        let region = store.region(0).unwrap();
        assert_eq!(region.free_count, 1);
        assert_eq!(region.used_count, 0);
        assert_eq!(usize::from(region.free_bytes), REGION_CAPACITY);
        assert_eq!(usize::from(region.largest_free_chunk), REGION_CAPACITY);
        store.verify_all().unwrap();
    }

    #[test]
    fn exact_size_hole_is_reused() {
        let (mut store, _dir) = create_test_store();

        store.create(&[1u8; 50], 0).unwrap();
        let middle = store.create(&[2u8; 50], 0).unwrap();
        store.create(&[3u8; 50], 0).unwrap();
        store.delete(middle).unwrap();

        let again = store.create(&[4u8; 50], 0).unwrap();
        assert_eq!(again, middle);
        assert_eq!(store.region(0).unwrap().free_count, 1);
        store.verify_all().unwrap();
    }

    #[test]
    fn full_regions_spill_into_new_ones() {
        let (mut store, _dir) = create_test_store();

        for i in 0..4u8 {
            store.create(&vec![i; 30000], 0).unwrap();
        }
        assert_eq!(store.region_count(), 2);
        assert_space_accounted(&store);
        store.verify_all().unwrap();
    }
}

mod error_tests {
    use super::*;

    fn assert_fatal(result: eyre::Result<impl std::fmt::Debug>, check: fn(&FatalStorageError) -> bool) {
        let err = result.unwrap_err();
        let cause = fatal_cause(&err).expect("typed cause");
        assert!(check(cause), "unexpected cause: {:?}", cause);
    }

    #[test]
    fn illegal_lengths_are_fatal() {
        let (mut store, _dir) = create_test_store();

        assert_fatal(store.create(&[], 0), |e| {
            matches!(e, FatalStorageError::IllegalLength { len: 0 })
        });
        assert_fatal(store.create(&vec![0u8; MAX_CHUNK_LEN + 1], 0), |e| {
            matches!(e, FatalStorageError::IllegalLength { .. })
        });
        assert_eq!(store.region_count(), 0);
    }

    #[test]
    fn stale_references_are_fatal() {
        let (mut store, _dir) = create_test_store();

        store.create(&[1u8; 20], 0).unwrap();
        let victim = store.create(&[2u8; 20], 0).unwrap();
        store.create(&[3u8; 20], 0).unwrap();
        store.delete(victim).unwrap();

        assert_fatal(store.fetch_vec(victim), |e| {
            matches!(e, FatalStorageError::FreeChunkReference { .. })
        });
        assert_fatal(store.fetch_vec(ChunkReference::new(5, 8)), |e| {
            matches!(e, FatalStorageError::InvalidReference { .. })
        });
        assert_fatal(store.delete(ChunkReference::new(0, 3)), |e| {
            matches!(e, FatalStorageError::InvalidReference { .. })
        });
    }

    #[test]
    fn paranoid_mode_rejects_mid_chunk_reference() {
        let (mut store, _dir) = create_test_store();
        let reference = store.create(&[0u8; 200], 0).unwrap();

        // points into the zero-filled payload, which decodes as a header
        let inside = ChunkReference::new(reference.region(), reference.offset() + 10);
        assert_fatal(store.fetch_vec(inside), |e| {
            matches!(e, FatalStorageError::InvalidReference { .. })
        });
    }
}
