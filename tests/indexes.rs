//! # Index Structure Tests
//!
//! End-to-end coverage of the HAMT shape guarantees through the public
//! API, using digests whose low 64 bits — the trie hash — are chosen
//! exactly:
//!
//! 1. 2^6 + 1 keys sharing a top-level slot force a branch split and all
//!    remain findable; the key count is exact.
//! 2. Keys with fully identical hashes end in a linear collision node and
//!    still behave as distinct keys.
//! 3. Extents round-trip through the fragment index and out-of-bounds
//!    extents are refused.
//! 4. Several indexes flushed in one transaction keep their roots apart.

use stratadb::{Address, Database, Digest, Extent, IndexKind, StoreError};
use tempfile::tempdir;

/// A digest whose trie hash (low 8 bytes) is exactly `hash`.
fn keyed(hash: u64, salt: u64) -> Digest {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&hash.to_le_bytes());
    bytes[8..].copy_from_slice(&salt.to_le_bytes());
    Digest(bytes)
}

#[test]
fn sixty_five_keys_in_one_slot_split_the_branch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let mut db = Database::create(&path).unwrap();

    // All 65 keys share top-level chunk 7; chunk 1 distinguishes the
    // first 64, and key 64 collides with key 0 there too, forcing a
    // second split.
    let keys: Vec<Digest> = (0..65u64).map(|i| keyed(7 | (i << 6), 0)).collect();

    {
        let mut txn = db.begin().unwrap();
        let mut fragments = txn.db().fragment_index().unwrap();
        for (i, key) in keys.iter().enumerate() {
            let (_, inserted) = fragments
                .insert(&mut txn, key, &Extent::new(Address::new(128), i as u64))
                .unwrap();
            assert!(inserted);
        }
        assert_eq!(fragments.len(), 65);
        let block = fragments.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Fragments, block);
        txn.commit().unwrap();
    }

    drop(db);
    let db = Database::open(&path).unwrap();
    let fragments = db.fragment_index().unwrap();
    assert_eq!(fragments.len(), 65);
    for (i, key) in keys.iter().enumerate() {
        let extent = fragments
            .get(&db, key)
            .unwrap()
            .unwrap_or_else(|| panic!("key {i} lost in the split"));
        assert_eq!(extent.size(), i as u64);
    }
}

#[test]
fn fully_colliding_hashes_behave_as_distinct_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let mut db = Database::create(&path).unwrap();

    // Identical 64-bit hashes, distinct digests: only content comparison
    // in a linear node can tell these apart.
    let keys: Vec<Digest> = (0..4u64).map(|salt| keyed(0xFEED_F00D, salt)).collect();

    {
        let mut txn = db.begin().unwrap();
        let mut fragments = txn.db().fragment_index().unwrap();
        for (i, key) in keys.iter().enumerate() {
            fragments
                .insert(&mut txn, key, &Extent::new(Address::new(128), i as u64))
                .unwrap();
        }
        let block = fragments.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Fragments, block);
        txn.commit().unwrap();
    }

    drop(db);
    let db = Database::open(&path).unwrap();
    let fragments = db.fragment_index().unwrap();
    assert_eq!(fragments.len(), 4);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(fragments.get(&db, key).unwrap().unwrap().size(), i as u64);
    }
    assert!(fragments.get(&db, &keyed(0xFEED_F00D, 99)).unwrap().is_none());
}

#[test]
fn extents_round_trip_and_bounds_are_enforced() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("t.db")).unwrap();

    let payload = b"fragment-record-payload";
    let (key, extent) = {
        let mut txn = db.begin().unwrap();
        let addr = txn.put_bytes(payload, 8).unwrap();
        let extent = Extent::new(addr, payload.len() as u64);
        let key = Digest::of(payload);

        let mut fragments = txn.db().fragment_index().unwrap();
        fragments.insert(&mut txn, &key, &extent).unwrap();
        let block = fragments.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Fragments, block);
        txn.commit().unwrap();
        (key, extent)
    };

    let fragments = db.fragment_index().unwrap();
    let found = fragments.get(&db, &key).unwrap().unwrap();
    assert_eq!(found, extent);
    assert_eq!(&*db.get_extent(found).unwrap(), payload);

    // An extent reaching past the committed bytes is refused.
    let bogus = Extent::new(Address::new(found.addr()), 1 << 40);
    let err = db.get_extent(bogus).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::BadAddress { .. })
    ));
}

#[test]
fn indexes_flushed_together_keep_distinct_roots() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let mut db = Database::create(&path).unwrap();

    {
        let mut txn = db.begin().unwrap();
        let mut fragments = txn.db().fragment_index().unwrap();
        let mut compilations = txn.db().compilation_index().unwrap();
        let mut debug_lines = txn.db().debug_line_header_index().unwrap();

        fragments
            .insert(&mut txn, &keyed(1, 0), &Extent::new(Address::new(128), 1))
            .unwrap();
        compilations
            .insert(&mut txn, &keyed(2, 0), &Extent::new(Address::new(128), 2))
            .unwrap();
        debug_lines
            .insert(&mut txn, &keyed(3, 0), &Extent::new(Address::new(128), 3))
            .unwrap();

        let fragment_block = fragments.flush(&mut txn).unwrap();
        let compilation_block = compilations.flush(&mut txn).unwrap();
        let debug_block = debug_lines.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Fragments, fragment_block);
        txn.set_root(IndexKind::Compilations, compilation_block);
        txn.set_root(IndexKind::DebugLineHeaders, debug_block);
        txn.commit().unwrap();
    }

    drop(db);
    let db = Database::open(&path).unwrap();

    let fragments = db.fragment_index().unwrap();
    let compilations = db.compilation_index().unwrap();
    let debug_lines = db.debug_line_header_index().unwrap();

    assert!(fragments.get(&db, &keyed(1, 0)).unwrap().is_some());
    assert!(fragments.get(&db, &keyed(2, 0)).unwrap().is_none());
    assert!(compilations.get(&db, &keyed(2, 0)).unwrap().is_some());
    assert!(debug_lines.get(&db, &keyed(3, 0)).unwrap().is_some());

    let roots: Vec<_> = [
        IndexKind::Fragments,
        IndexKind::Compilations,
        IndexKind::DebugLineHeaders,
    ]
    .iter()
    .map(|&k| db.index_root(k).unwrap().unwrap())
    .collect();
    assert_ne!(roots[0], roots[1]);
    assert_ne!(roots[1], roots[2]);
}

#[test]
fn dirty_index_is_searchable_before_flush() {
    let dir = tempdir().unwrap();
    let mut db = Database::create(dir.path().join("t.db")).unwrap();

    let mut txn = db.begin().unwrap();
    let mut fragments = txn.db().fragment_index().unwrap();
    for i in 0..40u64 {
        fragments
            .insert(&mut txn, &keyed(i * 131, i), &Extent::new(Address::new(128), i))
            .unwrap();
    }
    assert!(fragments.is_dirty());
    assert_eq!(fragments.len(), 40);
    for i in 0..40u64 {
        assert_eq!(
            fragments.get(txn.db(), &keyed(i * 131, i)).unwrap().unwrap().size(),
            i
        );
    }
    // Abandon: the dirty index dies with the transaction.
}
