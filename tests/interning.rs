//! # String Interning Tests
//!
//! End-to-end coverage of the two-phase indirect-string protocol:
//!
//! 1. Names committed in one process are found (and read back
//!    byte-identical) after reopen.
//! 2. Interned bodies are unique: equal contents iff equal addresses,
//!    re-adding an existing string is free.
//! 3. Bulk insertion: every inserted string is findable afterwards and
//!    the body count matches the unique input count.
//! 4. A corrupted slot whose payload still carries the heap tag is
//!    refused as a bad address, without a crash.

use stratadb::{find_string, read_string_at, Database, IndexKind, IndirectString, StoreError,
    StringAdder, TypedAddress};
use tempfile::tempdir;

/// Interns `names` in one transaction; returns the slot address of each.
fn commit_names(db: &mut Database, names: &[&str]) -> Vec<stratadb::Address> {
    let mut txn = db.begin().unwrap();
    let mut index = txn.db().name_index().unwrap();
    let mut adder = StringAdder::with_expected_size(names.len());

    let mut slots = Vec::new();
    for name in names {
        let (slot, _) = adder.add(&mut txn, &mut index, name).unwrap();
        slots.push(slot);
    }
    adder.flush(&mut txn).unwrap();

    let block = index.flush(&mut txn).unwrap();
    txn.set_root(IndexKind::Names, block);
    txn.commit().unwrap();
    slots
}

#[test]
fn names_survive_reopen_and_read_back_identically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    {
        let mut db = Database::create(&path).unwrap();
        commit_names(&mut db, &["alpha", "beta", "gamma"]);
    }

    let db = Database::open(&path).unwrap();
    let names = db.name_index().unwrap();
    assert_eq!(names.len(), 3);

    for name in ["alpha", "beta", "gamma"] {
        let slot = find_string(&names, &db, name)
            .unwrap()
            .unwrap_or_else(|| panic!("'{name}' not found"));
        assert_eq!(read_string_at(&db, slot).unwrap(), name);
    }
    assert!(find_string(&names, &db, "delta").unwrap().is_none());
}

#[test]
fn interned_strings_are_unique_by_address() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");
    let mut db = Database::create(&path).unwrap();

    // Adding the same content twice in one transaction yields one slot.
    {
        let mut txn = db.begin().unwrap();
        let mut index = txn.db().name_index().unwrap();
        let mut adder = StringAdder::new();

        let (first, inserted_first) = adder.add(&mut txn, &mut index, "main").unwrap();
        let (second, inserted_second) = adder.add(&mut txn, &mut index, "main").unwrap();
        assert!(inserted_first);
        assert!(!inserted_second);
        assert_eq!(first, second);
        assert_eq!(adder.pending(), 1);

        adder.flush(&mut txn).unwrap();
        let block = index.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Names, block);
        txn.commit().unwrap();
    }

    // Re-adding it in a later transaction is also free.
    {
        let mut txn = db.begin().unwrap();
        let mut index = txn.db().name_index().unwrap();
        let mut adder = StringAdder::new();

        let size_before = txn.size();
        let (_, inserted) = adder.add(&mut txn, &mut index, "main").unwrap();
        assert!(!inserted);
        assert_eq!(adder.pending(), 0);
        assert_eq!(txn.size(), size_before, "idempotent re-add must not allocate");
    }

    // Two committed strings: address equality iff content equality.
    commit_names(&mut db, &["other"]);
    let names = db.name_index().unwrap();
    let main_slot = find_string(&names, &db, "main").unwrap().unwrap();
    let other_slot = find_string(&names, &db, "other").unwrap().unwrap();
    assert_ne!(main_slot, other_slot);

    let main_body = IndirectString::read(&db, TypedAddress::new(main_slot))
        .unwrap()
        .in_store_address()
        .unwrap();
    let other_body = IndirectString::read(&db, TypedAddress::new(other_slot))
        .unwrap()
        .in_store_address()
        .unwrap();
    assert_ne!(main_body, other_body);
    assert_eq!(main_body.absolute() % 2, 0, "bodies must be 2-aligned");
    assert_eq!(other_body.absolute() % 2, 0);
}

#[test]
fn bulk_insertion_finds_every_string_afterwards() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    // Deterministic pseudo-random 32-byte strings, with duplicates mixed
    // in to exercise the uniqueness path.
    let mut inputs: Vec<String> = (0..2_000u64)
        .map(|i| {
            let h = xxhash(i);
            format!("{h:016x}{:016x}", h.rotate_left(17))
        })
        .collect();
    inputs.extend(inputs.clone().into_iter().take(250));

    let unique: std::collections::BTreeSet<&str> =
        inputs.iter().map(String::as_str).collect();

    {
        let mut db = Database::create(&path).unwrap();
        let mut txn = db.begin().unwrap();
        let mut index = txn.db().name_index().unwrap();
        let mut adder = StringAdder::with_expected_size(inputs.len());

        let mut first_insertions = 0usize;
        for s in &inputs {
            let (_, inserted) = adder.add(&mut txn, &mut index, s).unwrap();
            if inserted {
                first_insertions += 1;
            }
        }
        assert_eq!(first_insertions, unique.len());
        assert_eq!(adder.pending(), unique.len());

        adder.flush(&mut txn).unwrap();
        let block = index.flush(&mut txn).unwrap();
        txn.set_root(IndexKind::Names, block);
        txn.commit().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let names = db.name_index().unwrap();
    assert_eq!(names.len(), unique.len() as u64);

    for s in &unique {
        let slot = find_string(&names, &db, s).unwrap();
        let slot = slot.unwrap_or_else(|| panic!("'{s}' not found after commit"));
        assert_eq!(&read_string_at(&db, slot).unwrap(), s);
    }

    // Iteration visits every slot exactly once.
    let mut seen = std::collections::BTreeSet::new();
    for leaf in names.iter(&db) {
        let body = read_string_at(&db, leaf.unwrap()).unwrap();
        assert!(seen.insert(body), "duplicate body during iteration");
    }
    assert_eq!(seen.len(), unique.len());
}

#[test]
fn heap_tagged_slot_reads_as_bad_address() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.db");

    let slot = {
        let mut db = Database::create(&path).unwrap();
        commit_names(&mut db, &["victim"])[0]
    };

    // Corrupt the committed slot: point it back at a bogus heap address,
    // as a crashed writer that never patched its strings would have.
    {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let bogus: u64 = 0xDEAD_BEE1; // LSB set: heap-tagged
        file.write_all_at(&bogus.to_le_bytes(), slot.absolute())
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let indirect = IndirectString::read(&db, TypedAddress::new(slot)).unwrap();
    assert!(!indirect.is_in_store());

    let err = indirect.to_string(&db).unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::BadAddress { .. })
        ),
        "expected BadAddress, got: {err:#}"
    );
}

/// xxh3 as a counter-seeded generator; deterministic across runs.
fn xxhash(i: u64) -> u64 {
    xxhash_rust::xxh3::xxh3_64(&i.to_le_bytes())
}
