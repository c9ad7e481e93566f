//! End-to-end scenarios against the public `Database` API, exercising
//! open/commit/reopen durability, split/merge under load, tail-block
//! spilling, and rollback byte-identity.

use crab_btree_store::Database;
use std::fs;

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

#[test]
fn basic_insert_commit_reopen_yields_sorted_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    {
        let mut db = Database::new("scenario1", 4);
        db.set_block_size(256);
        db.open(&path).unwrap();
        db.insert(&key(1), b"a").unwrap();
        db.insert(&key(2), b"bb").unwrap();
        db.insert(&key(3), b"ccc").unwrap();
        db.commit().unwrap();
    }

    let mut db = Database::new("scenario1", 4);
    db.set_block_size(256);
    db.open(&path).unwrap();

    let mut collected = Vec::new();
    db.for_all(|k, v| collected.push((k.to_vec(), v.to_vec()))).unwrap();
    assert_eq!(
        collected,
        vec![
            (key(1).to_vec(), b"a".to_vec()),
            (key(2).to_vec(), b"bb".to_vec()),
            (key(3).to_vec(), b"ccc".to_vec()),
        ]
    );
    assert_eq!(db.record_count(), 3);
    assert_eq!(db.index_levels(), 0);
}

#[test]
fn two_hundred_inserts_force_splits_and_stay_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("scenario2", 4);
    db.set_block_size(256);
    db.open(&path).unwrap();
    db.insert(&key(1), b"a").unwrap();
    db.commit().unwrap();

    let value = vec![b'v'; 30];
    for n in 10..210u32 {
        db.insert(&key(n), &value).unwrap();
    }
    db.commit().unwrap();

    assert!(db.index_levels() >= 1);
    assert_eq!(db.find(&key(1)).unwrap(), Some(b"a".to_vec()));

    let range = db.find_range(&key(150), &key(160)).unwrap();
    assert_eq!(range.len(), 11);
    let keys: Vec<u32> = range.iter().map(|(k, _)| u32::from_be_bytes(k[..4].try_into().unwrap())).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
}

#[test]
fn oversized_value_spills_to_tail_blocks_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("scenario3", 4);
    db.set_block_size(256);
    db.open(&path).unwrap();

    let before = db.total_block_count();
    let big_value: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    db.insert(&key(500), &big_value).unwrap();
    db.commit().unwrap();

    let after = db.total_block_count();
    // 10 KB spread over 256-byte tail blocks needs dozens of extra blocks.
    assert!(after > before + 30, "tail blocks should grow the file by many blocks");
    assert_eq!(db.find(&key(500)).unwrap(), Some(big_value));
}

#[test]
fn uncommitted_insert_is_visible_then_rollback_restores_byte_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("scenario4", 4);
    db.set_block_size(256);
    db.set_auto_commit(false);
    db.open(&path).unwrap();
    db.insert(&key(1), b"seed").unwrap();
    db.commit().unwrap();

    let before_bytes = fs::read(&path).unwrap();

    db.insert(&key(7), b"x").unwrap();
    assert_eq!(db.find(&key(7)).unwrap(), Some(b"x".to_vec()));

    db.rollback().unwrap();
    assert_eq!(db.find(&key(7)).unwrap(), None);

    let after_bytes = fs::read(&path).unwrap();
    assert_eq!(before_bytes, after_bytes);
}

#[test]
fn full_range_remove_collapses_tree_and_flatten_shrinks_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("scenario5", 4);
    db.set_block_size(512);
    db.open(&path).unwrap();

    for n in 0..2_000u32 {
        db.insert(&key(n), b"0123456789abcdefghij").unwrap();
    }
    db.commit().unwrap();

    let removed = db.remove_range(&key(0), &key(1_999)).unwrap();
    assert_eq!(removed.len(), 2_000);
    db.commit().unwrap();

    assert_eq!(db.record_count(), 0);
    assert!(db.free_block_count() > 0);

    let total_before_flatten = db.total_block_count();
    let flattened = db.try_flatten().unwrap();
    if flattened {
        assert!(db.total_block_count() < total_before_flatten);
    }
    assert_eq!(db.record_count(), 0);
    assert!(!db.contains(&key(0)).unwrap());

    db.insert(&key(42), b"back again").unwrap();
    db.commit().unwrap();
    assert_eq!(db.find(&key(42)).unwrap(), Some(b"back again".to_vec()));
}

#[test]
fn repeated_commit_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("idempotent", 4);
    db.set_block_size(256);
    db.set_auto_commit(false);
    db.open(&path).unwrap();
    db.insert(&key(9), b"nine").unwrap();
    db.commit().unwrap();
    db.commit().unwrap();

    assert_eq!(db.find(&key(9)).unwrap(), Some(b"nine".to_vec()));
    assert_eq!(db.record_count(), 1);
}

#[test]
fn empty_range_query_returns_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.bin");

    let mut db = Database::new("empty-range", 4);
    db.set_block_size(256);
    db.open(&path).unwrap();
    db.insert(&key(5), b"v").unwrap();
    db.commit().unwrap();

    assert!(db.find_range(&key(10), &key(1)).unwrap().is_empty());
}
