//! Integration tests for the paged store.
//!
//! These cover container-level behavior across sessions: the fresh layout,
//! header validation, and persistence of the indirection table, TOC, and
//! free lists.

use dsstore::{BlockNumber, Error, Store};
use tempfile::tempdir;

#[test]
fn test_fresh_container_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.store");

    Store::create(&path).unwrap().close().unwrap();
    let store = Store::open(&path).unwrap();

    // Root block at 2048, width 11.
    let root = store.block_address(BlockNumber(0)).unwrap();
    assert_eq!(root.offset(), 2048);
    assert_eq!(root.width(), 11);
    assert_eq!(store.block_count(), 1);
    assert!(store.toc_get("DSDB").is_none());

    // Documented initial free lists: one block per width at offset 2^w,
    // except width 11 (consumed by the root block) and width 31.
    for w in 5..=10u8 {
        assert_eq!(store.free_list(w), &[1u32 << w], "width {}", w);
    }
    assert!(store.free_list(11).is_empty());
    for w in 12..=30u8 {
        assert_eq!(store.free_list(w), &[1u32 << w], "width {}", w);
    }
    assert!(store.free_list(31).is_empty());
}

#[test]
fn test_fresh_header_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.store");
    Store::create(&path).unwrap().close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(&raw[0..4], &[0, 0, 0, 1]);
    assert_eq!(&raw[4..8], b"Bud1");
    // root offset 2048, size 1264, offset duplicated
    assert_eq!(&raw[8..12], &2048u32.to_be_bytes());
    assert_eq!(&raw[12..16], &1264u32.to_be_bytes());
    assert_eq!(&raw[16..20], &2048u32.to_be_bytes());
}

#[test]
fn test_open_rejects_bad_magic() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("garbage.store");
    std::fs::write(&path, b"definitely not a container file").unwrap();

    match Store::open(&path) {
        Err(Error::Format(msg)) => assert!(msg.contains("not a buddy container")),
        other => panic!("expected format error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_open_rejects_mismatched_root_addresses() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("split-brain.store");

    let mut raw = Vec::new();
    raw.extend_from_slice(&1u32.to_be_bytes());
    raw.extend_from_slice(b"Bud1");
    raw.extend_from_slice(&2048u32.to_be_bytes());
    raw.extend_from_slice(&1264u32.to_be_bytes());
    raw.extend_from_slice(&4096u32.to_be_bytes()); // disagrees
    raw.extend_from_slice(&[0u8; 16]);
    std::fs::write(&path, raw).unwrap();

    match Store::open(&path) {
        Err(Error::Format(msg)) => assert!(msg.contains("root addresses differ")),
        other => panic!("expected format error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_block_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.store");

    let block_num;
    {
        let mut store = Store::create(&path).unwrap();
        block_num = store.allocate(64, None).unwrap();
        let mut block = store.get_block(block_num).unwrap().unwrap();
        block.write(b"persistent payload").unwrap();
        store.write_block(&mut block).unwrap();
        store.close().unwrap();
    }
    {
        let mut store = Store::open(&path).unwrap();
        let addr = store.block_address(block_num).unwrap();
        assert_eq!(addr.width(), 6);
        let mut block = store.get_block(block_num).unwrap().unwrap();
        assert_eq!(block.read(18).unwrap(), b"persistent payload");
    }
}

#[test]
fn test_toc_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("toc.store");

    let b;
    {
        let mut store = Store::create(&path).unwrap();
        b = store.allocate(32, None).unwrap();
        store.toc_set("test", b);
        store.close().unwrap();
    }
    {
        let store = Store::open(&path).unwrap();
        assert_eq!(store.toc_get("test"), Some(b));
        assert!(store.toc_get("none").is_none());
    }
}

#[test]
fn test_free_lists_survive_release_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("free.store");

    {
        let mut store = Store::create(&path).unwrap();
        let a = store.allocate(32, None).unwrap();
        let _b = store.allocate(32, None).unwrap();
        store.release(a);
        store.close().unwrap();
    }
    {
        let store = Store::open(&path).unwrap();
        // Slot a freed its 32-byte range back to width 5.
        assert!(store.free_list(5).contains(&32));
        // Slot b (at 64, from the split of width 6) is still allocated.
        assert!(!store.free_list(5).contains(&64));
        assert!(store.free_list(6).is_empty());
    }
}

#[test]
fn test_open_or_create() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("either.store");

    {
        let mut store = Store::open_or_create(&path).unwrap();
        store.allocate(32, None).unwrap();
        store.close().unwrap();
    }
    {
        let store = Store::open_or_create(&path).unwrap();
        assert_eq!(store.block_count(), 2);
    }
}

#[test]
fn test_flush_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idem.store");

    let mut store = Store::create(&path).unwrap();
    store.allocate(32, None).unwrap();
    store.flush().unwrap();
    let after_first = std::fs::read(&path).unwrap();
    store.flush().unwrap();
    let after_second = std::fs::read(&path).unwrap();
    assert_eq!(after_first, after_second);
}
