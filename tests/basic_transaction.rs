mod common;

use common::*;
use zurvan::{TransactionIsolation, ZurvanError};

#[test]
fn allocate_commit_and_read_back() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();

    let a = create_object(&th, 41);
    let b = create_object(&th, 1000);
    assert_eq!(read_value(&th, a), 41);
    assert_eq!(read_value(&th, b), 1000);

    th.apply(TransactionIsolation::Snapshot, OP_ADD, &operand(a, 1))
        .unwrap();
    assert_eq!(read_value(&th, a), 42);
    assert_eq!(read_value(&th, b), 1000);

    assert!(engine.stats().live_objects() >= 2);

    drop(th);
    engine.shutdown().unwrap();
}

#[test]
fn abort_leaves_prior_version_intact() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();

    let a = create_object(&th, 7);
    let mut txn = th.transaction(TransactionIsolation::Snapshot).unwrap();
    let view = txn.try_lock(a).unwrap();
    view.write_at(0, &99u64.to_le_bytes());
    txn.abort();

    assert_eq!(read_value(&th, a), 7);

    drop(th);
    engine.shutdown().unwrap();
}

#[test]
fn reader_pins_its_snapshot() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();
    let writer = engine.register_thread().unwrap();

    let a = create_object(&th, 1);

    let mut reader = th.transaction(TransactionIsolation::Snapshot).unwrap();
    let before = reader.dereference(a).unwrap();
    assert_eq!(u64::from_le_bytes(before.as_slice().try_into().unwrap()), 1);

    writer
        .apply(TransactionIsolation::Snapshot, OP_SET, &operand(a, 2))
        .unwrap();

    // The open reader still resolves to the version its snapshot pinned.
    let again = reader.dereference(a).unwrap();
    assert_eq!(u64::from_le_bytes(again.as_slice().try_into().unwrap()), 1);
    reader.abort();

    assert_eq!(read_value(&th, a), 2);

    drop(writer);
    drop(th);
    engine.shutdown().unwrap();
}

#[test]
fn commit_without_op_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();

    let a = create_object(&th, 5);
    let mut txn = th.transaction(TransactionIsolation::Snapshot).unwrap();
    let view = txn.try_lock(a).unwrap();
    view.write_at(0, &6u64.to_le_bytes());
    assert!(matches!(
        txn.commit(),
        Err(ZurvanError::MissingOperation)
    ));
    assert_eq!(read_value(&th, a), 5);

    drop(th);
    engine.shutdown().unwrap();
}

#[test]
fn stale_version_becomes_unreachable_and_memory_returns() {
    use std::time::{Duration, Instant};

    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();
    let writer = engine.register_thread().unwrap();
    let live_before = engine.stats().live_objects();

    let key = create_object(&th, 10);
    assert_eq!(engine.stats().live_objects(), live_before + 1);

    // Snapshot pinned between the two commits resolves to the first
    // value; a snapshot taken after the update resolves to the second.
    let mut between = th.transaction(TransactionIsolation::Snapshot).unwrap();
    let view = between.dereference(key).unwrap();
    assert_eq!(u64::from_le_bytes(view.as_slice().try_into().unwrap()), 10);

    writer
        .apply(TransactionIsolation::Snapshot, OP_SET, &operand(key, 20))
        .unwrap();

    let view = between.dereference(key).unwrap();
    assert_eq!(u64::from_le_bytes(view.as_slice().try_into().unwrap()), 10);
    between.abort();
    assert_eq!(read_value(&th, key), 20);

    // Free the object. Once every thread's checkpoints retire past the
    // tombstone, the allocation itself returns to the pool, visible
    // through the allocation accounting.
    th.apply(TransactionIsolation::Snapshot, OP_FREE, &operand(key, 0))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.stats().live_objects() != live_before {
        assert!(Instant::now() < deadline, "tombstoned object never freed");
        th.flush().unwrap();
        writer.flush().unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(matches!(
        try_read_value(&th, key),
        Err(ZurvanError::InvalidHandle(_))
    ));

    drop(writer);
    drop(th);
    engine.shutdown().unwrap();
}

#[test]
fn shutdown_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = open_engine(&tmp);
    let th = engine.register_thread().unwrap();
    let _ = create_object(&th, 3);
    drop(th);

    engine.shutdown().unwrap();
    engine.shutdown().unwrap();
}
