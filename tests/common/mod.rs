//! Shared fixtures: a small operation interpreter over u64-valued objects
//! and helpers to open engines against a temp pool file.

use std::sync::Arc;
use std::time::Duration;

use zurvan::{
    Config, ObjectHandle, OpExecFn, Result, ThreadHandle, TransactionIsolation, Zurvan,
    ZurvanError,
};

/// Overwrite an object with the 8-byte value in the operand.
pub const OP_SET: u64 = 1;
/// Add the 8-byte delta in the operand to the object's current value.
pub const OP_ADD: u64 = 2;
/// Free the object named by the operand.
pub const OP_FREE: u64 = 3;

fn operand_handle(operand: &[u8]) -> Result<ObjectHandle> {
    let raw = operand
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| ZurvanError::Other("short operand".into()))?;
    Ok(ObjectHandle::from_raw(raw))
}

/// The interpreter every test engine runs. It only mutates objects through
/// the transaction, so replaying the surviving operation log rebuilds the
/// same object values.
pub fn op_exec() -> OpExecFn {
    Arc::new(|txn, op_type, operand| {
        let handle = operand_handle(operand)?;
        match op_type {
            OP_SET => {
                let view = txn.try_lock(handle)?;
                view.write_at(0, &operand[8..]);
                Ok(())
            }
            OP_ADD => {
                let delta = operand
                    .get(8..16)
                    .and_then(|b| b.try_into().ok())
                    .map(u64::from_le_bytes)
                    .ok_or_else(|| ZurvanError::Other("short operand".into()))?;
                let view = txn.try_lock(handle)?;
                let cur = u64::from_le_bytes(view.bytes_mut()[..8].try_into().unwrap());
                view.write_at(0, &cur.wrapping_add(delta).to_le_bytes());
                Ok(())
            }
            // Delete-if-exists: replay may see the object already gone.
            OP_FREE => match txn.free(handle) {
                Err(ZurvanError::InvalidHandle(_)) => Ok(()),
                other => other,
            },
            other => Err(ZurvanError::Other(format!("unknown op type {other}"))),
        }
    })
}

pub fn operand(handle: ObjectHandle, value: u64) -> Vec<u8> {
    let mut bytes = handle.raw().to_le_bytes().to_vec();
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

pub fn open_engine(dir: &tempfile::TempDir) -> Arc<Zurvan> {
    let config = Config::new(dir.path().join("pool"))
        .with_pool_size(64 << 20)
        .with_qp_interval(Duration::from_millis(1));
    Zurvan::open(config, op_exec()).unwrap()
}

/// Engine with a deliberately tiny transient log, for exercising the
/// write-path watermark behavior.
pub fn open_engine_with_tvlog(dir: &tempfile::TempDir, tvlog_size: usize) -> Arc<Zurvan> {
    let config = Config::new(dir.path().join("pool"))
        .with_pool_size(64 << 20)
        .with_tvlog_size(tvlog_size)
        .with_qp_interval(Duration::from_millis(1));
    Zurvan::open(config, op_exec()).unwrap()
}

/// Allocates an 8-byte object holding `value` and logs the write as an
/// `OP_SET`, so the object's contents survive crash replay.
pub fn create_object(th: &ThreadHandle, value: u64) -> ObjectHandle {
    let (handle, clk) = th
        .run(TransactionIsolation::Snapshot, |txn| {
            let view = txn.allocate(8)?;
            let handle = view.handle();
            view.write_at(0, &value.to_le_bytes());
            txn.set_op(OP_SET, &operand(handle, value));
            Ok(handle)
        })
        .unwrap();
    assert!(clk.is_some());
    handle
}

pub fn read_value(th: &ThreadHandle, handle: ObjectHandle) -> u64 {
    try_read_value(th, handle).unwrap()
}

pub fn try_read_value(th: &ThreadHandle, handle: ObjectHandle) -> Result<u64> {
    let mut txn = th.transaction(TransactionIsolation::Snapshot)?;
    let view = txn.dereference(handle)?;
    let value = u64::from_le_bytes(view.as_slice()[..8].try_into().unwrap());
    txn.abort();
    Ok(value)
}
