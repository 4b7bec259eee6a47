use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::{debug, info, warn};

use crate::ckptlog::{CkptLog, CkptRecord};
use crate::clock::{Clock, gte_clock, lt_clock};
use crate::config::Config;
use crate::errors::{Result, ZurvanError};
use crate::isolation::TransactionIsolation;
use crate::nvm::{NvPool, SegmentKind};
use crate::object::ObjectDirectory;
use crate::oplog::{OpLog, OpRecord};
use crate::qp::QpEngine;
use crate::transaction::Transaction;

/// Application callback that applies one logical operation inside a
/// transaction. The live write path and recovery replay both go through
/// it, which is what makes replay equivalent to re-running the original
/// transactions.
pub type OpExecFn =
    Arc<dyn Fn(&mut Transaction<'_>, u64, &[u8]) -> Result<()> + Send + Sync>;

/// What recovery did; surfaced through the engine for observability.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    pub ckpt_objects: usize,
    pub tombstones: usize,
    pub replayed_ops: usize,
    pub restored_clock: u64,
}

/// Rebuilds a consistent state from the durable logs after an unclean
/// shutdown.
///
/// Phase one applies checkpoints: for every object with entries in any
/// checkpoint log, the one with the highest write clock wins and its bytes
/// are written back to the object's home location (tombstones free the
/// object instead). Phase two replays the operation logs: surviving
/// operations are re-executed in commit-clock order with their original
/// snapshot and commit clocks, so the rebuilt version history matches the
/// pre-crash one exactly. Runs strictly single-threaded, before any
/// application thread registers.
pub fn recover(
    pool: &Arc<NvPool>,
    config: &Config,
    clock: &Arc<Clock>,
    dir: &Arc<ObjectDirectory>,
    qp: &QpEngine,
    op_exec: &OpExecFn,
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let last_ckpt_clk = pool.last_ckpt_clk();
    info!(
        "recovering pool generation {} (last checkpoint clk {})",
        pool.gen_id(),
        last_ckpt_clk
    );

    // Collect every surviving record, then release the old segments; the
    // replay below logs into fresh ones.
    let mut ckpt_records: Vec<CkptRecord> = Vec::new();
    let mut op_records: Vec<OpRecord> = Vec::new();
    for info in pool.live_segments() {
        match info.kind {
            SegmentKind::OpLog => {
                let mut oplog = OpLog::from_segment(Arc::clone(pool), &info);
                op_records.extend(oplog.records());
                oplog.reset();
                oplog.destroy();
            }
            SegmentKind::CkptLog => {
                let mut ckptlog = CkptLog::from_segment(Arc::clone(pool), &info);
                ckpt_records.extend(ckptlog.records());
                ckptlog.reset();
                ckptlog.destroy();
            }
            SegmentKind::Free => {}
        }
    }

    let mut max_clk = last_ckpt_clk;

    // Phase one: newest checkpoint per object wins. Entries at or past the
    // last durable checkpoint clock belong to a round that never closed;
    // the operation log still covers them, so replay rebuilds their state.
    let mut winners: HashMap<u64, CkptRecord> = HashMap::new();
    for record in ckpt_records {
        if !lt_clock(record.wrt_clk, last_ckpt_clk) {
            continue;
        }
        max_clk = max_clk.max(record.wrt_clk);
        match winners.get(&record.handle.raw()) {
            Some(cur) if gte_clock(cur.wrt_clk, record.wrt_clk) => {}
            _ => {
                winners.insert(record.handle.raw(), record);
            }
        }
    }
    for (_, record) in winners {
        if !pool.object_is_live(record.handle.raw()) {
            continue;
        }
        if record.tombstone {
            pool.free(record.handle.raw());
            stats.tombstones += 1;
        } else {
            pool.write_bytes(record.handle.raw(), &record.payload);
            pool.persist(record.handle.raw(), record.payload.len());
            stats.ckpt_objects += 1;
        }
    }
    debug!(
        "checkpoint recovery: {} objects written back, {} freed",
        stats.ckpt_objects, stats.tombstones
    );

    // Phase two: replay surviving operations in commit order. Operations
    // below the last checkpoint clock are skipped; their effects are
    // already durable from phase one.
    op_records.retain(|r| gte_clock(r.wrt_clk, last_ckpt_clk));
    op_records.sort_by_key(|r| r.wrt_clk);

    let tc = qp.register(config, Arc::clone(pool))?;
    for record in &op_records {
        max_clk = max_clk.max(record.wrt_clk);
        // Pin the original snapshot, run the operation, then force the
        // commit clock back to the original write clock.
        clock.restore(record.local_clk);
        let mut txn = Transaction::new(pool, dir, clock, &tc, TransactionIsolation::Snapshot);
        txn.set_op(record.op_type, &record.operand);
        if let Err(e) = op_exec(&mut txn, record.op_type, &record.operand) {
            warn!(
                "replay of op {} at clk {} failed: {e}",
                record.op_type, record.wrt_clk
            );
            return Err(ZurvanError::Recovery(format!(
                "operation at clk {} failed to replay: {e}",
                record.wrt_clk
            )));
        }
        clock.restore(record.wrt_clk - 1);
        let committed = txn.commit()?;
        if let Some(clk) = committed
            && clk != record.wrt_clk
        {
            return Err(ZurvanError::Recovery(format!(
                "replay commit clk {clk} diverged from logged clk {}",
                record.wrt_clk
            )));
        }
        stats.replayed_ops += 1;
    }
    clock.restore(max_clk);
    stats.restored_clock = max_clk;

    // Fold the replayed state back into the masters and retire the
    // recovery slot; the engine starts from a clean, checkpointed pool.
    tc.flush_logs(dir)?;
    qp.unregister(&tc);
    pool.set_last_ckpt_clk(max_clk);
    pool.set_persisted_clock(max_clk);

    info!(
        "recovery complete: {} ops replayed, clock restored to {max_clk}",
        stats.replayed_ops
    );
    Ok(stats)
}
