use std::sync::Arc;

use log::{debug, trace};

use crate::clock::{MAX_VERSION, lt_clock};
use crate::config::{CKPTLOG_HIGH_MARK_PCT, CKPTLOG_LOW_MARK_DEN, CKPTLOG_LOW_MARK_NUM};
use crate::errors::Result;
use crate::nvlog::NvLog;
use crate::nvm::{NvPool, SegmentInfo, SegmentKind};
use crate::object::{ObjectDirectory, ObjectHandle, VolatileHeader};
use crate::ptrset::PtrSet;

/// Checkpoint entry payload prefix: original handle, then a tombstone flag.
const CKPT_PREFIX: usize = 16;
const FLAG_TOMBSTONE: u64 = 1;

/// Reclaim aggressiveness for the checkpoint log, escalating only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CkptReclaim {
    /// Retire only the pre-aged region.
    BestEffort,
    /// Also write back masters older than the grace boundary.
    Writeback,
    /// Write back everything regardless of age (shutdown/zombie drain).
    WritebackAll,
}

/// A decoded checkpoint entry.
#[derive(Debug, Clone)]
pub struct CkptRecord {
    pub handle: ObjectHandle,
    pub wrt_clk: u64,
    pub tombstone: bool,
    /// Pool offset of the checkpointed object bytes.
    pub master_off: u64,
    pub payload: Vec<u8>,
}

/// Per-thread durable log of checkpointed object copies and tombstones.
///
/// A checkpointed copy becomes the object's current master (`cur_actual`
/// points into the log) until writeback undoes the indirection. Entries
/// retire in two stages: the region `[head, prev_head)` already survived a
/// grace period since losing master status and is unconditionally freeable;
/// newer entries are first written back, then age one grace period.
pub struct CkptLog {
    log: NvLog,
    pool: Arc<NvPool>,
    high_mark: u64,
    low_mark: u64,
    /// Grace clock under which `[head, prev_head)` was written back. The
    /// region only retires under a strictly newer grace clock, once readers
    /// that loaded master offsets during the writeback round have drained.
    prev_head_clk: u64,
    /// Objects whose tombstoned originals await freeing; gated by the
    /// engine-wide minimum reclaimed-checkpoint clock.
    deferred_frees: PtrSet<Arc<VolatileHeader>>,
}

impl CkptLog {
    pub fn create(pool: Arc<NvPool>, owner: u32, size: u64) -> Result<CkptLog> {
        let log = NvLog::create(Arc::clone(&pool), SegmentKind::CkptLog, owner, size)?;
        Ok(Self::with_log(pool, log))
    }

    pub fn from_segment(pool: Arc<NvPool>, info: &SegmentInfo) -> CkptLog {
        let log = NvLog::from_segment(Arc::clone(&pool), info);
        Self::with_log(pool, log)
    }

    fn with_log(pool: Arc<NvPool>, log: NvLog) -> CkptLog {
        let size = log.size();
        CkptLog {
            log,
            pool,
            high_mark: size * CKPTLOG_HIGH_MARK_PCT as u64 / 100,
            low_mark: size * CKPTLOG_LOW_MARK_NUM / CKPTLOG_LOW_MARK_DEN,
            prev_head_clk: 0,
            deferred_frees: PtrSet::new(),
        }
    }

    pub fn used(&self) -> u64 {
        self.log.used()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty() && self.deferred_frees.is_empty()
    }

    pub fn above_high_mark(&self) -> bool {
        self.used() >= self.high_mark
    }

    pub fn above_low_mark(&self) -> bool {
        self.used() >= self.low_mark
    }

    /// Durably checkpoints one object copy and redirects the object's
    /// master to the checkpointed bytes. Returns the new master offset.
    pub fn enqueue(&mut self, vhdr: &VolatileHeader, wrt_clk: u64, bytes: &[u8]) -> Result<u64> {
        let mut payload = Vec::with_capacity(CKPT_PREFIX + bytes.len());
        payload.extend_from_slice(&vhdr.handle.raw().to_le_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes());
        payload.extend_from_slice(bytes);
        let cnt = self.log.enqueue(wrt_clk, &payload)?;
        let master_off = self.log.payload_off(cnt) + CKPT_PREFIX as u64;
        vhdr.set_cur_actual(master_off);
        trace!(
            "ckptlog[{}]: checkpointed {} at clk {} -> master {}",
            self.log.slot(),
            vhdr.handle.raw(),
            wrt_clk,
            master_off
        );
        Ok(master_off)
    }

    /// Durably records that the object was freed at `wrt_clk`. The
    /// original allocation is only released by `cleanup` once the
    /// tombstone has aged past every thread's reclaim boundary.
    pub fn enqueue_tombstone(&mut self, vhdr: &VolatileHeader, wrt_clk: u64) -> Result<()> {
        let mut payload = Vec::with_capacity(CKPT_PREFIX);
        payload.extend_from_slice(&vhdr.handle.raw().to_le_bytes());
        payload.extend_from_slice(&FLAG_TOMBSTONE.to_le_bytes());
        self.log.enqueue(wrt_clk, &payload)?;
        Ok(())
    }

    pub fn enqueue_persist(&mut self) {
        self.log.enqueue_persist();
    }

    /// Two-stage reclamation. `qp0_clk` is the current grace clock; the
    /// retire region only opens once it is newer than the clock its
    /// writeback ran under. Returns the clock of the oldest entry still
    /// queued afterwards, `MAX_VERSION` when none remain; the engine-wide
    /// minimum of these bounds which tombstoned originals may be freed.
    pub fn reclaim(
        &mut self,
        mode: CkptReclaim,
        qp0_clk: u64,
        qp2_clk: u64,
        dir: &ObjectDirectory,
    ) -> u64 {
        let old_head = self.log.head_cnt;
        let old_prev = self.log.prev_head_cnt;

        // Stage 1: [head, prev_head) lost master status a full grace period
        // before the current clock; nobody can still dereference into it.
        let retire_open =
            mode == CkptReclaim::WritebackAll || lt_clock(self.prev_head_clk, qp0_clk);
        while retire_open && self.log.head_cnt < self.log.prev_head_cnt {
            let Some(entry) = self.log.peek_head() else {
                break;
            };
            if entry.cnt >= self.log.prev_head_cnt {
                break;
            }
            let handle = decode_handle(&entry.payload);
            let tombstone = decode_tombstone(&entry.payload);
            if tombstone
                && let Some(vhdr) = dir.get(handle)
            {
                // The original object and its header go to the deferred
                // free set; other threads may still be mid-traversal
                // checking whether this is the latest checkpoint.
                self.deferred_frees.push(vhdr);
            }
            self.log.dequeue();
        }

        // Stage 2: write back masters so their entries can age. BestEffort
        // skips this; Writeback honors the grace boundary; WritebackAll
        // drains regardless of age.
        let mut aged_until = self.log.prev_head_cnt.max(self.log.head_cnt);
        if mode >= CkptReclaim::Writeback {
            for entry in self.log.entries() {
                if entry.cnt < aged_until {
                    continue;
                }
                if mode != CkptReclaim::WritebackAll && !lt_clock(entry.wrt_clk, qp2_clk) {
                    break;
                }
                let handle = decode_handle(&entry.payload);
                if !decode_tombstone(&entry.payload)
                    && let Some(vhdr) = dir.get(handle)
                {
                    let master_off = self.log.payload_off(entry.cnt) + CKPT_PREFIX as u64;
                    if vhdr.cur_actual() == master_off {
                        // Still the current master: restore the original
                        // location and drop the indirection.
                        let bytes = &entry.payload[CKPT_PREFIX..];
                        self.pool.write_bytes(handle.raw(), bytes);
                        self.pool.persist(handle.raw(), bytes.len());
                        vhdr.set_cur_actual(handle.raw());
                    }
                }
                aged_until = entry.cnt + entry.size as u64;
            }
        }
        self.log.prev_head_cnt = aged_until;
        if self.log.prev_head_cnt != old_prev {
            self.prev_head_clk = qp0_clk;
        }

        if self.log.head_cnt != old_head {
            self.log.dequeue_persist();
            debug!(
                "ckptlog[{}]: {} bytes reclaimed (h={}, ph={}, t={})",
                self.log.slot(),
                self.log.head_cnt - old_head,
                self.log.head_cnt,
                self.log.prev_head_cnt,
                self.log.tail_cnt
            );
        }

        match self.log.peek_head() {
            Some(entry) => entry.wrt_clk,
            None => MAX_VERSION,
        }
    }

    /// Frees originals of tombstoned objects whose tombstone clock has
    /// aged past `until_clk`. Called by the quiescence engine after the
    /// grace period following reclamation.
    pub fn cleanup(&mut self, until_clk: u64, dir: &ObjectDirectory) {
        let ripe = self
            .deferred_frees
            .drain_where(|vhdr| lt_clock(vhdr.tombstone_clk(), until_clk));
        for vhdr in ripe {
            trace!(
                "ckptlog[{}]: freeing tombstoned object {}",
                self.log.slot(),
                vhdr.handle.raw()
            );
            dir.remove(vhdr.handle);
            self.pool.free(vhdr.handle.raw());
        }
    }

    /// Blocks shutdown until the log is fully drained: write back
    /// everything, age it, retire it, release deferred frees.
    pub fn flush(&mut self, dir: &ObjectDirectory) {
        self.reclaim(CkptReclaim::WritebackAll, MAX_VERSION, MAX_VERSION, dir);
        self.reclaim(CkptReclaim::WritebackAll, MAX_VERSION, MAX_VERSION, dir);
        self.cleanup(MAX_VERSION, dir);
        debug_assert!(self.log.is_empty());
    }

    /// Decoded live entries, oldest first. Recovery's phase-one input.
    pub fn records(&self) -> Vec<CkptRecord> {
        self.log
            .entries()
            .iter()
            .map(|entry| CkptRecord {
                handle: decode_handle(&entry.payload),
                wrt_clk: entry.wrt_clk,
                tombstone: decode_tombstone(&entry.payload),
                master_off: self.log.payload_off(entry.cnt) + CKPT_PREFIX as u64,
                payload: entry.payload[CKPT_PREFIX..].to_vec(),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.log.reset();
    }

    pub fn destroy(self) {
        self.log.destroy();
    }
}

fn decode_handle(payload: &[u8]) -> ObjectHandle {
    ObjectHandle::from_raw(u64::from_le_bytes(
        payload[0..8].try_into().unwrap_or([0; 8]),
    ))
}

fn decode_tombstone(payload: &[u8]) -> bool {
    u64::from_le_bytes(payload[8..16].try_into().unwrap_or([0; 8])) & FLAG_TOMBSTONE != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open_pool() -> (tempfile::TempDir, Arc<NvPool>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("pool"))
            .with_pool_size(64 << 20)
            .validated()
            .unwrap();
        let (pool, _) = NvPool::open(&config).unwrap();
        (dir, pool)
    }

    #[test]
    fn checkpoint_redirects_and_writeback_restores() {
        let (_dir, pool) = open_pool();
        let dir = ObjectDirectory::new();
        let mut ckptlog = CkptLog::create(Arc::clone(&pool), 0, 1 << 16).unwrap();

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        pool.write_bytes(handle.raw(), &1u64.to_le_bytes());
        let vhdr = dir.get_or_insert(handle, 8);

        let master = ckptlog
            .enqueue(&vhdr, 10, &2u64.to_le_bytes())
            .unwrap();
        ckptlog.enqueue_persist();
        assert_eq!(vhdr.cur_actual(), master);
        assert_eq!(pool.read_bytes(master, 8), 2u64.to_le_bytes());

        // Writeback restores the original location and drops indirection.
        let boundary = ckptlog.reclaim(CkptReclaim::Writeback, 20, 20, &dir);
        assert_eq!(boundary, 10);
        assert_eq!(vhdr.cur_actual(), handle.raw());
        assert_eq!(pool.read_bytes(handle.raw(), 8), 2u64.to_le_bytes());

        // Written-back entries retire only under a newer grace clock; a
        // reader from the writeback round may still hold the master offset.
        assert!(!ckptlog.is_empty());
        let boundary = ckptlog.reclaim(CkptReclaim::BestEffort, 20, 20, &dir);
        assert_eq!(boundary, 10);
        assert!(!ckptlog.is_empty());
        let boundary = ckptlog.reclaim(CkptReclaim::BestEffort, 30, 30, &dir);
        assert_eq!(boundary, MAX_VERSION);
        assert!(ckptlog.is_empty());
    }

    #[test]
    fn tombstone_frees_after_cleanup() {
        let (_dir, pool) = open_pool();
        let dir = ObjectDirectory::new();
        let mut ckptlog = CkptLog::create(Arc::clone(&pool), 0, 1 << 16).unwrap();
        let stats = pool.stats();

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        let vhdr = dir.get_or_insert(handle, 8);
        vhdr.set_tombstone_clk(15);
        ckptlog.enqueue_tombstone(&vhdr, 15).unwrap();
        ckptlog.enqueue_persist();
        let live_before = stats.live_objects();

        // Age the tombstone entry through both stages.
        ckptlog.reclaim(CkptReclaim::Writeback, 20, 20, &dir);
        ckptlog.reclaim(CkptReclaim::Writeback, 25, 25, &dir);

        // Too-early cleanup must not free.
        ckptlog.cleanup(10, &dir);
        assert_eq!(stats.live_objects(), live_before);

        ckptlog.cleanup(30, &dir);
        assert_eq!(stats.live_objects(), live_before - 1);
        assert!(dir.get(handle).is_none());
    }
}
