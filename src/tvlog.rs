use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::clock::{Clock, MAX_VERSION, gte_clock, lt_clock};
use crate::config::{CACHE_LINE, TVLOG_HIGH_MARK_PCT, TVLOG_LOW_MARK_PCT};
use crate::ckptlog::CkptLog;
use crate::errors::{Result, ZurvanError};
use crate::nvm::align_up;
use crate::object::{CopyEntry, CopyKind, CopyStatus, VolatileHeader, WriteSet};
use crate::oplog::OpLog;

/// Accounting size of a write-set marker record.
const WRT_SET_RECORD: u64 = CACHE_LINE as u64;
/// Accounting overhead of a copy record ahead of its payload bytes.
const COPY_RECORD_HDR: u64 = 2 * CACHE_LINE as u64;

/// A logical operation attached to a write transaction, durably logged at
/// commit for recovery replay.
#[derive(Debug, Clone)]
pub struct OpInfo {
    pub op_type: u64,
    pub operand: Vec<u8>,
}

/// Reclaim aggressiveness for the transient version log, escalating only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TvReclaim {
    /// Reclaim only copies provably unreachable without checkpointing.
    BestEffort,
    /// Also checkpoint borderline copies so the log can drain further.
    Ckpt,
}

/// What a reclamation round achieved; the caller escalates on stall.
#[derive(Debug, Default)]
pub struct TvReclaimOutcome {
    pub reclaimed_bytes: u64,
    pub ckpt_bytes: u64,
    /// Best effort made no progress while above the low mark: a
    /// checkpoint round is needed to drain further.
    pub needs_ckpt: bool,
}

#[derive(Debug)]
enum TvBody {
    WriteSet(Arc<WriteSet>),
    Copy(Arc<CopyEntry>),
    Bogus,
}

#[derive(Debug)]
struct TvRecord {
    cnt: u64,
    size: u64,
    body: TvBody,
}

struct PendingAppend {
    copy: Arc<CopyEntry>,
    entry_size: u64,
}

/// Per-thread DRAM staging ring for all writes: write-set markers followed
/// by the copies their transaction staged. Byte accounting mirrors a real
/// circular buffer (monotonic head/tail counters, cacheline-aligned record
/// sizes, padding at the wrap) so the watermark and backpressure behavior
/// match a fixed 1 MiB arena even though records are refcounted nodes.
pub struct TvLog {
    size: u64,
    high_mark: u64,
    low_mark: u64,
    pub head_cnt: u64,
    pub tail_cnt: u64,
    /// Boundary between the reclaim region and the checkpoint region;
    /// everything below it was checkpointed at least one grace period ago.
    pub prev_head_cnt: u64,
    records: VecDeque<TvRecord>,
    cur_ws: Option<Arc<WriteSet>>,
    pending: Option<PendingAppend>,
    thread_id: u32,
}

impl TvLog {
    pub fn new(size: u64, thread_id: u32) -> TvLog {
        debug_assert!(size.is_power_of_two());
        TvLog {
            size,
            high_mark: size * TVLOG_HIGH_MARK_PCT as u64 / 100,
            low_mark: size * TVLOG_LOW_MARK_PCT as u64 / 100,
            head_cnt: 0,
            tail_cnt: 0,
            prev_head_cnt: 0,
            records: VecDeque::new(),
            cur_ws: None,
            pending: None,
            thread_id,
        }
    }

    #[inline]
    pub fn used(&self) -> u64 {
        self.tail_cnt - self.head_cnt
    }

    pub fn is_empty(&self) -> bool {
        self.head_cnt == self.tail_cnt
    }

    pub fn above_high_mark(&self) -> bool {
        self.used() >= self.high_mark
    }

    pub fn above_low_mark(&self) -> bool {
        self.used() >= self.low_mark
    }

    pub fn in_transaction(&self) -> bool {
        self.cur_ws.is_some()
    }

    fn push_record(&mut self, size: u64, body: TvBody) {
        // No record spans the wrap boundary; pad the remainder.
        let to_end = self.size - (self.tail_cnt & (self.size - 1));
        if size > to_end {
            self.records.push_back(TvRecord {
                cnt: self.tail_cnt,
                size: to_end,
                body: TvBody::Bogus,
            });
            self.tail_cnt += to_end;
        }
        self.records.push_back(TvRecord {
            cnt: self.tail_cnt,
            size,
            body,
        });
        self.tail_cnt += size;
    }

    fn space_for(&self, size: u64) -> u64 {
        let to_end = self.size - (self.tail_cnt & (self.size - 1));
        if size > to_end { size + to_end } else { size }
    }

    /// Reserves a staged copy for `vhdr`, lazily opening a write set on
    /// the transaction's first write. The reservation becomes visible in
    /// the log only at `append_end`; dropping it via `append_abort` costs
    /// nothing because the tail has not moved for the copy yet.
    pub fn append_begin(
        &mut self,
        vhdr: Arc<VolatileHeader>,
        prev: Option<Arc<CopyEntry>>,
        wrt_clk_prev: u64,
        payload: Vec<u8>,
    ) -> Result<Arc<CopyEntry>> {
        debug_assert!(self.pending.is_none());
        let ws = match &self.cur_ws {
            Some(ws) => Arc::clone(ws),
            None => {
                if self.used() + self.space_for(WRT_SET_RECORD) > self.size {
                    return Err(self.overflow(WRT_SET_RECORD));
                }
                let ws = Arc::new(WriteSet::new(self.tail_cnt, self.thread_id));
                self.push_record(WRT_SET_RECORD, TvBody::WriteSet(Arc::clone(&ws)));
                self.cur_ws = Some(Arc::clone(&ws));
                ws
            }
        };
        let entry_size = align_up(COPY_RECORD_HDR + payload.len() as u64, CACHE_LINE as u64);
        if self.used() + self.space_for(entry_size) > self.size {
            return Err(self.overflow(entry_size));
        }
        let copy = CopyEntry::new(vhdr, ws, prev, wrt_clk_prev, payload);
        self.pending = Some(PendingAppend {
            copy: Arc::clone(&copy),
            entry_size,
        });
        Ok(copy)
    }

    /// Finalizes the reservation: the copy joins the log and its write set.
    pub fn append_end(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let ws = Arc::clone(&pending.copy.ws);
        ws.entries.lock().push(Arc::clone(&pending.copy));
        self.push_record(pending.entry_size, TvBody::Copy(pending.copy));
    }

    /// Drops the reservation after a failed lock attempt.
    pub fn append_abort(&mut self) {
        self.pending = None;
    }

    /// The copy this transaction already staged for `vhdr`, if any. Lets
    /// a repeated write to the same object reuse its staged copy.
    pub fn find_own_copy(&self, vhdr: &Arc<VolatileHeader>) -> Option<Arc<CopyEntry>> {
        let ws = self.cur_ws.as_ref()?;
        ws.entries
            .lock()
            .iter()
            .find(|c| Arc::ptr_eq(&c.vhdr, vhdr))
            .cloned()
    }

    fn overflow(&self, need: u64) -> ZurvanError {
        ZurvanError::LogCapacity(format!(
            "transient log full: need {need}, used {} of {}",
            self.used(),
            self.size
        ))
    }

    /// Commits the current write set:
    /// 1. links every staged copy into its object's version chain (CAS
    ///    with retry against concurrent reclamation),
    /// 2. takes a pending write clock and durably appends the logical
    ///    operation to the operation log,
    /// 3. publishes the write clock, which is the linearization point,
    /// 4. unlocks every object only after the clock is visible.
    ///
    /// Returns the commit clock, or `None` for a transaction that staged
    /// nothing.
    pub fn commit(
        &mut self,
        oplog: &mut OpLog,
        clock: &Clock,
        local_clk: u64,
        op: Option<&OpInfo>,
    ) -> Result<Option<u64>> {
        debug_assert!(self.pending.is_none());
        let Some(ws) = self.cur_ws.take() else {
            return Ok(None);
        };
        let entries: Vec<Arc<CopyEntry>> = ws.entries.lock().clone();
        if entries.is_empty() {
            // Nothing staged: retire the bare marker.
            self.rewind_to(ws.start_tail_cnt);
            return Ok(None);
        }
        let Some(op) = op else {
            self.unlock_all(&entries);
            self.rewind_to(ws.start_tail_cnt);
            return Err(ZurvanError::MissingOperation);
        };

        let wrt_clk = clock.new_clock(local_clk);
        ws.set_pending(wrt_clk);

        // Durable first: a failed append must leave nothing linked. The
        // reserved clock still has to pass through the visible counter.
        if let Err(e) = oplog.enqueue(local_clk, wrt_clk, op.op_type, &op.operand) {
            clock.advance_to(wrt_clk);
            self.unlock_all(&entries);
            self.rewind_to(ws.start_tail_cnt);
            return Err(e);
        }
        oplog.enqueue_persist();

        for copy in &entries {
            if copy.kind() == CopyKind::Free {
                // Tombstones never join the chain; the freed object keeps
                // serving its last committed value until reclaimed.
                continue;
            }
            loop {
                let old = copy.vhdr.chain.load();
                copy.prev.store(old.clone());
                if copy
                    .vhdr
                    .chain
                    .compare_and_set(old.as_ref(), Some(Arc::clone(copy)))
                    .is_ok()
                {
                    break;
                }
                // Concurrent reclamation moved the head under us; retry
                // with the fresh one.
            }
        }

        ws.publish(wrt_clk);
        clock.advance_to(wrt_clk);

        for copy in &entries {
            copy.cache_wrt_clk(wrt_clk);
            if let Some(prev) = copy.prev.load() {
                prev.wrt_clk_next
                    .store(wrt_clk, std::sync::atomic::Ordering::Release);
            }
            copy.vhdr.unlock(copy.token());
        }
        trace!(
            "tvlog[{}]: committed {} copies at clk {}",
            self.thread_id,
            entries.len(),
            wrt_clk
        );
        Ok(Some(wrt_clk))
    }

    /// Rolls the transaction back: unlock every staged object and rewind
    /// the tail to the transaction's start. The copies were never linked,
    /// so no reclamation is needed.
    pub fn abort(&mut self) {
        self.pending = None;
        let Some(ws) = self.cur_ws.take() else {
            return;
        };
        let entries: Vec<Arc<CopyEntry>> = ws.entries.lock().clone();
        self.unlock_all(&entries);
        self.rewind_to(ws.start_tail_cnt);
    }

    fn unlock_all(&self, entries: &[Arc<CopyEntry>]) {
        for copy in entries {
            copy.vhdr.unlock(copy.token());
        }
    }

    fn rewind_to(&mut self, start_tail_cnt: u64) {
        while let Some(record) = self.records.back() {
            if record.cnt < start_tail_cnt {
                break;
            }
            self.records.pop_back();
        }
        self.tail_cnt = start_tail_cnt;
    }

    /// Two-phase reclamation.
    ///
    /// Phase 1 retires whole committed write sets in `[head, prev_head)`:
    /// no reader can reach those copies anymore, because it would observe
    /// either a newer copy or the checkpointed master. Tombstones emit
    /// their checkpoint-log marker here, exactly once.
    ///
    /// Phase 2 walks the remaining committed write sets older than the
    /// checkpoint clock and checkpoints every copy sitting at the
    /// borderline (newest version below the checkpoint clock), then moves
    /// `prev_head` past them so the next round can retire them.
    pub fn reclaim(
        &mut self,
        mode: TvReclaim,
        qp0_clk: u64,
        last_ckpt_clk: u64,
        ckptlog: &mut CkptLog,
    ) -> Result<TvReclaimOutcome> {
        let mut outcome = TvReclaimOutcome::default();
        let old_head_cnt = self.head_cnt;
        let mut ckptlog_dirty = false;

        // ---- phase 1: reclaim [head, prev_head) ------------------------
        'phase1: loop {
            // Padding ahead of the boundary goes with the region.
            while let Some(record) = self.records.front() {
                if matches!(record.body, TvBody::Bogus) && record.cnt < self.prev_head_cnt {
                    self.head_cnt = record.cnt + record.size;
                    self.records.pop_front();
                } else {
                    break;
                }
            }
            let Some(front) = self.records.front() else {
                break;
            };
            if front.cnt >= self.prev_head_cnt {
                break;
            }
            let TvBody::WriteSet(ws) = &front.body else {
                debug_assert!(false, "write set marker expected at region head");
                break;
            };
            let ws = Arc::clone(ws);
            if ws.wrt_clk() == MAX_VERSION {
                break;
            }
            if mode == TvReclaim::BestEffort {
                let held = ws.entries.lock().iter().any(|c| {
                    // Superseded at or after the grace-period clock (or
                    // not superseded at all): a reader may still land on
                    // this copy.
                    c.kind() == CopyKind::Copy
                        && gte_clock(
                            c.wrt_clk_next.load(std::sync::atomic::Ordering::Acquire),
                            qp0_clk,
                        )
                });
                if held {
                    // Some copy may still be someone's visible version;
                    // the whole write set stays.
                    break 'phase1;
                }
            }

            // Retire the marker, then every member (padding included).
            if let Some(marker) = self.records.pop_front() {
                self.head_cnt = marker.cnt + marker.size;
            }
            let mut remaining = ws.num_entries();
            while remaining > 0 {
                let Some(record) = self.records.pop_front() else {
                    debug_assert!(false, "write set members must follow their marker");
                    break;
                };
                self.head_cnt = record.cnt + record.size;
                match record.body {
                    TvBody::Bogus => {}
                    TvBody::WriteSet(_) => {
                        debug_assert!(false, "nested write set marker");
                    }
                    TvBody::Copy(copy) => {
                        remaining -= 1;
                        match copy.kind() {
                            CopyKind::Copy => unlink_copy(&copy),
                            CopyKind::Free => {
                                if copy.status() != CopyStatus::TombstoneMarked {
                                    // Tombstone clock is the free's commit
                                    // clock; the deferred free waits until
                                    // every thread's checkpoints retire
                                    // past it.
                                    let vhdr = &copy.vhdr;
                                    vhdr.set_tombstone_clk(copy.raw_wrt_clk());
                                    vhdr.chain.store(None);
                                    ckptlog.enqueue_tombstone(vhdr, copy.raw_wrt_clk())?;
                                    copy.set_status(CopyStatus::TombstoneMarked);
                                    ckptlog_dirty = true;
                                }
                            }
                        }
                    }
                }
            }
        }
        outcome.reclaimed_bytes = self.head_cnt - old_head_cnt;

        // ---- phase 2: checkpoint [prev_head, ckpt clock) ---------------
        let mut new_prev_head = self.prev_head_cnt.max(self.head_cnt);
        let mut idx = self
            .records
            .iter()
            .position(|r| r.cnt >= new_prev_head)
            .unwrap_or(self.records.len());
        'phase2: while idx < self.records.len() {
            let group_start = self.records[idx].cnt;
            let ws = loop {
                match &self.records[idx].body {
                    TvBody::Bogus => {
                        idx += 1;
                        if idx >= self.records.len() {
                            new_prev_head = self.tail_cnt;
                            break 'phase2;
                        }
                    }
                    TvBody::WriteSet(ws) => break Arc::clone(ws),
                    TvBody::Copy(_) => {
                        debug_assert!(false, "copy record outside a write set group");
                        break 'phase2;
                    }
                }
            };
            let wrt_clk = ws.wrt_clk();
            if wrt_clk == MAX_VERSION || gte_clock(wrt_clk, qp0_clk) {
                new_prev_head = group_start;
                break;
            }
            idx += 1;
            let mut remaining = ws.num_entries();
            let mut group_end = self.records[idx - 1].cnt + self.records[idx - 1].size;
            while remaining > 0 && idx < self.records.len() {
                let record = &self.records[idx];
                group_end = record.cnt + record.size;
                if let TvBody::Copy(copy) = &record.body {
                    remaining -= 1;
                    if copy.kind() == CopyKind::Copy
                        && copy.status() == CopyStatus::None
                        && is_at_borderline(copy, qp0_clk, last_ckpt_clk)
                    {
                        if mode == TvReclaim::Ckpt {
                            let bytes = copy.payload.lock().clone();
                            ckptlog.enqueue(&copy.vhdr, copy.raw_wrt_clk(), &bytes)?;
                            detach_copy(copy);
                            copy.set_status(CopyStatus::Detached);
                            outcome.ckpt_bytes += bytes.len() as u64;
                            ckptlog_dirty = true;
                        } else {
                            // Best effort cannot checkpoint; stop at this
                            // write set so the whole group ages together.
                            new_prev_head = group_start;
                            break 'phase2;
                        }
                    }
                }
                idx += 1;
            }
            new_prev_head = group_end;
        }
        self.prev_head_cnt = new_prev_head.clamp(self.head_cnt, self.tail_cnt);

        if ckptlog_dirty {
            ckptlog.enqueue_persist();
        }

        // A stalled best-effort round above the low mark means only a
        // checkpoint can drain the log further.
        if mode == TvReclaim::BestEffort
            && outcome.reclaimed_bytes == 0
            && self.used() > self.low_mark
        {
            outcome.needs_ckpt = true;
        }
        if outcome.reclaimed_bytes != 0 || outcome.ckpt_bytes != 0 {
            debug!(
                "tvlog[{}] {:?}: {} bytes reclaimed, {} checkpointed (h={}, ph={}, t={})",
                self.thread_id,
                mode,
                outcome.reclaimed_bytes,
                outcome.ckpt_bytes,
                self.head_cnt,
                self.prev_head_cnt,
                self.tail_cnt
            );
        }
        Ok(outcome)
    }
}

/// Splices a fully superseded copy out of its version chain so its memory
/// can actually be returned. A concurrent commit may move the chain head;
/// retry from the top on a head race.
fn unlink_copy(copy: &Arc<CopyEntry>) {
    let vhdr = &copy.vhdr;
    loop {
        let Some(head) = vhdr.chain.load() else {
            copy.prev.store(None);
            return;
        };
        if Arc::ptr_eq(&head, copy) {
            let below = copy.prev.load();
            if vhdr.chain.compare_and_set(Some(copy), below).is_ok() {
                copy.prev.store(None);
                return;
            }
            continue;
        }
        // Walk down to the referer and splice.
        let mut cursor = head;
        loop {
            let Some(next) = cursor.prev.load() else {
                // Already unhooked by a detach higher up.
                copy.prev.store(None);
                return;
            };
            if Arc::ptr_eq(&next, copy) {
                cursor.prev.store(copy.prev.load());
                copy.prev.store(None);
                return;
            }
            cursor = next;
        }
    }
}

/// Truncates the chain at a just-checkpointed copy: when it is the head,
/// the whole chain collapses into the checkpointed master.
fn detach_copy(copy: &Arc<CopyEntry>) {
    let vhdr = &copy.vhdr;
    let _ = vhdr.chain.compare_and_set(Some(copy), None);
}

/// The borderline copy is the newest version strictly below the
/// checkpoint clock that has not been captured by a previous checkpoint;
/// exactly one thread's log holds it, so each object is checkpointed once.
fn is_at_borderline(copy: &CopyEntry, ckpt_s_clk: u64, last_ckpt_clk: u64) -> bool {
    let wrt_clk = copy.raw_wrt_clk();
    debug_assert_ne!(wrt_clk, MAX_VERSION);
    let superseded_at = copy.wrt_clk_next.load(std::sync::atomic::Ordering::Acquire);
    gte_clock(superseded_at, ckpt_s_clk)
        && lt_clock(wrt_clk, ckpt_s_clk)
        && gte_clock(wrt_clk, last_ckpt_clk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nvm::NvPool;
    use crate::object::{ObjectDirectory, ObjectHandle};

    fn harness() -> (tempfile::TempDir, Arc<NvPool>, OpLog, CkptLog, ObjectDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("pool"))
            .with_pool_size(64 << 20)
            .validated()
            .unwrap();
        let (pool, _) = NvPool::open(&config).unwrap();
        let oplog = OpLog::create(Arc::clone(&pool), 0, 1 << 16).unwrap();
        let ckptlog = CkptLog::create(Arc::clone(&pool), 0, 1 << 16).unwrap();
        (dir, pool, oplog, ckptlog, ObjectDirectory::new())
    }

    fn stage(
        tvlog: &mut TvLog,
        vhdr: &Arc<VolatileHeader>,
        payload: Vec<u8>,
    ) -> Arc<CopyEntry> {
        let prev = vhdr.chain.load();
        let wrt_clk_prev = prev.as_ref().map(|p| p.raw_wrt_clk()).unwrap_or(0);
        let copy = tvlog
            .append_begin(Arc::clone(vhdr), prev, wrt_clk_prev, payload)
            .unwrap();
        assert!(vhdr.try_lock(copy.token()));
        tvlog.append_end();
        copy
    }

    #[test]
    fn commit_publishes_and_unlocks() {
        let (_t, pool, mut oplog, _ckptlog, dir) = harness();
        let clock = Clock::new();
        let mut tvlog = TvLog::new(1 << 16, 0);

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        let vhdr = dir.get_or_insert(handle, 8);
        stage(&mut tvlog, &vhdr, vec![1; 8]);

        let op = OpInfo {
            op_type: 1,
            operand: vec![],
        };
        let local = clock.now();
        let clk = tvlog
            .commit(&mut oplog, &clock, local, Some(&op))
            .unwrap()
            .unwrap();
        assert!(!vhdr.is_locked());
        let head = vhdr.chain.load().unwrap();
        assert_eq!(head.raw_wrt_clk(), clk);
        assert!(!tvlog.in_transaction());
    }

    #[test]
    fn abort_rewinds_tail() {
        let (_t, pool, _oplog, _ckptlog, dir) = harness();
        let mut tvlog = TvLog::new(1 << 16, 0);

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        let vhdr = dir.get_or_insert(handle, 8);
        stage(&mut tvlog, &vhdr, vec![1; 8]);
        assert!(tvlog.used() > 0);

        tvlog.abort();
        assert!(!vhdr.is_locked());
        assert_eq!(tvlog.used(), 0);
        assert!(vhdr.chain.load().is_none());
    }

    #[test]
    fn missing_op_fails_commit() {
        let (_t, pool, mut oplog, _ckptlog, dir) = harness();
        let clock = Clock::new();
        let mut tvlog = TvLog::new(1 << 16, 0);

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        let vhdr = dir.get_or_insert(handle, 8);
        stage(&mut tvlog, &vhdr, vec![2; 8]);

        let result = tvlog.commit(&mut oplog, &clock, clock.now(), None);
        assert!(matches!(result, Err(ZurvanError::MissingOperation)));
        assert!(!vhdr.is_locked());
        assert_eq!(tvlog.used(), 0);
    }

    #[test]
    fn checkpoint_then_reclaim_drains_log() {
        let (_t, pool, mut oplog, mut ckptlog, dir) = harness();
        let clock = Clock::new();
        let mut tvlog = TvLog::new(1 << 16, 0);
        let op = OpInfo {
            op_type: 1,
            operand: vec![],
        };

        let handle = ObjectHandle::from_raw(pool.alloc(8).unwrap());
        let vhdr = dir.get_or_insert(handle, 8);

        // Two committed versions of the same object.
        stage(&mut tvlog, &vhdr, vec![1; 8]);
        let c1 = tvlog
            .commit(&mut oplog, &clock, clock.now(), Some(&op))
            .unwrap()
            .unwrap();
        stage(&mut tvlog, &vhdr, vec![2; 8]);
        let c2 = tvlog
            .commit(&mut oplog, &clock, clock.now(), Some(&op))
            .unwrap()
            .unwrap();
        assert!(c2 > c1);

        // Everything is older than the checkpoint clock: phase 2
        // checkpoints the newest (borderline) copy and detaches the chain.
        let qp0 = clock.now() + 1;
        let outcome = tvlog
            .reclaim(TvReclaim::Ckpt, qp0, 0, &mut ckptlog)
            .unwrap();
        assert!(outcome.ckpt_bytes > 0);
        assert!(vhdr.chain.load().is_none());
        assert_ne!(vhdr.cur_actual(), handle.raw());
        assert_eq!(pool.read_bytes(vhdr.cur_actual(), 8), vec![2; 8]);

        // The aged region retires on the next round.
        let outcome = tvlog
            .reclaim(TvReclaim::Ckpt, qp0, qp0, &mut ckptlog)
            .unwrap();
        assert!(outcome.reclaimed_bytes > 0);
        assert!(tvlog.is_empty());
    }
}
