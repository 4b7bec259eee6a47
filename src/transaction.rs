use std::sync::Arc;

use log::trace;
use parking_lot::{MappedMutexGuard, MutexGuard};

use crate::clock::{Clock, MAX_VERSION, gt_clock, lte_clock};
use crate::errors::{Result, ZurvanError};
use crate::isolation::{IsolationTracker, TransactionIsolation};
use crate::nvm::NvPool;
use crate::object::{CopyEntry, ObjectDirectory, ObjectHandle, VolatileHeader};
use crate::thread::ThreadControl;
use crate::tvlog::OpInfo;

/// A committed value as observed by one read: the bytes and the commit
/// clock they were written at (zero for a value read straight from the
/// checkpointed master).
pub struct VersionedView {
    bytes: Vec<u8>,
    wrt_clk: u64,
}

impl VersionedView {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn wrt_clk(&self) -> u64 {
        self.wrt_clk
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Write access to an object's staged copy. The copy is private to the
/// transaction until commit publishes it, so mutation needs no further
/// synchronization beyond the payload mutex the accessor maps.
pub struct MutableView {
    copy: Arc<CopyEntry>,
}

impl MutableView {
    pub fn handle(&self) -> ObjectHandle {
        self.copy.vhdr.handle
    }

    pub fn len(&self) -> usize {
        self.copy.payload.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_mut(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.copy.payload.lock(), |v| v.as_mut_slice())
    }

    pub fn write_at(&self, off: usize, bytes: &[u8]) {
        let mut payload = self.copy.payload.lock();
        payload[off..off + bytes.len()].copy_from_slice(bytes);
    }
}

/// One optimistic transaction. Reads resolve against the snapshot pinned
/// at begin; writes stage copies in the owning thread's transient log
/// behind per-object locks. `commit` publishes everything atomically at a
/// single clock; dropping an unfinished transaction rolls it back.
pub struct Transaction<'a> {
    pool: &'a Arc<NvPool>,
    dir: &'a ObjectDirectory,
    clock: &'a Clock,
    tc: &'a ThreadControl,
    local_clk: u64,
    tracker: IsolationTracker,
    op: Option<OpInfo>,
    /// Objects allocated by this transaction; returned to the pool on
    /// abort.
    allocations: Vec<ObjectHandle>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        pool: &'a Arc<NvPool>,
        dir: &'a ObjectDirectory,
        clock: &'a Clock,
        tc: &'a ThreadControl,
        isolation: TransactionIsolation,
    ) -> Transaction<'a> {
        let local_clk = tc.begin(clock);
        trace!("txn begin on thread {} at clk {local_clk}", tc.thread_id);
        Transaction {
            pool,
            dir,
            clock,
            tc,
            local_clk,
            tracker: IsolationTracker::new(isolation),
            op: None,
            allocations: Vec::new(),
            finished: false,
        }
    }

    pub fn local_clk(&self) -> u64 {
        self.local_clk
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.tracker.isolation()
    }

    /// Reads the version of `handle` visible to this transaction's
    /// snapshot: the newest committed copy with a clock at or below the
    /// snapshot clock, falling back to the checkpointed master when the
    /// whole chain is newer or already reclaimed.
    pub fn dereference(&mut self, handle: ObjectHandle) -> Result<VersionedView> {
        let vhdr = match self.dir.get(handle) {
            Some(vhdr) => vhdr,
            None => {
                // Never written since recovery: the master is the only
                // version. The read still has to go through the directory
                // so commit validation can see it.
                if !self.pool.object_is_live(handle.raw()) {
                    return Err(ZurvanError::InvalidHandle(handle.raw()));
                }
                let size = self.pool.object_size(handle.raw());
                self.dir.get_or_insert(handle, size)
            }
        };
        if vhdr.is_tombstoned() {
            return Err(ZurvanError::InvalidHandle(handle.raw()));
        }

        let head = vhdr.chain.load();
        let mut newest_committed = MAX_VERSION;
        let mut cur = head.clone();
        while let Some(copy) = cur {
            let clk = copy.wrt_clk(self.local_clk);
            if clk != MAX_VERSION && newest_committed == MAX_VERSION {
                newest_committed = clk;
            }
            if lte_clock(clk, self.local_clk) {
                let bytes = copy.payload.lock().clone();
                self.tracker
                    .add_read(&vhdr, Some(&copy), newest_committed, clk);
                return Ok(VersionedView { bytes, wrt_clk: clk });
            }
            cur = copy.prev.load();
        }

        // Chain exhausted: everything the snapshot can see lives at the
        // current master (original location or checkpoint entry).
        let bytes = self.pool.read_bytes(vhdr.cur_actual(), vhdr.size);
        self.tracker.add_read(&vhdr, head.as_ref(), newest_committed, 0);
        Ok(VersionedView { bytes, wrt_clk: 0 })
    }

    /// Locks `handle` for writing and stages a private copy of its
    /// current value. Fails with `TransactionConflict` when another
    /// transaction holds the object or when this snapshot does not cover
    /// the newest committed version (admitting it would let an older
    /// snapshot overwrite a newer value).
    pub fn try_lock(&mut self, handle: ObjectHandle) -> Result<MutableView> {
        let vhdr = match self.dir.get(handle) {
            Some(vhdr) => vhdr,
            None => {
                if !self.pool.object_is_live(handle.raw()) {
                    return Err(ZurvanError::InvalidHandle(handle.raw()));
                }
                let size = self.pool.object_size(handle.raw());
                self.dir.get_or_insert(handle, size)
            }
        };
        if vhdr.is_tombstoned() {
            return Err(ZurvanError::InvalidHandle(handle.raw()));
        }
        let copy = self.lock_and_stage(&vhdr, None)?;
        Ok(MutableView { copy })
    }

    fn lock_and_stage(
        &mut self,
        vhdr: &Arc<VolatileHeader>,
        fresh_payload: Option<Vec<u8>>,
    ) -> Result<Arc<CopyEntry>> {
        let mut logs = self.tc.logs.lock();

        // A repeated write to the same object reuses its staged copy.
        if let Some(own) = logs.tvlog.find_own_copy(vhdr) {
            return Ok(own);
        }

        let head = vhdr.chain.load();
        let (payload, wrt_clk_prev) = match fresh_payload {
            Some(payload) => (payload, 0),
            None => match &head {
                Some(copy) => {
                    let clk = copy.wrt_clk(self.local_clk);
                    if gt_clock(clk, self.local_clk) {
                        // The newest version is uncommitted or ahead of
                        // our snapshot.
                        return Err(ZurvanError::TransactionConflict);
                    }
                    (copy.payload.lock().clone(), clk)
                }
                None => (self.pool.read_bytes(vhdr.cur_actual(), vhdr.size), 0),
            },
        };

        let copy =
            logs.tvlog
                .append_begin(Arc::clone(vhdr), head.clone(), wrt_clk_prev, payload)?;
        if !vhdr.try_lock(copy.token()) {
            logs.tvlog.append_abort();
            return Err(ZurvanError::TransactionConflict);
        }
        // The head may have moved between the snapshot copy and the lock:
        // a commit slipped in (conflict) or reclamation collapsed the
        // chain into the master (same value, fine).
        let head_now = vhdr.chain.load();
        let unchanged = match (&head, &head_now) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (Some(_), None) => true,
            (None, Some(_)) => false,
        };
        if !unchanged {
            vhdr.unlock(copy.token());
            logs.tvlog.append_abort();
            return Err(ZurvanError::TransactionConflict);
        }
        logs.tvlog.append_end();
        Ok(copy)
    }

    /// Allocates a zero-initialized object of `size` bytes and stages it
    /// for writing. The allocation is undone if the transaction aborts.
    pub fn allocate(&mut self, size: usize) -> Result<MutableView> {
        let raw = self.pool.alloc(size)?;
        let handle = ObjectHandle::from_raw(raw);
        let vhdr = self.dir.get_or_insert(handle, size);
        match self.lock_and_stage(&vhdr, Some(vec![0u8; size])) {
            Ok(copy) => {
                self.allocations.push(handle);
                trace!("allocated {} bytes at {}", size, raw);
                Ok(MutableView { copy })
            }
            Err(e) => {
                self.dir.remove(handle);
                self.pool.free(raw);
                Err(e)
            }
        }
    }

    /// Marks `handle` freed. The object stays readable to older snapshots
    /// until reclamation tombstones it; the allocation itself is released
    /// only after every thread has retired its checkpoints past the
    /// tombstone clock.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<()> {
        let vhdr = match self.dir.get(handle) {
            Some(vhdr) => vhdr,
            None => {
                if !self.pool.object_is_live(handle.raw()) {
                    return Err(ZurvanError::InvalidHandle(handle.raw()));
                }
                let size = self.pool.object_size(handle.raw());
                self.dir.get_or_insert(handle, size)
            }
        };
        if vhdr.is_tombstoned() {
            return Err(ZurvanError::InvalidHandle(handle.raw()));
        }
        let copy = self.lock_and_stage(&vhdr, None)?;
        copy.mark_free();
        Ok(())
    }

    /// Attaches the logical operation that describes this transaction for
    /// recovery replay. Mandatory for any transaction that writes.
    pub fn set_op(&mut self, op_type: u64, operand: &[u8]) {
        self.op = Some(OpInfo {
            op_type,
            operand: operand.to_vec(),
        });
    }

    /// Appends bytes to the current operation's operand buffer, starting
    /// an empty operation if none is set.
    pub fn append_operand(&mut self, bytes: &[u8]) {
        match &mut self.op {
            Some(op) => op.operand.extend_from_slice(bytes),
            None => {
                self.op = Some(OpInfo {
                    op_type: 0,
                    operand: bytes.to_vec(),
                })
            }
        }
    }

    /// Validates the read set, then publishes every staged write at one
    /// commit clock. Returns the commit clock, or `None` for a read-only
    /// transaction. On any failure the transaction is fully rolled back.
    pub fn commit(mut self) -> Result<Option<u64>> {
        if !self.tracker.validate(self.local_clk) {
            self.rollback();
            return Err(ZurvanError::TransactionConflict);
        }
        let result = {
            let mut logs = self.tc.logs.lock();
            let (tvlog, oplog) = logs.split_tv_op();
            tvlog.commit(oplog, self.clock, self.local_clk, self.op.as_ref())
        };
        match result {
            Ok(clk) => {
                self.finished = true;
                self.tc.end();
                trace!("txn on thread {} committed at {:?}", self.tc.thread_id, clk);
                Ok(clk)
            }
            Err(e) => {
                // The log already unlocked and rewound; undo allocations.
                self.undo_allocations();
                self.finished = true;
                self.tc.end();
                Err(e)
            }
        }
    }

    /// Explicit abort; equivalent to dropping the transaction.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.tc.logs.lock().tvlog.abort();
        self.undo_allocations();
        self.finished = true;
        self.tc.end();
        trace!("txn on thread {} aborted", self.tc.thread_id);
    }

    fn undo_allocations(&mut self) {
        for handle in self.allocations.drain(..) {
            self.dir.remove(handle);
            self.pool.free(handle.raw());
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::thread::ThreadControl;

    struct Harness {
        _dir: tempfile::TempDir,
        config: Config,
        pool: Arc<NvPool>,
        objects: ObjectDirectory,
        clock: Clock,
        tc: Arc<ThreadControl>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().join("pool"))
            .with_pool_size(64 << 20)
            .validated()
            .unwrap();
        let (pool, _) = NvPool::open(&config).unwrap();
        let tc = ThreadControl::new(0, &config, Arc::clone(&pool)).unwrap();
        Harness {
            _dir: dir,
            config,
            pool,
            objects: ObjectDirectory::new(),
            clock: Clock::new(),
            tc,
        }
    }

    impl Harness {
        fn txn(&self, isolation: TransactionIsolation) -> Transaction<'_> {
            Transaction::new(&self.pool, &self.objects, &self.clock, &self.tc, isolation)
        }

        fn second_thread(&self) -> Arc<ThreadControl> {
            ThreadControl::new(1, &self.config, Arc::clone(&self.pool)).unwrap()
        }

        fn txn_on<'a>(
            &'a self,
            tc: &'a ThreadControl,
            isolation: TransactionIsolation,
        ) -> Transaction<'a> {
            Transaction::new(&self.pool, &self.objects, &self.clock, tc, isolation)
        }
    }

    #[test]
    fn allocate_write_commit_read() {
        let h = harness();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        let view = txn.allocate(8).unwrap();
        let handle = view.handle();
        view.bytes_mut().copy_from_slice(&7u64.to_le_bytes());
        txn.set_op(1, &handle.raw().to_le_bytes());
        let clk = txn.commit().unwrap().unwrap();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        let read = txn.dereference(handle).unwrap();
        assert_eq!(read.as_slice(), 7u64.to_le_bytes());
        assert_eq!(read.wrt_clk(), clk);
        txn.commit().unwrap();
    }

    #[test]
    fn abort_undoes_allocation_and_staging() {
        let h = harness();
        let live_before = h.pool.stats().live_objects();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        let view = txn.allocate(8).unwrap();
        let handle = view.handle();
        txn.abort();

        assert_eq!(h.pool.stats().live_objects(), live_before);
        let mut txn = h.txn(TransactionIsolation::Snapshot);
        assert!(matches!(
            txn.dereference(handle),
            Err(ZurvanError::InvalidHandle(_))
        ));
    }

    #[test]
    fn writer_conflict_on_locked_object() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let handle = setup.allocate(8).unwrap().handle();
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        let mut writer = h.txn(TransactionIsolation::Snapshot);
        let _held = writer.try_lock(handle).unwrap();

        let tc2 = h.second_thread();
        let mut rival = h.txn_on(&tc2, TransactionIsolation::Snapshot);
        assert!(matches!(
            rival.try_lock(handle),
            Err(ZurvanError::TransactionConflict)
        ));
        rival.abort();
        writer.abort();
    }

    #[test]
    fn relock_same_object_reuses_copy() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let handle = setup.allocate(8).unwrap().handle();
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        let a = txn.try_lock(handle).unwrap();
        a.bytes_mut().copy_from_slice(&3u64.to_le_bytes());
        let b = txn.try_lock(handle).unwrap();
        assert_eq!(&b.bytes_mut()[..], 3u64.to_le_bytes());
        txn.set_op(1, &[]);
        txn.commit().unwrap();
    }

    #[test]
    fn snapshot_reader_sees_pinned_version() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let view = setup.allocate(8).unwrap();
        let handle = view.handle();
        view.bytes_mut().copy_from_slice(&1u64.to_le_bytes());
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        // Reader pins its snapshot before the second write commits.
        let mut reader = h.txn(TransactionIsolation::Snapshot);
        let first = reader.dereference(handle).unwrap();
        assert_eq!(first.as_slice(), 1u64.to_le_bytes());

        let tc2 = h.second_thread();
        let mut writer = h.txn_on(&tc2, TransactionIsolation::Snapshot);
        let view = writer.try_lock(handle).unwrap();
        view.bytes_mut().copy_from_slice(&2u64.to_le_bytes());
        writer.set_op(1, &[]);
        writer.commit().unwrap();

        // Same snapshot, same answer.
        let again = reader.dereference(handle).unwrap();
        assert_eq!(again.as_slice(), 1u64.to_le_bytes());
        reader.commit().unwrap();

        let mut fresh = h.txn(TransactionIsolation::Snapshot);
        assert_eq!(
            fresh.dereference(handle).unwrap().as_slice(),
            2u64.to_le_bytes()
        );
        fresh.commit().unwrap();
    }

    #[test]
    fn serializable_commit_fails_on_invalidated_read() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let handle = setup.allocate(8).unwrap().handle();
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        let mut reader = h.txn(TransactionIsolation::Serializable);
        reader.dereference(handle).unwrap();

        let tc2 = h.second_thread();
        let mut writer = h.txn_on(&tc2, TransactionIsolation::Snapshot);
        writer.try_lock(handle).unwrap();
        writer.set_op(1, &[]);
        writer.commit().unwrap();

        // Read-only, but serializable validation still applies.
        assert!(matches!(
            reader.commit(),
            Err(ZurvanError::TransactionConflict)
        ));
    }

    #[test]
    fn stale_snapshot_writer_is_rejected() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let handle = setup.allocate(8).unwrap().handle();
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        // Pin a snapshot, then let a newer commit land.
        let mut stale = h.txn(TransactionIsolation::Snapshot);
        let tc2 = h.second_thread();
        let mut writer = h.txn_on(&tc2, TransactionIsolation::Snapshot);
        writer.try_lock(handle).unwrap();
        writer.set_op(1, &[]);
        writer.commit().unwrap();

        assert!(matches!(
            stale.try_lock(handle),
            Err(ZurvanError::TransactionConflict)
        ));
        stale.abort();
    }

    #[test]
    fn missing_op_rejects_writing_commit() {
        let h = harness();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        let view = txn.allocate(8).unwrap();
        view.bytes_mut().copy_from_slice(&9u64.to_le_bytes());
        assert!(matches!(txn.commit(), Err(ZurvanError::MissingOperation)));
    }

    #[test]
    fn pristine_master_read_is_validated() {
        let h = harness();

        // Only a pool master exists, no directory entry, as after a
        // restart whose recovery wrote the object back.
        let raw = h.pool.alloc(8).unwrap();
        h.pool.write_bytes(raw, &5u64.to_le_bytes());
        let handle = ObjectHandle::from_raw(raw);

        let mut reader = h.txn(TransactionIsolation::Serializable);
        assert_eq!(
            reader.dereference(handle).unwrap().as_slice(),
            5u64.to_le_bytes()
        );

        let tc2 = h.second_thread();
        let mut writer = h.txn_on(&tc2, TransactionIsolation::Snapshot);
        let view = writer.try_lock(handle).unwrap();
        view.bytes_mut().copy_from_slice(&6u64.to_le_bytes());
        writer.set_op(1, &[]);
        writer.commit().unwrap();

        // The master read was invalidated by the commit above.
        assert!(matches!(
            reader.commit(),
            Err(ZurvanError::TransactionConflict)
        ));
    }

    #[test]
    fn freed_object_stays_readable_until_reclaimed() {
        let h = harness();

        let mut setup = h.txn(TransactionIsolation::Snapshot);
        let handle = setup.allocate(8).unwrap().handle();
        setup.set_op(1, &[]);
        setup.commit().unwrap();

        let mut txn = h.txn(TransactionIsolation::Snapshot);
        txn.free(handle).unwrap();
        txn.set_op(2, &[]);
        txn.commit().unwrap();

        // The tombstone takes effect at reclamation, not at commit.
        let mut reader = h.txn(TransactionIsolation::Snapshot);
        assert!(reader.dereference(handle).is_ok());
        reader.commit().unwrap();
    }
}
