use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use crate::clock::{MAX_VERSION, lt_clock};
use crate::sync::VersionCell;

/// Opaque, stable identifier of an allocated object: its payload offset in
/// the pool. Survives restarts, which is what lets the operation log refer
/// to objects across a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectHandle(pub(crate) u64);

impl ObjectHandle {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Self {
        ObjectHandle(raw)
    }
}

/// Kind tag on a staged copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyKind {
    /// A new value for the object.
    Copy = 0,
    /// A tombstone: the transaction freed the object.
    Free = 1,
}

/// Reclamation progress of a staged copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyStatus {
    None = 0,
    /// Tombstone already emitted to the checkpoint log.
    TombstoneMarked = 1,
    /// Checkpointed and unhooked from the version chain.
    Detached = 2,
}

/// Groups every copy staged by one transaction. `pending_wrt_clk` is set
/// when commit begins; `wrt_clk` is the linearization point, published
/// after the operation log append is durable.
#[derive(Debug)]
pub struct WriteSet {
    pending_wrt_clk: AtomicU64,
    wrt_clk: AtomicU64,
    pub(crate) entries: Mutex<Vec<Arc<CopyEntry>>>,
    /// TVLog tail counter at transaction start; abort rewinds to it.
    pub(crate) start_tail_cnt: u64,
    pub(crate) thread_id: u32,
}

impl WriteSet {
    pub fn new(start_tail_cnt: u64, thread_id: u32) -> Self {
        Self {
            pending_wrt_clk: AtomicU64::new(MAX_VERSION),
            wrt_clk: AtomicU64::new(MAX_VERSION),
            entries: Mutex::new(Vec::new()),
            start_tail_cnt,
            thread_id,
        }
    }

    #[inline]
    pub fn pending_wrt_clk(&self) -> u64 {
        self.pending_wrt_clk.load(Ordering::Acquire)
    }

    #[inline]
    pub fn wrt_clk(&self) -> u64 {
        self.wrt_clk.load(Ordering::Acquire)
    }

    pub fn set_pending(&self, clk: u64) {
        self.pending_wrt_clk.store(clk, Ordering::Release)
    }

    /// Publishes the commit clock. Everything the transaction wrote is
    /// visible to readers with a newer local clock from this store on.
    pub fn publish(&self, clk: u64) {
        debug_assert_eq!(self.pending_wrt_clk(), clk);
        self.wrt_clk.store(clk, Ordering::Release)
    }

    pub fn num_entries(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A staged version of one object: the transient-version-log record linked
/// into the object's version chain at commit.
#[derive(Debug)]
pub struct CopyEntry {
    pub vhdr: Arc<VolatileHeader>,
    pub ws: Arc<WriteSet>,
    /// Next-older version. Nulled by reclamation once no reader can need
    /// anything below this entry.
    pub prev: VersionCell<CopyEntry>,
    /// Commit clock, cached here after publish; `MAX_VERSION` while the
    /// write set is uncommitted.
    wrt_clk: AtomicU64,
    /// Commit clock of the next-newer version; bounds this entry's
    /// validity window from above. `MAX_VERSION` while newest.
    pub wrt_clk_next: AtomicU64,
    /// Commit clock of the version this copy was taken from.
    pub wrt_clk_prev: u64,
    kind: AtomicU8,
    status: AtomicU8,
    pub payload: Mutex<Vec<u8>>,
}

impl CopyEntry {
    pub fn new(
        vhdr: Arc<VolatileHeader>,
        ws: Arc<WriteSet>,
        prev: Option<Arc<CopyEntry>>,
        wrt_clk_prev: u64,
        payload: Vec<u8>,
    ) -> Arc<Self> {
        Arc::new(Self {
            vhdr,
            ws,
            prev: VersionCell::new(prev),
            wrt_clk: AtomicU64::new(MAX_VERSION),
            wrt_clk_next: AtomicU64::new(MAX_VERSION),
            wrt_clk_prev,
            kind: AtomicU8::new(CopyKind::Copy as u8),
            status: AtomicU8::new(CopyStatus::None as u8),
            payload: Mutex::new(payload),
        })
    }

    pub fn status(&self) -> CopyStatus {
        match self.status.load(Ordering::Acquire) {
            1 => CopyStatus::TombstoneMarked,
            2 => CopyStatus::Detached,
            _ => CopyStatus::None,
        }
    }

    pub fn set_status(&self, status: CopyStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn kind(&self) -> CopyKind {
        match self.kind.load(Ordering::Acquire) {
            1 => CopyKind::Free,
            _ => CopyKind::Copy,
        }
    }

    pub fn mark_free(&self) {
        self.kind.store(CopyKind::Free as u8, Ordering::Release);
    }

    /// Raw committed clock; `MAX_VERSION` until cached after publish.
    #[inline]
    pub fn raw_wrt_clk(&self) -> u64 {
        self.wrt_clk.load(Ordering::Acquire)
    }

    pub fn cache_wrt_clk(&self, clk: u64) {
        self.wrt_clk.store(clk, Ordering::Release);
    }

    /// The identity token used for the volatile header's lock word.
    #[inline]
    pub fn token(self: &Arc<Self>) -> u64 {
        Arc::as_ptr(self) as usize as u64
    }

    /// Resolves this copy's write clock as seen by a reader at
    /// `local_clk`. A copy whose commit is concurrently in flight blocks
    /// the reader only if the reader's snapshot must observe it; this is
    /// the single blocking point on the read path.
    pub fn wrt_clk(&self, local_clk: u64) -> u64 {
        let clk = self.raw_wrt_clk();
        if clk != MAX_VERSION {
            return clk;
        }
        let pending = self.ws.pending_wrt_clk();
        if pending == MAX_VERSION {
            // Commit has not started; invisible to everyone.
            return MAX_VERSION;
        }
        if lt_clock(local_clk, pending) {
            return MAX_VERSION;
        }
        // Commit in flight and our snapshot would cover it: wait for the
        // write clock to resolve.
        loop {
            let clk = self.ws.wrt_clk();
            if clk != MAX_VERSION {
                debug_assert_eq!(self.ws.pending_wrt_clk(), clk);
                return clk;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

/// DRAM-only per-object header, created lazily on first write. Holds the
/// version chain, the writer lock token, and the current master location.
#[derive(Debug)]
pub struct VolatileHeader {
    pub handle: ObjectHandle,
    pub size: usize,
    /// Head of the version chain (newest first), or none if every version
    /// has been reclaimed into the master.
    pub chain: VersionCell<CopyEntry>,
    /// Identity token of the copy currently locking this object; zero when
    /// unlocked. At most one writer holds it at a time.
    lock: AtomicU64,
    /// Pool offset of the current master: the original object or, after a
    /// checkpoint, the checkpoint entry's payload.
    cur_actual: AtomicU64,
    /// Clock at which the object was freed; `MAX_VERSION` while live.
    tombstone_clk: AtomicU64,
}

impl VolatileHeader {
    pub fn new(handle: ObjectHandle, size: usize) -> Arc<Self> {
        Arc::new(Self {
            handle,
            size,
            chain: VersionCell::default(),
            lock: AtomicU64::new(0),
            cur_actual: AtomicU64::new(handle.0),
            tombstone_clk: AtomicU64::new(MAX_VERSION),
        })
    }

    /// CAS the lock word from free to `token`. Failure means another
    /// transaction holds the object.
    pub fn try_lock(&self, token: u64) -> bool {
        self.lock
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the lock word, but only if `token` still owns it.
    pub fn unlock(&self, token: u64) {
        let _ = self
            .lock
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn lock_token(&self) -> u64 {
        self.lock.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_token() != 0
    }

    pub fn cur_actual(&self) -> u64 {
        self.cur_actual.load(Ordering::Acquire)
    }

    pub fn set_cur_actual(&self, off: u64) {
        self.cur_actual.store(off, Ordering::Release);
    }

    pub fn tombstone_clk(&self) -> u64 {
        self.tombstone_clk.load(Ordering::Acquire)
    }

    pub fn set_tombstone_clk(&self, clk: u64) {
        self.tombstone_clk.store(clk, Ordering::Release);
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstone_clk() != MAX_VERSION
    }
}

/// Handle → volatile-header side table. Lock-free lookups on the read
/// path; racing first-writers insert through `get_or_insert` and the loser
/// simply drops its header.
pub struct ObjectDirectory {
    map: SkipMap<u64, Arc<VolatileHeader>>,
}

impl ObjectDirectory {
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<Arc<VolatileHeader>> {
        self.map.get(&handle.0).map(|e| Arc::clone(e.value()))
    }

    pub fn get_or_insert(&self, handle: ObjectHandle, size: usize) -> Arc<VolatileHeader> {
        let vhdr = VolatileHeader::new(handle, size);
        Arc::clone(self.map.get_or_insert(handle.0, vhdr).value())
    }

    pub fn remove(&self, handle: ObjectHandle) {
        self.map.remove(&handle.0);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for ObjectDirectory {
    fn default() -> Self {
        Self::new()
    }
}
