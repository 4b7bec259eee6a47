use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use log::{debug, trace};
use parking_lot::Mutex;

use crate::ckptlog::{CkptLog, CkptReclaim};
use crate::clock::{Clock, MAX_VERSION};
use crate::config::Config;
use crate::errors::Result;
use crate::nvm::NvPool;
use crate::object::ObjectDirectory;
use crate::oplog::{OpLog, OpReclaim};
use crate::tvlog::{TvLog, TvReclaim};

/// Reclaim request levels, escalating only. The quiescence engine raises
/// them; the owning thread (or a helper) services and clears them.
pub const RECLAIM_NONE: u8 = 0;
pub const RECLAIM_BEST_EFFORT: u8 = 1;
pub const RECLAIM_CKPT: u8 = 2;

/// Lifecycle of a registered thread slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadLiveness {
    Live = 0,
    /// Unregistered, but its logs still hold unreclaimed entries. Kept on
    /// the registry so the quiescence engine can drain it.
    LiveZombie = 1,
    /// Fully drained; the next quiescent period reaps the slot.
    DeadZombie = 2,
}

/// The three logs owned by one thread. Guarded by a single mutex so the
/// quiescence engine can help a stalled thread with `try_lock` without
/// ever blocking the owner.
pub struct ThreadLogs {
    pub tvlog: TvLog,
    pub oplog: OpLog,
    pub ckptlog: CkptLog,
}

impl ThreadLogs {
    /// Borrows the transient and operation logs together; commit appends
    /// to both under one guard.
    pub fn split_tv_op(&mut self) -> (&mut TvLog, &mut OpLog) {
        (&mut self.tvlog, &mut self.oplog)
    }
}

/// Grace-period clocks distributed by the quiescence engine.
///
/// `qp0` is the most recent quiescent clock: every thread's snapshot has
/// advanced past it. `qp2` is two periods older and bounds checkpoint
/// writeback. `min_ckpt_reclaimed` is the engine-wide minimum clock below
/// which every thread has retired its checkpoints; it gates freeing
/// tombstoned originals.
#[derive(Debug, Clone, Copy)]
pub struct GraceWindow {
    pub qp0: u64,
    pub qp2: u64,
    /// Clock of the last checkpoint barrier, durably published in the
    /// pool's root block. Bounds both what the transient log must still
    /// checkpoint and which operation entries recovery would replay.
    pub last_ckpt: u64,
    pub min_ckpt_reclaimed: u64,
}

impl GraceWindow {
    /// A window that permits everything; shutdown and recovery paths.
    pub fn unbounded() -> GraceWindow {
        GraceWindow {
            qp0: MAX_VERSION,
            qp2: MAX_VERSION,
            last_ckpt: 0,
            min_ckpt_reclaimed: MAX_VERSION,
        }
    }
}

/// Per-thread control block, shared with the quiescence engine.
///
/// `run_cnt` is odd while a transaction is open; quiescence detection
/// samples it and waits for parity to flip or the count to move.
pub struct ThreadControl {
    pub thread_id: u32,
    run_cnt: CachePadded<AtomicU64>,
    local_clk: CachePadded<AtomicU64>,
    liveness: AtomicU8,
    reclaim_request: AtomicU8,
    /// Clock of the last transient-log checkpoint this thread completed.
    last_ckpt_clk: AtomicU64,
    /// Clock below which this thread's checkpoint entries are retired.
    ckpt_reclaimed_clk: AtomicU64,
    pub logs: Mutex<ThreadLogs>,
}

impl ThreadControl {
    pub fn new(thread_id: u32, config: &Config, pool: Arc<NvPool>) -> Result<Arc<ThreadControl>> {
        let tvlog = TvLog::new(config.tvlog_size as u64, thread_id);
        let oplog = OpLog::create(Arc::clone(&pool), thread_id, config.oplog_size as u64)?;
        let ckptlog = CkptLog::create(pool, thread_id, config.ckptlog_size as u64)?;
        debug!("thread slot {thread_id} registered");
        Ok(Arc::new(ThreadControl {
            thread_id,
            run_cnt: CachePadded::new(AtomicU64::new(0)),
            local_clk: CachePadded::new(AtomicU64::new(0)),
            liveness: AtomicU8::new(ThreadLiveness::Live as u8),
            reclaim_request: AtomicU8::new(RECLAIM_NONE),
            last_ckpt_clk: AtomicU64::new(0),
            ckpt_reclaimed_clk: AtomicU64::new(MAX_VERSION),
            logs: Mutex::new(ThreadLogs {
                tvlog,
                oplog,
                ckptlog,
            }),
        }))
    }

    /// Reattaches a control block to logs recovered from existing pool
    /// segments.
    pub fn from_logs(thread_id: u32, oplog: OpLog, ckptlog: CkptLog, tvlog_size: u64) -> Arc<ThreadControl> {
        Arc::new(ThreadControl {
            thread_id,
            run_cnt: CachePadded::new(AtomicU64::new(0)),
            local_clk: CachePadded::new(AtomicU64::new(0)),
            liveness: AtomicU8::new(ThreadLiveness::Live as u8),
            reclaim_request: AtomicU8::new(RECLAIM_NONE),
            last_ckpt_clk: AtomicU64::new(0),
            ckpt_reclaimed_clk: AtomicU64::new(MAX_VERSION),
            logs: Mutex::new(ThreadLogs {
                tvlog: TvLog::new(tvlog_size, thread_id),
                oplog,
                ckptlog,
            }),
        })
    }

    /// Opens a transaction window: flips `run_cnt` to odd and pins the
    /// snapshot clock. Returns the pinned clock.
    pub fn begin(&self, clock: &Clock) -> u64 {
        let cnt = self.run_cnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(cnt & 1 == 0, "transaction window already open");
        let clk = clock.now();
        self.local_clk.store(clk, Ordering::Release);
        clk
    }

    /// Closes the transaction window: flips `run_cnt` back to even.
    pub fn end(&self) {
        let cnt = self.run_cnt.fetch_add(1, Ordering::AcqRel);
        debug_assert!(cnt & 1 == 1, "no transaction window open");
    }

    #[inline]
    pub fn run_cnt(&self) -> u64 {
        self.run_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.run_cnt() & 1 == 1
    }

    #[inline]
    pub fn local_clk(&self) -> u64 {
        self.local_clk.load(Ordering::Acquire)
    }

    pub fn liveness(&self) -> ThreadLiveness {
        match self.liveness.load(Ordering::Acquire) {
            1 => ThreadLiveness::LiveZombie,
            2 => ThreadLiveness::DeadZombie,
            _ => ThreadLiveness::Live,
        }
    }

    pub fn set_liveness(&self, liveness: ThreadLiveness) {
        self.liveness.store(liveness as u8, Ordering::Release);
    }

    pub fn last_ckpt_clk(&self) -> u64 {
        self.last_ckpt_clk.load(Ordering::Acquire)
    }

    pub fn ckpt_reclaimed_clk(&self) -> u64 {
        self.ckpt_reclaimed_clk.load(Ordering::Acquire)
    }

    /// Raises a reclaim request, never lowering an existing one.
    pub fn request_reclaim(&self, level: u8) {
        self.reclaim_request.fetch_max(level, Ordering::AcqRel);
    }

    pub fn pending_reclaim(&self) -> u8 {
        self.reclaim_request.load(Ordering::Acquire)
    }

    /// Services an outstanding reclaim request on the owner's path.
    /// No-op when nothing is requested.
    pub fn service_reclaim(&self, window: &GraceWindow, dir: &ObjectDirectory) -> Result<()> {
        let level = self.reclaim_request.swap(RECLAIM_NONE, Ordering::AcqRel);
        if level == RECLAIM_NONE {
            return Ok(());
        }
        let mode = if level >= RECLAIM_CKPT {
            TvReclaim::Ckpt
        } else {
            TvReclaim::BestEffort
        };
        let mut logs = self.logs.lock();
        self.reclaim_logs(&mut logs, mode, window, dir)
    }

    /// The quiescence engine helping a thread that is not making progress.
    /// Never blocks: if the owner holds its log mutex, skip this round.
    pub fn help_reclaim(&self, window: &GraceWindow, dir: &ObjectDirectory) -> Result<()> {
        let level = self.pending_reclaim();
        if level == RECLAIM_NONE {
            return Ok(());
        }
        let Some(mut logs) = self.logs.try_lock() else {
            return Ok(());
        };
        // A transaction window may still be open even with the mutex free;
        // only help threads that are quiescent right now.
        if self.in_transaction() {
            return Ok(());
        }
        self.reclaim_request.store(RECLAIM_NONE, Ordering::Release);
        let mode = if level >= RECLAIM_CKPT {
            TvReclaim::Ckpt
        } else {
            TvReclaim::BestEffort
        };
        trace!("helping thread {} reclaim ({mode:?})", self.thread_id);
        self.reclaim_logs(&mut logs, mode, window, dir)
    }

    /// One full reclamation round over all three logs, in dependency
    /// order: the transient log feeds the checkpoint log, and checkpoint
    /// durability is what lets operation entries retire.
    pub fn reclaim_logs(
        &self,
        logs: &mut ThreadLogs,
        mode: TvReclaim,
        window: &GraceWindow,
        dir: &ObjectDirectory,
    ) -> Result<()> {
        let outcome =
            logs.tvlog
                .reclaim(mode, window.qp0, window.last_ckpt, &mut logs.ckptlog)?;
        if mode == TvReclaim::Ckpt {
            // Everything below the grace clock is now in the checkpoint
            // log; the engine publishes the durable barrier clock once
            // every thread reports in.
            self.last_ckpt_clk.fetch_max(window.qp0, Ordering::AcqRel);
        }
        if outcome.needs_ckpt {
            self.request_reclaim(RECLAIM_CKPT);
        }

        logs.oplog.reclaim(OpReclaim::Normal, window.last_ckpt);
        if logs.oplog.needs_checkpoint(window.last_ckpt) {
            self.request_reclaim(RECLAIM_CKPT);
        }

        let ckpt_mode = if logs.ckptlog.above_low_mark() {
            CkptReclaim::Writeback
        } else {
            CkptReclaim::BestEffort
        };
        // The boundary may move down again when fresh checkpoints land in
        // an emptied log; plain store, never fetch_max.
        let boundary = logs.ckptlog.reclaim(ckpt_mode, window.qp0, window.qp2, dir);
        self.ckpt_reclaimed_clk.store(boundary, Ordering::Release);
        logs.ckptlog.cleanup(window.min_ckpt_reclaimed, dir);
        Ok(())
    }

    /// Backpressure on the write path: called before opening a transaction
    /// window, spins reclamation until the transient log has room. The
    /// caller must not hold a transaction open. `window` is sampled anew
    /// every iteration; a stale grace clock would never release entries
    /// committed after it was taken.
    pub fn reclaim_below_high_watermark(
        &self,
        dir: &ObjectDirectory,
        mut window: impl FnMut() -> GraceWindow,
    ) -> Result<()> {
        debug_assert!(!self.in_transaction());
        loop {
            let current = window();
            {
                let mut logs = self.logs.lock();
                if !logs.tvlog.above_high_mark() {
                    return Ok(());
                }
                self.reclaim_logs(&mut logs, TvReclaim::Ckpt, &current, dir)?;
                if !logs.tvlog.above_high_mark() {
                    return Ok(());
                }
            }
            // Entries younger than the grace clock cannot be reclaimed
            // yet; keep a checkpoint round requested and yield until the
            // quiescence engine advances the window.
            self.request_reclaim(RECLAIM_CKPT);
            std::thread::yield_now();
        }
    }

    /// Drains every log completely. Shutdown and unregister path; the
    /// window is unbounded because no concurrent readers remain.
    pub fn flush_logs(&self, dir: &ObjectDirectory) -> Result<()> {
        let window = GraceWindow::unbounded();
        let mut logs = self.logs.lock();
        debug_assert!(!logs.tvlog.in_transaction());
        // Two rounds: the first checkpoints and detaches, the second
        // retires the then-aged region. A round that only moved prev_head
        // still made progress; stop only when neither counter moves.
        while !logs.tvlog.is_empty() {
            let before = (logs.tvlog.used(), logs.tvlog.prev_head_cnt);
            self.reclaim_logs(&mut logs, TvReclaim::Ckpt, &window, dir)?;
            if (logs.tvlog.used(), logs.tvlog.prev_head_cnt) == before {
                break;
            }
        }
        logs.oplog.reclaim(OpReclaim::Force, MAX_VERSION);
        logs.ckptlog.flush(dir);
        debug!("thread slot {} flushed", self.thread_id);
        Ok(())
    }

    /// Releases the slot's durable segments. Requires sole ownership, so
    /// only the reaper can call it, and only on a drained slot.
    pub fn retire(self) {
        let logs = self.logs.into_inner();
        debug_assert!(logs.tvlog.is_empty() && logs.oplog.is_empty() && logs.ckptlog.is_empty());
        logs.oplog.destroy();
        logs.ckptlog.destroy();
    }

    /// True once every log is empty and the slot can be reaped.
    pub fn is_drained(&self) -> bool {
        match self.logs.try_lock() {
            Some(logs) => {
                logs.tvlog.is_empty() && logs.oplog.is_empty() && logs.ckptlog.is_empty()
            }
            None => false,
        }
    }
}
