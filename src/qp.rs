use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::clock::{Clock, MAX_VERSION};
use crate::config::{Config, MAX_THREADS};
use crate::errors::{Result, ZurvanError};
use crate::nvm::NvPool;
use crate::object::ObjectDirectory;
use crate::thread::{
    GraceWindow, RECLAIM_BEST_EFFORT, RECLAIM_CKPT, RECLAIM_NONE, ThreadControl, ThreadLiveness,
};

/// Quiescence engine: detects grace periods, maintains the three-deep
/// clock window, raises reclaim requests, and helps or reaps threads that
/// stopped making progress.
///
/// A quiescent period has passed once every registered thread has either
/// closed its transaction window (`run_cnt` even) or moved on to a new one
/// (`run_cnt` changed). After that, no active snapshot predates the clock
/// sampled at detection start.
pub struct QpEngine {
    clock: Arc<Clock>,
    dir: Arc<ObjectDirectory>,
    pool: Arc<NvPool>,
    threads: Mutex<Vec<Arc<ThreadControl>>>,
    next_id: AtomicU32,
    qp0: AtomicU64,
    qp1: AtomicU64,
    qp2: AtomicU64,
    /// Clock of the last completed checkpoint barrier; mirrors the root
    /// block field.
    last_ckpt: AtomicU64,
    min_ckpt_reclaimed: AtomicU64,
    /// Completed detection rounds; `synchronize` waits on it.
    periods: AtomicU64,
    stop: AtomicBool,
    interval: Duration,
}

impl QpEngine {
    pub fn new(
        clock: Arc<Clock>,
        dir: Arc<ObjectDirectory>,
        pool: Arc<NvPool>,
        interval: Duration,
    ) -> Arc<QpEngine> {
        let last_ckpt = pool.last_ckpt_clk();
        Arc::new(QpEngine {
            clock,
            dir,
            pool,
            threads: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            qp0: AtomicU64::new(0),
            qp1: AtomicU64::new(0),
            qp2: AtomicU64::new(0),
            last_ckpt: AtomicU64::new(last_ckpt),
            min_ckpt_reclaimed: AtomicU64::new(0),
            periods: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            interval,
        })
    }

    /// Registers a new thread slot and its logs.
    pub fn register(&self, config: &Config, pool: Arc<NvPool>) -> Result<Arc<ThreadControl>> {
        let mut threads = self.threads.lock();
        let live = threads
            .iter()
            .filter(|t| t.liveness() == ThreadLiveness::Live)
            .count();
        if live >= MAX_THREADS {
            return Err(ZurvanError::Config(format!(
                "thread limit of {MAX_THREADS} reached"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let tc = ThreadControl::new(id, config, pool)?;
        threads.push(Arc::clone(&tc));
        Ok(tc)
    }

    /// Adopts a control block rebuilt by recovery.
    pub fn adopt(&self, tc: Arc<ThreadControl>) {
        let mut threads = self.threads.lock();
        self.next_id
            .fetch_max(tc.thread_id + 1, Ordering::AcqRel);
        threads.push(tc);
    }

    /// Unregisters a thread. Its logs usually still hold entries, so the
    /// slot lingers as a zombie until the engine drains and reaps it.
    pub fn unregister(&self, tc: &Arc<ThreadControl>) {
        debug_assert!(!tc.in_transaction());
        if tc.is_drained() {
            tc.set_liveness(ThreadLiveness::DeadZombie);
        } else {
            tc.set_liveness(ThreadLiveness::LiveZombie);
            tc.request_reclaim(RECLAIM_CKPT);
        }
        debug!("thread slot {} unregistered", tc.thread_id);
    }

    pub fn window(&self) -> GraceWindow {
        GraceWindow {
            qp0: self.qp0.load(Ordering::Acquire),
            qp2: self.qp2.load(Ordering::Acquire),
            last_ckpt: self.last_ckpt.load(Ordering::Acquire),
            min_ckpt_reclaimed: self.min_ckpt_reclaimed.load(Ordering::Acquire),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True while any slot, zombie or live, remains on the registry.
    pub fn has_threads(&self) -> bool {
        !self.threads.lock().is_empty()
    }

    /// Waits for one full grace period to elapse. Callable from any
    /// thread that is not inside a transaction window.
    pub fn synchronize(&self) {
        let start = self.periods.load(Ordering::Acquire);
        while self.periods.load(Ordering::Acquire) <= start {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            std::thread::yield_now();
        }
    }

    /// The engine thread body. Runs until `request_stop`.
    pub fn run(self: Arc<Self>) {
        debug!("quiescence engine started, interval {:?}", self.interval);
        while !self.stop.load(Ordering::Acquire) {
            std::thread::sleep(self.interval);
            self.one_period();
        }
        debug!("quiescence engine stopped");
    }

    /// One detection round plus the maintenance that follows it.
    pub fn one_period(&self) {
        let qp_clk = self.detect();
        self.qp2.store(self.qp1.load(Ordering::Acquire), Ordering::Release);
        self.qp1.store(self.qp0.load(Ordering::Acquire), Ordering::Release);
        self.qp0.store(qp_clk, Ordering::Release);
        self.periods.fetch_add(1, Ordering::AcqRel);
        trace!("grace period at clk {qp_clk}");

        self.refresh_min_ckpt_reclaimed();
        let level = self.round_level();
        if level == RECLAIM_NONE {
            self.reap_dead();
            return;
        }
        // Reclamation is lockstep: every thread takes part in the round,
        // so checkpoints of the same object retire in version order
        // across logs. Recovery's newest-record-wins writeback depends
        // on that order.
        self.broadcast_reclaim(level);
        self.reclaim_barrier();
        self.reap_dead();
        if level >= RECLAIM_CKPT {
            self.ckpt_barrier(qp_clk);
        }
    }

    /// The reclaim level this period warrants: the highest of any pending
    /// request and each thread's log watermarks. Zombies always rate a
    /// checkpoint round so they drain.
    fn round_level(&self) -> u8 {
        let mut level = RECLAIM_NONE;
        for tc in self.threads.lock().iter() {
            match tc.liveness() {
                ThreadLiveness::DeadZombie => continue,
                ThreadLiveness::LiveZombie => level = level.max(RECLAIM_CKPT),
                ThreadLiveness::Live => {}
            }
            level = level.max(tc.pending_reclaim());
            if let Some(logs) = tc.logs.try_lock() {
                if logs.tvlog.above_high_mark() || logs.ckptlog.above_high_mark() {
                    level = level.max(RECLAIM_CKPT);
                } else if logs.tvlog.above_low_mark()
                    || logs.ckptlog.above_low_mark()
                    || !logs.oplog.is_empty()
                {
                    level = level.max(RECLAIM_BEST_EFFORT);
                }
            }
            if level >= RECLAIM_CKPT {
                break;
            }
        }
        level
    }

    fn broadcast_reclaim(&self, level: u8) {
        for tc in self.threads.lock().iter() {
            if tc.liveness() != ThreadLiveness::DeadZombie {
                tc.request_reclaim(level);
            }
        }
    }

    /// Services the broadcast round on behalf of quiescent threads and
    /// waits until no request is left pending. Threads inside an open
    /// transaction service their own request at the next transaction
    /// start; the barrier waits them out.
    fn reclaim_barrier(&self) {
        let window = self.window();
        loop {
            let pending: Vec<Arc<ThreadControl>> = self
                .threads
                .lock()
                .iter()
                .filter(|t| {
                    t.liveness() != ThreadLiveness::DeadZombie
                        && t.pending_reclaim() != RECLAIM_NONE
                })
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            for tc in pending {
                if let Err(e) = tc.help_reclaim(&window, &self.dir) {
                    warn!("reclaim on behalf of thread {} failed: {e}", tc.thread_id);
                    return;
                }
            }
            std::thread::yield_now();
        }
        for tc in self.threads.lock().iter() {
            if tc.liveness() == ThreadLiveness::LiveZombie && tc.is_drained() {
                tc.set_liveness(ThreadLiveness::DeadZombie);
            }
        }
    }

    /// Waits until every thread has completed a checkpoint round covering
    /// `target`, then durably publishes the new last-checkpoint clock.
    /// Only after that may the covered operation log entries be reclaimed.
    fn ckpt_barrier(&self, target: u64) {
        loop {
            let window = self.window();
            let laggards: Vec<Arc<ThreadControl>> = self
                .threads
                .lock()
                .iter()
                .filter(|t| {
                    t.liveness() != ThreadLiveness::DeadZombie && t.last_ckpt_clk() < target
                })
                .cloned()
                .collect();
            if laggards.is_empty() {
                break;
            }
            if self.stop.load(Ordering::Acquire) {
                // Shutdown cancels the round; the next open recovers.
                return;
            }
            for tc in laggards {
                tc.request_reclaim(RECLAIM_CKPT);
                if let Err(e) = tc.help_reclaim(&window, &self.dir) {
                    warn!(
                        "checkpoint round on thread {} failed: {e}",
                        tc.thread_id
                    );
                    return;
                }
            }
            std::thread::yield_now();
        }
        self.pool.set_last_ckpt_clk(target);
        self.last_ckpt.fetch_max(target, Ordering::AcqRel);
        debug!("checkpoint barrier closed at clk {target}");
    }

    /// Waits until every live thread has passed through a quiescent state
    /// relative to the clock sampled at entry, then returns that clock.
    fn detect(&self) -> u64 {
        let qp_clk = self.clock.correct_qp(self.clock.now());
        let snapshot: Vec<(Arc<ThreadControl>, u64)> = self
            .threads
            .lock()
            .iter()
            .filter(|t| t.liveness() != ThreadLiveness::DeadZombie)
            .map(|t| (Arc::clone(t), t.run_cnt()))
            .collect();
        for (tc, start_cnt) in snapshot {
            if start_cnt & 1 == 0 {
                continue;
            }
            // In a transaction: wait for it to end or a new one to start.
            while tc.run_cnt() == start_cnt {
                if self.stop.load(Ordering::Acquire) {
                    break;
                }
                std::hint::spin_loop();
                std::thread::yield_now();
            }
        }
        qp_clk
    }

    fn refresh_min_ckpt_reclaimed(&self) {
        let threads = self.threads.lock();
        let min = threads
            .iter()
            .filter(|t| t.liveness() != ThreadLiveness::DeadZombie)
            .map(|t| t.ckpt_reclaimed_clk())
            .min()
            .unwrap_or(MAX_VERSION);
        self.min_ckpt_reclaimed.store(min, Ordering::Release);
    }

    /// Retires drained zombie slots, destroying their log segments.
    fn reap_dead(&self) {
        let mut threads = self.threads.lock();
        let mut dead = Vec::new();
        threads.retain(|tc| {
            if tc.liveness() == ThreadLiveness::DeadZombie {
                dead.push(Arc::clone(tc));
                false
            } else {
                true
            }
        });
        drop(threads);
        for tc in dead {
            let id = tc.thread_id;
            match Arc::try_unwrap(tc) {
                Ok(tc) => {
                    tc.retire();
                    debug!("thread slot {id} reaped");
                }
                // The owner still holds its handle; retire next period.
                Err(tc) => self.threads.lock().push(tc),
            }
        }
    }

    /// Force-drains every zombie slot during shutdown, after the engine
    /// thread has stopped. Called with no live thread registered, so the
    /// unbounded grace window used by `flush_logs` is safe. Returns true
    /// once the registry is empty.
    pub fn drain_for_shutdown(&self) -> Result<bool> {
        let snapshot: Vec<Arc<ThreadControl>> = self.threads.lock().iter().cloned().collect();
        for tc in &snapshot {
            match tc.liveness() {
                ThreadLiveness::Live => {
                    return Err(ZurvanError::Other(format!(
                        "thread {} still registered at shutdown",
                        tc.thread_id
                    )));
                }
                ThreadLiveness::LiveZombie => {
                    tc.flush_logs(&self.dir)?;
                    tc.set_liveness(ThreadLiveness::DeadZombie);
                }
                ThreadLiveness::DeadZombie => {}
            }
        }
        drop(snapshot);
        // The final flush covered everything up to the current clock.
        let now = self.clock.now();
        self.pool.set_last_ckpt_clk(now);
        self.last_ckpt.fetch_max(now, Ordering::AcqRel);
        self.reap_dead();
        Ok(!self.has_threads())
    }
}
