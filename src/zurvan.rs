use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::Config;
use crate::errors::{Result, ZurvanError};
use crate::isolation::TransactionIsolation;
use crate::nvm::{AllocStats, NvPool};
use crate::object::ObjectDirectory;
use crate::qp::QpEngine;
use crate::recovery::{OpExecFn, RecoveryStats, recover};
use crate::thread::ThreadControl;
use crate::transaction::Transaction;

/// Zurvan prelude.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::isolation::*;
    pub use crate::object::ObjectHandle;
    pub use crate::recovery::*;
    pub use crate::transaction::*;
    pub use crate::zurvan::*;
}

/// The main entry point for the transactional storage engine.
///
/// Opening an engine maps (or creates) the pool file, recovers it if the
/// previous process died uncleanly, and starts the quiescence engine.
/// Application threads register through `register_thread` and run
/// transactions through the returned handle. `shutdown` drains every log
/// and marks the pool clean; dropping the engine without calling it leaves
/// the pool dirty, and the next open recovers from the logs.
pub struct Zurvan {
    config: Config,
    pool: Arc<NvPool>,
    dir: Arc<ObjectDirectory>,
    clock: Arc<Clock>,
    qp: Arc<QpEngine>,
    op_exec: OpExecFn,
    qp_thread: Mutex<Option<JoinHandle<()>>>,
    recovery: Option<RecoveryStats>,
    shut_down: AtomicBool,
}

impl Zurvan {
    /// Opens the engine. `op_exec` is the application's operation
    /// interpreter; recovery replays logged operations through it, so it
    /// must implement every operation type the application commits.
    pub fn open(config: Config, op_exec: OpExecFn) -> Result<Arc<Zurvan>> {
        let config = config.validated()?;
        let (pool, need_recovery) = NvPool::open(&config)?;
        let clock = Arc::new(Clock::new());
        let dir = Arc::new(ObjectDirectory::new());
        let qp = QpEngine::new(
            Arc::clone(&clock),
            Arc::clone(&dir),
            Arc::clone(&pool),
            config.qp_interval,
        );

        let recovery = if need_recovery {
            Some(recover(&pool, &config, &clock, &dir, &qp, &op_exec)?)
        } else {
            clock.restore(pool.persisted_clock());
            None
        };

        let qp_runner = Arc::clone(&qp);
        let qp_thread = std::thread::Builder::new()
            .name("zurvan-qp".into())
            .spawn(move || qp_runner.run())?;
        info!(
            "engine open: pool {} ({} MiB), generation {}",
            config.pool_path.display(),
            config.pool_size >> 20,
            pool.gen_id()
        );
        Ok(Arc::new(Zurvan {
            config,
            pool,
            dir,
            clock,
            qp,
            op_exec,
            qp_thread: Mutex::new(Some(qp_thread)),
            recovery,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Registers the calling thread and returns its transaction handle.
    pub fn register_thread(self: &Arc<Self>) -> Result<ThreadHandle> {
        let tc = self.qp.register(&self.config, Arc::clone(&self.pool))?;
        Ok(ThreadHandle {
            engine: Arc::clone(self),
            tc,
        })
    }

    pub fn stats(&self) -> Arc<AllocStats> {
        self.pool.stats()
    }

    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery.as_ref()
    }

    /// Drains every registered slot, persists the clock, and marks the
    /// pool clean so the next open skips recovery. All thread handles must
    /// be dropped first.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_qp_thread();
        // Zombie slots may still hold log entries; with the engine thread
        // stopped and no live threads left, drain them inline.
        let drained = self.qp.drain_for_shutdown();
        match drained {
            Ok(true) => {}
            Ok(false) => {
                self.shut_down.store(false, Ordering::Release);
                return Err(ZurvanError::Other(
                    "shutdown left thread slots undrained".into(),
                ));
            }
            Err(e) => {
                self.shut_down.store(false, Ordering::Release);
                return Err(e);
            }
        }
        self.pool.set_persisted_clock(self.clock.now());
        self.pool.mark_clean();
        info!("engine shut down cleanly at clk {}", self.clock.now());
        Ok(())
    }

    fn stop_qp_thread(&self) {
        self.qp.request_stop();
        if let Some(handle) = self.qp_thread.lock().take()
            && handle.join().is_err()
        {
            warn!("quiescence engine thread panicked");
        }
    }
}

impl Drop for Zurvan {
    fn drop(&mut self) {
        // No mark_clean here: dropping without `shutdown` models a crash
        // and the next open must recover.
        self.stop_qp_thread();
        if !self.shut_down.load(Ordering::Acquire) {
            debug!("engine dropped without shutdown; pool left dirty");
        }
    }
}

/// A registered thread's gateway to transactions. Dropping it retires the
/// slot; the quiescence engine drains whatever its logs still hold.
pub struct ThreadHandle {
    engine: Arc<Zurvan>,
    tc: Arc<ThreadControl>,
}

impl ThreadHandle {
    /// Starts a transaction, first servicing any outstanding reclaim
    /// request and applying write-path backpressure.
    pub fn transaction(&self, isolation: TransactionIsolation) -> Result<Transaction<'_>> {
        self.tc
            .service_reclaim(&self.engine.qp.window(), &self.engine.dir)?;
        self.tc
            .reclaim_below_high_watermark(&self.engine.dir, || self.engine.qp.window())?;
        Ok(Transaction::new(
            &self.engine.pool,
            &self.engine.dir,
            &self.engine.clock,
            &self.tc,
            isolation,
        ))
    }

    /// Runs `body` in a transaction, retrying on conflict until it
    /// commits. Returns the commit clock (`None` for read-only bodies).
    pub fn run<T>(
        &self,
        isolation: TransactionIsolation,
        mut body: impl FnMut(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<(T, Option<u64>)> {
        loop {
            let mut txn = self.transaction(isolation)?;
            let value = match body(&mut txn) {
                Ok(value) => value,
                Err(ZurvanError::TransactionConflict) => {
                    txn.abort();
                    std::hint::spin_loop();
                    continue;
                }
                Err(e) => {
                    txn.abort();
                    return Err(e);
                }
            };
            match txn.commit() {
                Ok(clk) => return Ok((value, clk)),
                Err(ZurvanError::TransactionConflict) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Commits one logical operation through the engine's operation
    /// interpreter, retrying on conflict. This is the durable write path:
    /// the operation is logged as given here and replayed through the same
    /// interpreter after a crash.
    pub fn apply(
        &self,
        isolation: TransactionIsolation,
        op_type: u64,
        operand: &[u8],
    ) -> Result<Option<u64>> {
        let op_exec = Arc::clone(&self.engine.op_exec);
        let (_, clk) = self.run(isolation, |txn| {
            txn.set_op(op_type, operand);
            op_exec(txn, op_type, operand)
        })?;
        Ok(clk)
    }

    /// Runs a checkpoint-level reclamation round on this thread's logs
    /// eagerly instead of waiting for the quiescence engine to request it.
    pub fn flush(&self) -> Result<()> {
        self.tc.request_reclaim(crate::thread::RECLAIM_CKPT);
        self.tc
            .service_reclaim(&self.engine.qp.window(), &self.engine.dir)
    }

    pub fn thread_id(&self) -> u32 {
        self.tc.thread_id
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        self.engine.qp.unregister(&self.tc);
    }
}
