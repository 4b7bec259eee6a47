use std::sync::Arc;

use log::trace;

use crate::clock::{MAX_VERSION, gt_clock, lt_clock};
use crate::object::{CopyEntry, ObjectHandle, VolatileHeader};

/// Defines the isolation levels supported by the transactional engine.
///
/// Every level reads from a consistent snapshot pinned at transaction
/// begin; they differ in what is checked at commit. Stronger levels abort
/// more often under contention but never block readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionIsolation {
    /// **Snapshot:**
    ///
    /// The transaction sees the versions committed as of its begin clock
    /// and commits as long as its own write locks were acquired. Reads are
    /// never validated, so write skew between concurrent transactions is
    /// possible. This is the cheapest level: the read set is not even
    /// tracked.
    Snapshot,
    /// **Serializable:**
    ///
    /// Reads are tracked and re-validated at commit: if any object the
    /// transaction read has a version committed after the transaction's
    /// snapshot, the commit fails and the transaction is retried. The
    /// result is equivalent to some serial order of the committed
    /// transactions.
    Serializable,
    /// **Linearizable:**
    ///
    /// Serializable, plus the requirement that every read observed the
    /// newest committed version at the moment of the read. A transaction
    /// whose snapshot lagged behind a concurrent commit fails validation
    /// even if nothing changed afterwards, which places each committed
    /// transaction at a single point in real time.
    Linearizable,
}

/// What a read actually saw: the object and the committed version the
/// snapshot resolved to. `latest` is `None` when the read fell through the
/// chain to the checkpointed master.
pub struct ReadObservation {
    pub handle: ObjectHandle,
    pub vhdr: Arc<VolatileHeader>,
    pub latest: Option<Arc<CopyEntry>>,
}

/// Per-transaction read-set tracker. Snapshot isolation records nothing;
/// the stronger levels log each read and re-examine the set at commit.
pub struct IsolationTracker {
    isolation: TransactionIsolation,
    reads: Vec<ReadObservation>,
    /// Linearizable only: a read resolved to an older version while a
    /// newer one was already committed.
    stale_read: bool,
}

impl IsolationTracker {
    pub fn new(isolation: TransactionIsolation) -> Self {
        Self {
            isolation,
            reads: Vec::new(),
            stale_read: false,
        }
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    /// Records one read. `newest_committed_clk` is the commit clock of the
    /// chain head if it was committed at read time (`MAX_VERSION`
    /// otherwise), and `observed_clk` the clock of the version the read
    /// resolved to.
    pub fn add_read(
        &mut self,
        vhdr: &Arc<VolatileHeader>,
        latest: Option<&Arc<CopyEntry>>,
        newest_committed_clk: u64,
        observed_clk: u64,
    ) {
        match self.isolation {
            TransactionIsolation::Snapshot => {}
            TransactionIsolation::Serializable | TransactionIsolation::Linearizable => {
                if self.isolation == TransactionIsolation::Linearizable
                    && newest_committed_clk != MAX_VERSION
                    && lt_clock(observed_clk, newest_committed_clk)
                {
                    trace!(
                        "stale read on {:?}: saw {} behind {}",
                        vhdr.handle, observed_clk, newest_committed_clk
                    );
                    self.stale_read = true;
                }
                self.reads.push(ReadObservation {
                    handle: vhdr.handle,
                    vhdr: Arc::clone(vhdr),
                    latest: latest.cloned(),
                });
            }
        }
    }

    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    /// Commit-time validation: true when every read is still current.
    ///
    /// A read is invalidated when a version newer than the reader's
    /// snapshot has committed on the object since (a free counts). The
    /// chain head may legally change without invalidating anything,
    /// because reclamation collapses chains into the master, so the check
    /// is against commit clocks rather than head identity.
    pub fn validate(&self, local_clk: u64) -> bool {
        if self.isolation == TransactionIsolation::Snapshot {
            return true;
        }
        if self.stale_read {
            return false;
        }
        for read in &self.reads {
            if read.vhdr.is_tombstoned() {
                return false;
            }
            if let Some(head) = read.vhdr.chain.load() {
                // Skip an uncommitted head; it may be our own locked copy.
                let newest = if head.raw_wrt_clk() == MAX_VERSION {
                    head.prev.load()
                } else {
                    Some(head)
                };
                if let Some(newest) = newest {
                    let clk = newest.raw_wrt_clk();
                    if clk != MAX_VERSION && gt_clock(clk, local_clk) {
                        trace!(
                            "read of {:?} invalidated: {} committed after snapshot {}",
                            read.handle, clk, local_clk
                        );
                        return false;
                    }
                }
            }
        }
        true
    }

    pub fn reset(&mut self) {
        self.reads.clear();
        self.stale_read = false;
    }
}
