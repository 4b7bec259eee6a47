use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "not committed yet". No real clock value ever reaches it.
pub const MAX_VERSION: u64 = u64::MAX;

/// Smallest clock value; predates every commit.
pub const MIN_VERSION: u64 = 0;

/// All version ordering must go through these comparisons rather than raw
/// integer operators, so the clock source can later be swapped for a
/// skew-corrected hardware timestamp without touching callers.
#[inline]
pub fn lt_clock(t1: u64, t2: u64) -> bool {
    t1 < t2
}

#[inline]
pub fn lte_clock(t1: u64, t2: u64) -> bool {
    t1 <= t2
}

#[inline]
pub fn gt_clock(t1: u64, t2: u64) -> bool {
    t1 > t2
}

#[inline]
pub fn gte_clock(t1: u64, t2: u64) -> bool {
    t1 >= t2
}

/// The engine-wide commit clock: a reservation counter handing each commit
/// a unique write clock, and a visible counter that snapshots pin.
///
/// The visible counter only catches up to a write clock via `advance_to`,
/// after that commit published. A snapshot therefore never pins a clock
/// whose commit is still unlinked; at worst it waits on a pending write
/// set that is already in the chain.
#[derive(Debug)]
pub struct Clock {
    wrt_clk: AtomicU64,
    reserve_clk: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wrt_clk: AtomicU64::new(MIN_VERSION),
            reserve_clk: AtomicU64::new(MIN_VERSION),
        }
    }

    /// Restores the clock after recovery so new commits stay above every
    /// replayed one.
    pub fn restore(&self, value: u64) {
        self.wrt_clk.store(value, Ordering::SeqCst);
        self.reserve_clk.store(value, Ordering::SeqCst);
    }

    /// Current clock with acquire semantics.
    #[inline]
    pub fn now(&self) -> u64 {
        self.wrt_clk.load(Ordering::Acquire)
    }

    /// Current clock without ordering; good enough for snapshot stamping.
    #[inline]
    pub fn now_relaxed(&self) -> u64 {
        self.wrt_clk.load(Ordering::Relaxed)
    }

    /// Reserves the clock a commit in flight will publish. Unique per
    /// call and strictly above every snapshot pinned so far.
    #[inline]
    pub fn new_clock(&self, local_clk: u64) -> u64 {
        let clk = self.reserve_clk.fetch_add(1, Ordering::SeqCst) + 1;
        debug_assert!(gt_clock(clk, local_clk));
        clk
    }

    /// Raises the visible clock to a reserved write clock, in reservation
    /// order: waits until every earlier reservation has advanced. A commit
    /// calls this after publishing; a failed commit calls it too, so its
    /// abandoned reservation does not wedge the clock.
    #[inline]
    pub fn advance_to(&self, clk: u64) {
        while self
            .wrt_clk
            .compare_exchange_weak(clk - 1, clk, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Correction term applied to quiescence-period clocks. The simple
    /// counter source needs none.
    #[inline]
    pub fn correct_qp(&self, qp_clk: u64) -> u64 {
        qp_clk
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_is_unique_and_exceeds_now() {
        let clock = Clock::new();
        let local = clock.now();
        let a = clock.new_clock(local);
        let b = clock.new_clock(local);
        assert!(gt_clock(a, local));
        assert!(gt_clock(b, a));
        clock.advance_to(a);
        assert_eq!(clock.now(), a);
        clock.advance_to(b);
        assert_eq!(clock.now(), b);
    }

    #[test]
    fn advance_waits_for_reservation_order() {
        let clock = std::sync::Arc::new(Clock::new());
        let a = clock.new_clock(0);
        let b = clock.new_clock(0);

        let late = std::sync::Arc::clone(&clock);
        let waiter = std::thread::spawn(move || late.advance_to(b));
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(!waiter.is_finished());
        assert_eq!(clock.now(), 0);

        clock.advance_to(a);
        waiter.join().unwrap();
        assert_eq!(clock.now(), b);
    }

    #[test]
    fn max_version_is_never_reached() {
        let clock = Clock::new();
        assert!(lt_clock(clock.new_clock(0), MAX_VERSION));
    }
}
