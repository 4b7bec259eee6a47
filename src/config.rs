use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, ZurvanError};

/// Cacheline size used for log entry alignment and padding.
pub const CACHE_LINE: usize = 64;

/// Largest operand payload accepted by `set_op`/`append_operand`.
pub const MAX_OPERAND_SIZE: usize = 256 - 24;

/// Transient version log watermarks, as fractions of the log size.
pub const TVLOG_HIGH_MARK_PCT: usize = 75;
pub const TVLOG_LOW_MARK_PCT: usize = 50;

/// Operation log watermarks.
pub const OPLOG_HIGH_MARK_PCT: usize = 75;
pub const OPLOG_LOW_MARK_PCT: usize = 50;

/// Checkpoint log watermarks. The low mark (5/8 of the size) is deliberately
/// higher than the other logs': checkpoint entries are masters and writeback
/// is expensive.
pub const CKPTLOG_HIGH_MARK_PCT: usize = 75;
pub const CKPTLOG_LOW_MARK_NUM: u64 = 5;
pub const CKPTLOG_LOW_MARK_DEN: u64 = 8;

/// Maximum number of registered worker threads. Each thread owns one
/// operation log segment and one checkpoint log segment in the pool's
/// segment table.
pub const MAX_THREADS: usize = 32;

/// Configuration for a [`crate::Zurvan`] engine instance.
///
/// Log sizes must be powers of two; other values are rounded up with a
/// warning at init, mirroring the durable ring's contract.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing file for the NVM pool.
    pub pool_path: PathBuf,
    /// Total pool size in bytes (root block + log segments + object heap).
    pub pool_size: usize,
    /// Per-thread transient version log size (DRAM).
    pub tvlog_size: usize,
    /// Per-thread operation log segment size.
    pub oplog_size: usize,
    /// Per-thread checkpoint log segment size.
    pub ckptlog_size: usize,
    /// Sleep interval between quiescence detection rounds.
    pub qp_interval: Duration,
}

impl Config {
    pub fn new(pool_path: impl Into<PathBuf>) -> Self {
        Self {
            pool_path: pool_path.into(),
            pool_size: 256 << 20,
            tvlog_size: 1 << 20,
            oplog_size: 1 << 20,
            ckptlog_size: 1 << 22,
            qp_interval: Duration::from_micros(500),
        }
    }

    pub fn with_pool_size(mut self, bytes: usize) -> Self {
        self.pool_size = bytes;
        self
    }

    pub fn with_tvlog_size(mut self, bytes: usize) -> Self {
        self.tvlog_size = bytes;
        self
    }

    pub fn with_oplog_size(mut self, bytes: usize) -> Self {
        self.oplog_size = bytes;
        self
    }

    pub fn with_ckptlog_size(mut self, bytes: usize) -> Self {
        self.ckptlog_size = bytes;
        self
    }

    pub fn with_qp_interval(mut self, interval: Duration) -> Self {
        self.qp_interval = interval;
        self
    }

    /// Validates sizes and rounds log sizes up to powers of two.
    pub(crate) fn validated(mut self) -> Result<Self> {
        if self.pool_path.as_os_str().is_empty() {
            return Err(ZurvanError::Config("empty pool path".to_string()));
        }
        self.tvlog_size = round_up_pow2("tvlog", self.tvlog_size)?;
        self.oplog_size = round_up_pow2("oplog", self.oplog_size)?;
        self.ckptlog_size = round_up_pow2("ckptlog", self.ckptlog_size)?;

        // Segments are carved out lazily at thread registration, and the
        // allocator rejects any segment the heap cannot fit. The static
        // check only demands room for a single thread's pair of logs.
        let per_thread = self.oplog_size + self.ckptlog_size;
        if self.pool_size <= per_thread {
            return Err(ZurvanError::Config(format!(
                "pool size {} leaves no heap after {} bytes of log segments",
                self.pool_size, per_thread
            )));
        }
        Ok(self)
    }
}

fn round_up_pow2(what: &str, size: usize) -> Result<usize> {
    if size < 2 * CACHE_LINE {
        return Err(ZurvanError::Config(format!(
            "{what} size {size} is too small"
        )));
    }
    if size.is_power_of_two() {
        return Ok(size);
    }
    let rounded = size.next_power_of_two();
    log::warn!("{what} size {size} is not a power of two; rounding up to {rounded}");
    Ok(rounded)
}
