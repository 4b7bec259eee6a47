use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZurvanError {
    /// Optimistic concurrency failure: a lock was held by another
    /// transaction, the snapshot went stale, or read-set validation
    /// failed. The whole transaction body must be retried from `begin`.
    #[error("Transaction conflict detected")]
    TransactionConflict,

    /// A durable log ran out of space. Callers are contractually required
    /// to reclaim below the high watermark before appending, so this only
    /// surfaces under deliberate test instrumentation.
    #[error("Log capacity exhausted: {0}")]
    LogCapacity(String),

    /// The NVM pool has no room left for an allocation.
    #[error("NVM pool exhausted")]
    PoolExhausted,

    /// The handle does not refer to a live object.
    #[error("Invalid object handle: {0}")]
    InvalidHandle(u64),

    /// A write transaction reached commit without a logical operation
    /// record; recovery could not replay it.
    #[error("Write transaction committed without a logical operation")]
    MissingOperation,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ZurvanError>;
