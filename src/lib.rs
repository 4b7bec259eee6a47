pub mod ckptlog;
pub mod clock;
pub mod config;
pub mod errors;
pub mod isolation;
pub mod nvlog;
pub mod nvm;
pub mod object;
pub mod oplog;
pub mod ptrset;
pub mod qp;
pub mod recovery;
pub mod sync;
pub mod thread;
pub mod transaction;
pub mod tvlog;
pub mod zurvan;

// Re-export key types and structs for easier access
pub use config::Config;
pub use errors::{Result, ZurvanError};
pub use isolation::TransactionIsolation;
pub use object::ObjectHandle;
pub use recovery::{OpExecFn, RecoveryStats};
pub use transaction::{MutableView, Transaction, VersionedView};
pub use zurvan::{ThreadHandle, Zurvan};
