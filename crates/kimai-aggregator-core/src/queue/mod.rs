//! Offline operation queue.
//!
//! Mutations that cannot reach the backend (settings updates, data writes)
//! are buffered in an `OfflineQueue` backed by durable key-value storage and
//! replayed later through a caller-supplied send function. Retries, entry
//! count, serialized size and entry age are all bounded.

pub mod offline;
pub mod operation;
pub mod storage;

pub use offline::{DrainReport, OfflineQueue};
pub use operation::{OperationType, QueuedOperation};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
