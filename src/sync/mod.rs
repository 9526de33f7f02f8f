//! Consistency primitives: instance locks, merge/diff/hash and the hub lease.

pub mod lease;
pub mod lock;
pub mod merge;

pub use lease::{ErrorRateLimiter, apply_soft_lease};
pub use lock::{InstanceLock, LockManager};
pub use merge::{HashCheck, check_hash_diff, merge_task, outbound_diff, prepare_for_storage};
