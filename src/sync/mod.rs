//! Cross-process coordination

pub mod lock;

pub use lock::{FileLock, LockGuard};
