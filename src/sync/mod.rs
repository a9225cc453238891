//! Async coordination primitives.

pub mod cancel;
pub mod mutex;

pub use cancel::{deadline_token, run_cancellable};
pub use mutex::{Mutex, MutexGuard};
