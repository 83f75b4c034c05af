//! Concurrency primitives for Nixie: the bounded mailbox and the worker pool.
//!
//! Everything here is plain OS threads and parking; there is no async
//! runtime below this layer.

pub mod mailbox;
pub mod pool;

pub use mailbox::{Mailbox, OverflowPolicy, PopError, PushError};
pub use pool::WorkerPool;
