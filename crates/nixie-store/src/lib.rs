//! Durable state for Nixie: the versioned store, its write-ahead log, the
//! write-behind flusher, and the subscription fabric.

pub mod pubsub;
pub mod store;
pub mod wal;
pub mod write_behind;

pub use pubsub::{SubCallback, SubscriptionId, SubscriptionSystem};
pub use store::{MetadataSnapshot, StateStore, StateStoreBuilder, ValueMetadata};
pub use wal::{ReplayStats, Wal, WalRecord};
pub use write_behind::{DirtyRecord, WriteBehindWorker};
