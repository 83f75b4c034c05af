//! Versioned, per-actor key/value store.
//!
//! TigerStyle: every mutation bumps an explicit version; readers never
//! block readers.
//!
//! A readers-writer lock guards the two-level map; readers do not block each
//! other. The access stamp lives in an atomic so `get` can touch it under
//! the shared lock. Mutations bump the per-entry version, then run the
//! durability step (WAL append, or a write-behind enqueue) and the
//! subscriber notification with the map lock released.
//!
//! `set_if_version` is the one synchronisation primitive offered to
//! concurrent writers: it is linearisable with respect to every other store
//! operation because the compare and the mutation happen under the same
//! exclusive lock.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use nixie_core::constants::VALUE_SIZE_BYTES_MAX;
use nixie_core::{now_ms, validate_actor_id, validate_key, DurabilityMode, Error, Result};
use nixie_sync::WorkerPool;

use crate::pubsub::{SubCallback, SubscriptionId, SubscriptionSystem};
use crate::wal::Wal;
use crate::write_behind::{DirtyRecord, WriteBehindWorker};

/// Everything stored for one (actor_id, key)
#[derive(Debug)]
pub struct ValueMetadata {
    value: String,
    version: u64,
    created_at_ms: u64,
    last_accessed_ms: AtomicU64,
    expires_at_ms: Option<u64>,
}

impl ValueMetadata {
    fn new(value: String, now: u64, expires_at_ms: Option<u64>) -> Self {
        Self {
            value,
            version: 1,
            created_at_ms: now,
            last_accessed_ms: AtomicU64::new(now),
            expires_at_ms,
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now >= at)
    }

    fn touch(&self, now: u64) {
        self.last_accessed_ms.store(now, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            value: self.value.clone(),
            version: self.version,
            created_at_ms: self.created_at_ms,
            last_accessed_ms: self.last_accessed_ms.load(Ordering::Relaxed),
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Point-in-time copy of an entry's metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataSnapshot {
    pub value: String,
    pub version: u64,
    pub created_at_ms: u64,
    pub last_accessed_ms: u64,
    pub expires_at_ms: Option<u64>,
}

type ActorSpace = HashMap<String, ValueMetadata>;

/// Builder for [`StateStore`]
#[derive(Default)]
pub struct StateStoreBuilder {
    wal: Option<Arc<Wal>>,
    durability: DurabilityMode,
    pool: Option<Arc<WorkerPool>>,
    write_behind_batch_size: Option<usize>,
}

impl StateStoreBuilder {
    /// Attach a WAL; without one the store is purely in-memory.
    pub fn wal(mut self, wal: Arc<Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Choose the durability mode (default: write-ahead).
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Offload subscriber notification onto this pool.
    pub fn notify_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Flush batch size for write-behind mode.
    pub fn write_behind_batch_size(mut self, batch_size: usize) -> Self {
        self.write_behind_batch_size = Some(batch_size);
        self
    }

    pub fn build(self) -> Result<StateStore> {
        let write_behind = match (self.durability, &self.wal) {
            (DurabilityMode::WriteBehind, Some(wal)) => {
                let batch = self
                    .write_behind_batch_size
                    .unwrap_or(nixie_core::constants::WRITE_BEHIND_BATCH_COUNT_DEFAULT);
                Some(WriteBehindWorker::start_with_batch_size(
                    Arc::clone(wal),
                    batch,
                ))
            }
            (DurabilityMode::WriteBehind, None) => {
                return Err(Error::InvalidConfiguration {
                    field: "store.durability".into(),
                    reason: "write-behind mode requires a WAL".into(),
                })
            }
            (DurabilityMode::WriteAhead, _) => None,
        };

        Ok(StateStore {
            map: RwLock::new(HashMap::new()),
            ttl_index: Mutex::new(HashSet::new()),
            subs: Arc::new(SubscriptionSystem::new()),
            wal: self.wal,
            write_behind,
            durability: self.durability,
            pool: self.pool,
        })
    }
}

/// In-memory state store with versioning, TTL, and change notification
pub struct StateStore {
    map: RwLock<HashMap<String, ActorSpace>>,
    /// (actor_id, key) pairs known to carry an expiry
    ttl_index: Mutex<HashSet<(String, String)>>,
    subs: Arc<SubscriptionSystem>,
    wal: Option<Arc<Wal>>,
    write_behind: Option<WriteBehindWorker>,
    durability: DurabilityMode,
    pool: Option<Arc<WorkerPool>>,
}

impl StateStore {
    /// In-memory store with no WAL and inline notification
    pub fn in_memory() -> Self {
        StateStoreBuilder::default()
            .build()
            .expect("in-memory store construction cannot fail")
    }

    pub fn builder() -> StateStoreBuilder {
        StateStoreBuilder::default()
    }

    /// Upsert a value. Bumps the version, stamps access time, arms the TTL,
    /// then appends to the WAL (per durability mode) and notifies
    /// subscribers.
    pub fn set(
        &self,
        actor_id: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.validate_write(actor_id, key, value)?;

        {
            let mut map = self.map.write();
            let now = now_ms();
            let expires_at_ms = ttl.map(|d| now + d.as_millis() as u64);
            Self::apply_upsert(&mut map, actor_id, key, value, now, expires_at_ms);
            self.index_ttl(actor_id, key, expires_at_ms);
        }

        self.log_write(actor_id, key, value)?;
        self.notify(actor_id, key, value);
        Ok(())
    }

    /// Read a value. Expired or missing entries report none; a live read
    /// refreshes the access stamp without taking the exclusive lock.
    pub fn get(&self, actor_id: &str, key: &str) -> Option<String> {
        let map = self.map.read();
        let entry = map.get(actor_id)?.get(key)?;
        let now = now_ms();
        if entry.is_expired(now) {
            return None;
        }
        entry.touch(now);
        Some(entry.value.clone())
    }

    /// Read an entry's full metadata (None for missing or expired entries).
    pub fn get_metadata(&self, actor_id: &str, key: &str) -> Option<MetadataSnapshot> {
        let map = self.map.read();
        let entry = map.get(actor_id)?.get(key)?;
        if entry.is_expired(now_ms()) {
            return None;
        }
        Some(entry.snapshot())
    }

    /// Remove an entry. Deletions are not logged to the WAL.
    pub fn del(&self, actor_id: &str, key: &str) -> bool {
        let removed = {
            let mut map = self.map.write();
            let Some(space) = map.get_mut(actor_id) else {
                return false;
            };
            let removed = space.remove(key).is_some();
            if space.is_empty() {
                map.remove(actor_id);
            }
            removed
        };
        if removed {
            self.ttl_index
                .lock()
                .remove(&(actor_id.to_string(), key.to_string()));
        }
        removed
    }

    /// Compare-and-set: apply the same mutation as [`StateStore::set`] iff
    /// the stored version equals `expected_version`. A missing entry never
    /// matches. Returns whether the write happened.
    pub fn set_if_version(
        &self,
        actor_id: &str,
        key: &str,
        value: &str,
        expected_version: u64,
    ) -> Result<bool> {
        self.validate_write(actor_id, key, value)?;

        let swapped = {
            let mut map = self.map.write();
            let current = map
                .get(actor_id)
                .and_then(|space| space.get(key))
                .map(|m| m.version);
            match current {
                Some(version) if version == expected_version => {
                    let now = now_ms();
                    Self::apply_upsert(&mut map, actor_id, key, value, now, None);
                    self.index_ttl(actor_id, key, None);
                    true
                }
                _ => false,
            }
        };

        if !swapped {
            return Ok(false);
        }

        self.log_write(actor_id, key, value)?;
        self.notify(actor_id, key, value);
        Ok(true)
    }

    /// Reap entries whose expiry has passed. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let candidates: Vec<(String, String)> = {
            let index = self.ttl_index.lock();
            index.iter().cloned().collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        let now = now_ms();
        let mut removed = 0;
        let mut stale_index: Vec<(String, String)> = Vec::new();

        enum Sweep {
            Reap,
            Unindex,
            Keep,
        }

        {
            let mut map = self.map.write();
            for (actor_id, key) in &candidates {
                let Some(space) = map.get_mut(actor_id) else {
                    stale_index.push((actor_id.clone(), key.clone()));
                    continue;
                };
                let action = match space.get(key) {
                    Some(entry) if entry.is_expired(now) => Sweep::Reap,
                    // Expiry cleared by a later set, or key deleted:
                    // the index entry is stale either way.
                    Some(entry) if entry.expires_at_ms.is_none() => Sweep::Unindex,
                    Some(_) => Sweep::Keep,
                    None => Sweep::Unindex,
                };
                match action {
                    Sweep::Reap => {
                        space.remove(key);
                        removed += 1;
                        stale_index.push((actor_id.clone(), key.clone()));
                        if space.is_empty() {
                            map.remove(actor_id);
                        }
                    }
                    Sweep::Unindex => stale_index.push((actor_id.clone(), key.clone())),
                    Sweep::Keep => {}
                }
            }
        }

        if !stale_index.is_empty() {
            let mut index = self.ttl_index.lock();
            for pair in &stale_index {
                index.remove(pair);
            }
        }

        if removed > 0 {
            debug!(removed, "ttl sweep reaped expired entries");
        }
        removed
    }

    /// Remove an actor's entire keyspace (force-terminate path).
    pub fn clear_actor(&self, actor_id: &str) -> usize {
        let removed = {
            let mut map = self.map.write();
            map.remove(actor_id).map(|space| space.len()).unwrap_or(0)
        };
        if removed > 0 {
            let mut index = self.ttl_index.lock();
            index.retain(|(actor, _)| actor != actor_id);
        }
        removed
    }

    /// Re-apply a replayed WAL record as a plain upsert, without logging it
    /// again or notifying subscribers. Used during startup recovery.
    pub fn restore(&self, actor_id: &str, key: &str, value: &str) {
        let mut map = self.map.write();
        let now = now_ms();
        Self::apply_upsert(&mut map, actor_id, key, value, now, None);
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a change callback for an actor.
    pub fn subscribe(&self, actor_id: &str, callback: SubCallback) -> SubscriptionId {
        self.subs.subscribe(actor_id, callback)
    }

    /// Remove a subscription; the callback will not run after this returns.
    pub fn unsubscribe(&self, actor_id: &str, sub_id: SubscriptionId) -> bool {
        self.subs.unsubscribe(actor_id, sub_id)
    }

    /// Live subscription count for an actor
    pub fn subscriber_count(&self, actor_id: &str) -> usize {
        self.subs.subscriber_count(actor_id)
    }

    /// Tear down all subscriptions for an actor.
    pub fn clear_subscriptions(&self, actor_id: &str) -> usize {
        self.subs.clear_actor(actor_id)
    }

    // =========================================================================
    // Introspection and shutdown
    // =========================================================================

    /// Entries currently held for an actor, counting expired ones the TTL
    /// sweep has not reaped yet
    pub fn key_count(&self, actor_id: &str) -> usize {
        self.map
            .read()
            .get(actor_id)
            .map(|space| space.len())
            .unwrap_or(0)
    }

    /// The configured durability mode
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// The attached WAL, if any
    pub fn wal(&self) -> Option<&Arc<Wal>> {
        self.wal.as_ref()
    }

    /// Pending dirty records in write-behind mode
    pub fn write_behind_backlog(&self) -> usize {
        self.write_behind
            .as_ref()
            .map(|w| w.queued_records())
            .unwrap_or(0)
    }

    /// Stop the write-behind flusher, draining its batch in hand.
    pub fn shutdown(&self) {
        if let Some(worker) = &self.write_behind {
            worker.stop();
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn validate_write(&self, actor_id: &str, key: &str, value: &str) -> Result<()> {
        validate_actor_id(actor_id)?;
        validate_key(key)?;
        if value.len() > VALUE_SIZE_BYTES_MAX {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                limit: VALUE_SIZE_BYTES_MAX,
            });
        }
        // The WAL is one record per line; an embedded newline would split
        // the record on replay. Reject up front so every accepted value
        // round-trips.
        if value.contains(['\n', '\r']) {
            return Err(Error::invalid_value("must not contain newlines"));
        }
        Ok(())
    }

    fn apply_upsert(
        map: &mut HashMap<String, ActorSpace>,
        actor_id: &str,
        key: &str,
        value: &str,
        now: u64,
        expires_at_ms: Option<u64>,
    ) {
        let space = map.entry(actor_id.to_string()).or_default();
        match space.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.value = value.to_string();
                entry.version += 1;
                entry.touch(now);
                entry.expires_at_ms = expires_at_ms;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ValueMetadata::new(value.to_string(), now, expires_at_ms));
            }
        }
    }

    fn index_ttl(&self, actor_id: &str, key: &str, expires_at_ms: Option<u64>) {
        let mut index = self.ttl_index.lock();
        let pair = (actor_id.to_string(), key.to_string());
        if expires_at_ms.is_some() {
            index.insert(pair);
        } else {
            index.remove(&pair);
        }
    }

    /// Durability step, run after the mutation is visible.
    ///
    /// Write-ahead: append and flush before acknowledging; a failure is
    /// surfaced and the write stays unacknowledged. Write-behind: hand the
    /// record to the flusher and return immediately.
    fn log_write(&self, actor_id: &str, key: &str, value: &str) -> Result<()> {
        match self.durability {
            DurabilityMode::WriteAhead => {
                if let Some(wal) = &self.wal {
                    wal.append(actor_id, key, value)?;
                }
            }
            DurabilityMode::WriteBehind => {
                if let Some(worker) = &self.write_behind {
                    worker.enqueue(DirtyRecord {
                        actor_id: actor_id.to_string(),
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fan out a change event, on the pool when one is attached.
    fn notify(&self, actor_id: &str, key: &str, value: &str) {
        match &self.pool {
            Some(pool) => {
                let subs = Arc::clone(&self.subs);
                let actor_id = actor_id.to_string();
                let key = key.to_string();
                let value = value.to_string();
                if pool
                    .submit(move || subs.notify(&actor_id, &key, &value))
                    .is_err()
                {
                    warn!("notify pool stopped; change event dropped");
                }
            }
            None => self.subs.notify(actor_id, key, value),
        }
    }
}
