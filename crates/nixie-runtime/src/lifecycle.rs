//! Actor lifecycle registry.
//!
//! The active-actor set is authoritative: components treat ids outside it
//! as nonexistent. Each id walks `Nonexistent -> Active -> Nonexistent`;
//! re-spawn after terminate starts a fresh lifecycle. Hooks run inside the
//! registry lock, so they must stay short; a panicking hook is caught and
//! logged and never fails the transition.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use nixie_core::{validate_actor_id, Error, Result};
use nixie_store::StateStore;

/// Hook invoked around spawn/terminate transitions with the actor id
pub type LifecycleHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    pre_spawn: Option<LifecycleHook>,
    post_spawn: Option<LifecycleHook>,
    pre_terminate: Option<LifecycleHook>,
    post_terminate: Option<LifecycleHook>,
}

struct Inner {
    active: HashSet<String>,
    hooks: Hooks,
}

/// Registry of live actors with spawn/terminate hooks
pub struct ActorLifecycle {
    store: Arc<StateStore>,
    inner: Mutex<Inner>,
}

impl ActorLifecycle {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                active: HashSet::new(),
                hooks: Hooks::default(),
            }),
        }
    }

    /// Bring an actor to life: validate the id, require that it is not
    /// already active, seed its keyspace, and mark it active. A store
    /// failure while seeding leaves the actor inactive.
    pub fn spawn_actor(
        &self,
        actor_id: &str,
        initial_state: &HashMap<String, String>,
    ) -> Result<()> {
        validate_actor_id(actor_id)?;

        let mut inner = self.inner.lock();
        if inner.active.contains(actor_id) {
            return Err(Error::ActorAlreadyActive {
                id: actor_id.to_string(),
            });
        }

        run_hook(&inner.hooks.pre_spawn, actor_id, "pre-spawn");

        for (key, value) in initial_state {
            if let Err(e) = self.store.set(actor_id, key, value, None) {
                error!(actor_id, key, error = %e, "seeding initial state failed");
                return Err(e);
            }
        }

        inner.active.insert(actor_id.to_string());
        run_hook(&inner.hooks.post_spawn, actor_id, "post-spawn");

        info!(actor_id, "actor spawned");
        Ok(())
    }

    /// Retire an actor: require that it is active, optionally clear its
    /// keyspace, and drop it from the active set. `force` also tears down
    /// its subscriptions.
    pub fn terminate_actor(&self, actor_id: &str, force: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.active.contains(actor_id) {
            return Err(Error::ActorNotActive {
                id: actor_id.to_string(),
            });
        }

        run_hook(&inner.hooks.pre_terminate, actor_id, "pre-terminate");

        if force {
            let cleared = self.store.clear_actor(actor_id);
            let subs = self.store.clear_subscriptions(actor_id);
            debug!(actor_id, cleared, subs, "force terminate cleared state");
        }

        inner.active.remove(actor_id);
        run_hook(&inner.hooks.post_terminate, actor_id, "post-terminate");

        info!(actor_id, force, "actor terminated");
        Ok(())
    }

    /// Whether the id names a live actor
    pub fn actor_exists(&self, actor_id: &str) -> bool {
        self.inner.lock().active.contains(actor_id)
    }

    /// Alias of [`ActorLifecycle::actor_exists`]; the active set is the
    /// single source of truth.
    pub fn is_actor_active(&self, actor_id: &str) -> bool {
        self.actor_exists(actor_id)
    }

    /// Snapshot of the active actor ids
    pub fn active_actors(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner.active.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live actors
    pub fn active_actor_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn set_pre_spawn_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.lock().hooks.pre_spawn = Some(Box::new(hook));
    }

    pub fn set_post_spawn_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.lock().hooks.post_spawn = Some(Box::new(hook));
    }

    pub fn set_pre_terminate_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.lock().hooks.pre_terminate = Some(Box::new(hook));
    }

    pub fn set_post_terminate_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.lock().hooks.post_terminate = Some(Box::new(hook));
    }
}

fn run_hook(hook: &Option<LifecycleHook>, actor_id: &str, stage: &str) {
    if let Some(hook) = hook {
        if catch_unwind(AssertUnwindSafe(|| hook(actor_id))).is_err() {
            error!(actor_id, stage, "lifecycle hook panicked; continuing");
        }
    }
}
