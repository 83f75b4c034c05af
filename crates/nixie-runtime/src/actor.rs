//! Typed actor runtime.
//!
//! TigerStyle: single-threaded per-actor execution, explicit error routing.
//!
//! An actor pairs a user behaviour (message handler plus serialisable
//! state) with a private mailbox and a dedicated consumer thread, so its
//! handler never runs concurrently with itself. State persists through the
//! versioned store's `set`, which means actor snapshots participate in the
//! WAL and in change notification like any other write.
//!
//! Failures inside handlers, persistence, or enqueue are routed through the
//! behaviour's `on_error` and never kill the consumer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use nixie_core::constants::{CONSUMER_POP_TIMEOUT_MS, MAILBOX_CAPACITY_DEFAULT};
use nixie_core::{Error, Result};
use nixie_store::StateStore;
use nixie_sync::{Mailbox, OverflowPolicy, PopError, PushError};

use crate::lifecycle::ActorLifecycle;
use crate::scheduler::{WorkItem, WorkMailbox};

/// Store key under which an actor's serialised state lives
pub const STATE_KEY: &str = "__state";

/// User-supplied actor behaviour: message handling over serialisable state
pub trait ActorBehavior: Send + 'static {
    type Message: Send + 'static;
    type Reply: Send + 'static;
    type State: Serialize + DeserializeOwned + Default + Send + 'static;

    /// Handle one message. Runs on the actor's consumer thread only.
    fn on_message(&mut self, state: &mut Self::State, msg: Self::Message) -> Result<Self::Reply>;

    /// Called for every failure inside the runtime on this actor's behalf.
    fn on_error(&mut self, actor_id: &str, reason: &str) {
        error!(actor_id, reason, "actor error");
    }
}

/// Construction options for an actor
#[derive(Debug, Clone)]
pub struct ActorOptions {
    /// Persist state after every `tell` handler run
    pub auto_persist: bool,
    /// Mailbox capacity (Block policy)
    pub mailbox_capacity: usize,
}

impl Default for ActorOptions {
    fn default() -> Self {
        Self {
            auto_persist: true,
            mailbox_capacity: MAILBOX_CAPACITY_DEFAULT,
        }
    }
}

struct ActorCore<B: ActorBehavior> {
    behavior: B,
    state: B::State,
}

/// Completion handle returned by [`Actor::ask`]
pub struct ReplyHandle<R> {
    rx: Receiver<Result<R>>,
}

impl<R> ReplyHandle<R> {
    /// Block until the handler has run.
    pub fn wait(self) -> Result<R> {
        self.rx
            .recv()
            .map_err(|_| Error::internal("actor stopped before replying"))?
    }

    /// Block up to `timeout` for the handler to run.
    pub fn wait_timeout(self, timeout: Duration) -> Result<R> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::internal("timed out waiting for actor reply"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::internal("actor stopped before replying"))
            }
        }
    }
}

/// A named actor: private mailbox, consumer thread, persistent state
pub struct Actor<B: ActorBehavior> {
    actor_id: String,
    store: Arc<StateStore>,
    lifecycle: Arc<ActorLifecycle>,
    mailbox: Arc<WorkMailbox>,
    core: Arc<Mutex<ActorCore<B>>>,
    options: ActorOptions,
    consumer: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

impl<B: ActorBehavior> Actor<B> {
    pub fn new(
        actor_id: impl Into<String>,
        behavior: B,
        store: Arc<StateStore>,
        lifecycle: Arc<ActorLifecycle>,
        options: ActorOptions,
    ) -> Self {
        let mailbox = Arc::new(Mailbox::with_capacity(
            options.mailbox_capacity,
            OverflowPolicy::Block,
        ));
        Self {
            actor_id: actor_id.into(),
            store,
            lifecycle,
            mailbox,
            core: Arc::new(Mutex::new(ActorCore {
                behavior,
                state: B::State::default(),
            })),
            options,
            consumer: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Bring the actor online: register with the lifecycle if needed, load
    /// persisted state (or keep the default), start the consumer thread.
    /// Idempotent; fails fast and stays uninitialised on any error.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.mailbox.is_stopped() {
            // A stopped mailbox never accepts work again; a restarted actor
            // needs a fresh instance.
            return Err(Error::internal(format!(
                "actor {} was stopped; create a new instance",
                self.actor_id
            )));
        }

        if !self.lifecycle.is_actor_active(&self.actor_id) {
            self.lifecycle.spawn_actor(&self.actor_id, &HashMap::new())?;
        }

        self.load_state_from_store()?;

        let consumer = {
            let mailbox = Arc::clone(&self.mailbox);
            let core = Arc::clone(&self.core);
            let actor_id = self.actor_id.clone();
            thread::Builder::new()
                .name(format!("nixie-actor-{}", self.actor_id))
                .spawn(move || consumer_loop::<B>(&actor_id, &mailbox, &core))
                .map_err(|e| Error::internal(format!("spawning actor consumer: {e}")))?
        };
        *self.consumer.lock() = Some(consumer);

        self.initialized.store(true, Ordering::SeqCst);
        debug!(actor_id = %self.actor_id, "actor initialized");
        Ok(())
    }

    /// Fire-and-forget: enqueue the message; the handler runs on the
    /// consumer thread, followed by a persist when auto-persist is on.
    pub fn tell(&self, msg: B::Message) -> Result<()> {
        self.ensure_initialized()?;

        let core = Arc::clone(&self.core);
        let store = Arc::clone(&self.store);
        let actor_id = self.actor_id.clone();
        let auto_persist = self.options.auto_persist;

        let item: WorkItem = Box::new(move || {
            let mut guard = core.lock();
            let core = &mut *guard;
            match core.behavior.on_message(&mut core.state, msg) {
                Ok(_) => {
                    if auto_persist {
                        if let Err(e) = persist_state(&store, &actor_id, &core.state) {
                            core.behavior
                                .on_error(&actor_id, &format!("persist failed: {e}"));
                        }
                    }
                }
                Err(e) => core.behavior.on_error(&actor_id, &e.to_string()),
            }
        });

        self.push_item(item)
    }

    /// Request/response: enqueue the message and receive the handler's
    /// result through the returned completion handle.
    pub fn ask(&self, msg: B::Message) -> Result<ReplyHandle<B::Reply>> {
        self.ensure_initialized()?;

        let (tx, rx) = bounded(1);
        let core = Arc::clone(&self.core);
        let actor_id = self.actor_id.clone();

        let item: WorkItem = Box::new(move || {
            let mut guard = core.lock();
            let core = &mut *guard;
            let result = core.behavior.on_message(&mut core.state, msg);
            if let Err(e) = &result {
                core.behavior.on_error(&actor_id, &e.to_string());
            }
            let _ = tx.send(result);
        });

        self.push_item(item)?;
        Ok(ReplyHandle { rx })
    }

    /// Serialise the current state under the state mutex and store it.
    pub fn persist(&self) -> Result<()> {
        let guard = self.core.lock();
        persist_state(&self.store, &self.actor_id, &guard.state)
    }

    /// Stop the actor: drain and stop the mailbox, join the consumer,
    /// terminate via the lifecycle. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.mailbox.stop();
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                error!(actor_id = %self.actor_id, "actor consumer terminated by panic");
            }
        }

        match self.lifecycle.terminate_actor(&self.actor_id, false) {
            Ok(()) => {}
            Err(Error::ActorNotActive { .. }) => {
                // Already terminated through the service; nothing to do.
                debug!(actor_id = %self.actor_id, "actor was already terminated");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// The actor's id
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Whether `initialize` has completed and `stop` has not
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Messages waiting in the mailbox
    pub fn queue_size(&self) -> usize {
        self.mailbox.len()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ActorNotInitialized {
                id: self.actor_id.clone(),
            })
        }
    }

    fn push_item(&self, item: WorkItem) -> Result<()> {
        match self.mailbox.push(item) {
            Ok(()) => Ok(()),
            Err(PushError::Full { depth, limit }) => {
                let err = Error::MailboxFull { depth, limit };
                self.core
                    .lock()
                    .behavior
                    .on_error(&self.actor_id, &err.to_string());
                Err(err)
            }
            Err(PushError::Stopped) => Err(Error::MailboxStopped),
        }
    }

    /// Load persisted state, or keep the default when none exists.
    fn load_state_from_store(&self) -> Result<()> {
        if let Some(raw) = self.store.get(&self.actor_id, STATE_KEY) {
            let state: B::State =
                serde_json::from_str(&raw).map_err(|e| Error::DeserializationFailed {
                    reason: format!("actor {} state: {e}", self.actor_id),
                })?;
            self.core.lock().state = state;
            debug!(actor_id = %self.actor_id, "actor state loaded from store");
        }
        Ok(())
    }
}

impl<B: ActorBehavior> Drop for Actor<B> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn persist_state<S: Serialize>(store: &StateStore, actor_id: &str, state: &S) -> Result<()> {
    let raw = serde_json::to_string(state).map_err(|e| Error::SerializationFailed {
        reason: format!("actor {actor_id} state: {e}"),
    })?;
    store.set(actor_id, STATE_KEY, &raw, None)
}

fn consumer_loop<B: ActorBehavior>(
    actor_id: &str,
    mailbox: &WorkMailbox,
    core: &Arc<Mutex<ActorCore<B>>>,
) {
    let timeout = Duration::from_millis(CONSUMER_POP_TIMEOUT_MS);
    loop {
        match mailbox.wait_and_pop(timeout) {
            Ok(item) => {
                if catch_unwind(AssertUnwindSafe(item)).is_err() {
                    core.lock()
                        .behavior
                        .on_error(actor_id, "handler panicked");
                }
            }
            Err(PopError::TimedOut) => continue,
            Err(PopError::Stopped) => break,
        }
    }
    debug!(actor_id, "actor consumer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct CounterState {
        count: i64,
    }

    enum CounterMsg {
        Add(i64),
        Get,
        Fail,
    }

    struct CounterBehavior {
        errors: Arc<AtomicUsize>,
    }

    impl ActorBehavior for CounterBehavior {
        type Message = CounterMsg;
        type Reply = i64;
        type State = CounterState;

        fn on_message(&mut self, state: &mut CounterState, msg: CounterMsg) -> Result<i64> {
            match msg {
                CounterMsg::Add(n) => {
                    state.count += n;
                    Ok(state.count)
                }
                CounterMsg::Get => Ok(state.count),
                CounterMsg::Fail => Err(Error::internal("handler refused")),
            }
        }

        fn on_error(&mut self, _actor_id: &str, _reason: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<StateStore>,
        lifecycle: Arc<ActorLifecycle>,
        errors: Arc<AtomicUsize>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(StateStore::in_memory());
            let lifecycle = Arc::new(ActorLifecycle::new(Arc::clone(&store)));
            Self {
                store,
                lifecycle,
                errors: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn actor(&self, id: &str, options: ActorOptions) -> Actor<CounterBehavior> {
            Actor::new(
                id,
                CounterBehavior {
                    errors: Arc::clone(&self.errors),
                },
                Arc::clone(&self.store),
                Arc::clone(&self.lifecycle),
                options,
            )
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn initialize_is_idempotent_and_registers_with_lifecycle() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());

        actor.initialize().unwrap();
        actor.initialize().unwrap();

        assert!(actor.is_initialized());
        assert!(fx.lifecycle.is_actor_active("a1"));

        actor.stop().unwrap();
        assert!(!actor.is_initialized());
        assert!(!fx.lifecycle.is_actor_active("a1"));
    }

    #[test]
    fn tell_before_initialize_is_rejected() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        assert!(matches!(
            actor.tell(CounterMsg::Add(1)),
            Err(Error::ActorNotInitialized { .. })
        ));
    }

    #[test]
    fn ask_round_trips_through_the_handler() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        actor.initialize().unwrap();

        assert_eq!(
            actor.ask(CounterMsg::Add(5)).unwrap().wait().unwrap(),
            5
        );
        assert_eq!(
            actor.ask(CounterMsg::Add(2)).unwrap().wait().unwrap(),
            7
        );
        assert_eq!(actor.ask(CounterMsg::Get).unwrap().wait().unwrap(), 7);

        actor.stop().unwrap();
    }

    #[test]
    fn tell_auto_persists_through_the_store() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        actor.initialize().unwrap();

        actor.tell(CounterMsg::Add(3)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            fx.store.get("a1", STATE_KEY).is_some()
        }));
        let raw = fx.store.get("a1", STATE_KEY).unwrap();
        let state: CounterState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.count, 3);

        actor.stop().unwrap();
    }

    #[test]
    fn initialize_loads_persisted_state() {
        let fx = Fixture::new();
        {
            let actor = fx.actor("a1", ActorOptions::default());
            actor.initialize().unwrap();
            actor.tell(CounterMsg::Add(42)).unwrap();
            assert!(wait_until(Duration::from_secs(2), || {
                fx.store.get("a1", STATE_KEY).is_some()
            }));
            actor.stop().unwrap();
        }

        let revived = fx.actor("a1", ActorOptions::default());
        revived.initialize().unwrap();
        assert_eq!(revived.ask(CounterMsg::Get).unwrap().wait().unwrap(), 42);
        revived.stop().unwrap();
    }

    #[test]
    fn corrupt_persisted_state_fails_initialize() {
        let fx = Fixture::new();
        fx.store.set("a1", STATE_KEY, "not json", None).unwrap();
        fx.lifecycle.spawn_actor("a1", &HashMap::new()).unwrap();

        let actor = fx.actor("a1", ActorOptions::default());
        assert!(matches!(
            actor.initialize(),
            Err(Error::DeserializationFailed { .. })
        ));
        assert!(!actor.is_initialized());
    }

    #[test]
    fn handler_error_routes_to_on_error_and_consumer_survives() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        actor.initialize().unwrap();

        actor.tell(CounterMsg::Fail).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            fx.errors.load(Ordering::SeqCst) == 1
        }));

        // Consumer still alive and serving.
        assert_eq!(actor.ask(CounterMsg::Add(1)).unwrap().wait().unwrap(), 1);
        actor.stop().unwrap();
    }

    #[test]
    fn ask_error_is_carried_through_the_handle() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        actor.initialize().unwrap();

        let result = actor.ask(CounterMsg::Fail).unwrap().wait();
        assert!(matches!(result, Err(Error::Internal { .. })));

        actor.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_rejects_later_messages() {
        let fx = Fixture::new();
        let actor = fx.actor("a1", ActorOptions::default());
        actor.initialize().unwrap();

        actor.stop().unwrap();
        actor.stop().unwrap();

        assert!(actor.tell(CounterMsg::Add(1)).is_err());
    }

    #[test]
    fn messages_are_serialized_in_order() {
        let fx = Fixture::new();
        let actor = fx.actor(
            "a1",
            ActorOptions {
                auto_persist: false,
                ..ActorOptions::default()
            },
        );
        actor.initialize().unwrap();

        for _ in 0..100 {
            actor.tell(CounterMsg::Add(1)).unwrap();
        }
        // The final ask queues behind every tell.
        assert_eq!(actor.ask(CounterMsg::Get).unwrap().wait().unwrap(), 100);

        actor.stop().unwrap();
    }
}
