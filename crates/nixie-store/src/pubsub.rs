//! Per-actor subscription fabric.
//!
//! A mutex guards only the actor -> subscription-list map; callbacks are
//! invoked outside it so a subscriber may re-enter the store. Each
//! subscription carries its own invoke lock: `unsubscribe` unlinks the
//! entry, then takes that lock, so once `unsubscribe` returns the callback
//! is guaranteed not to run again. A subscriber must therefore not
//! unsubscribe itself from inside its own callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

/// Per-actor, monotone subscription id starting at 1
pub type SubscriptionId = u64;

/// Change callback: `(actor_id, key, value)`
pub type SubCallback = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    callback: SubCallback,
    /// Held while the callback runs; taken by unsubscribe to fence it out
    invoke_lock: Mutex<()>,
    active: AtomicBool,
}

#[derive(Default)]
struct SubscriptionList {
    next_id: SubscriptionId,
    entries: Vec<Arc<Subscription>>,
}

impl SubscriptionList {
    fn add(&mut self, callback: SubCallback) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Arc::new(Subscription {
            id,
            callback,
            invoke_lock: Mutex::new(()),
            active: AtomicBool::new(true),
        }));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let pos = self.entries.iter().position(|s| s.id == id)?;
        Some(self.entries.remove(pos))
    }
}

/// Fan-out of change events to per-actor subscriber lists
#[derive(Default)]
pub struct SubscriptionSystem {
    lists: Mutex<HashMap<String, SubscriptionList>>,
}

impl SubscriptionSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an actor's changes. Creates the list if absent.
    pub fn subscribe(&self, actor_id: &str, callback: SubCallback) -> SubscriptionId {
        let mut lists = self.lists.lock();
        lists.entry(actor_id.to_string()).or_default().add(callback)
    }

    /// Remove a subscription. Erases the list once it is empty.
    ///
    /// On return the callback is no longer running and never will again.
    pub fn unsubscribe(&self, actor_id: &str, sub_id: SubscriptionId) -> bool {
        let removed = {
            let mut lists = self.lists.lock();
            let Some(list) = lists.get_mut(actor_id) else {
                return false;
            };
            let removed = list.remove(sub_id);
            if removed.is_some() && list.entries.is_empty() {
                lists.remove(actor_id);
            }
            removed
        };

        match removed {
            Some(sub) => {
                sub.active.store(false, Ordering::SeqCst);
                // Wait out any in-flight invocation.
                drop(sub.invoke_lock.lock());
                true
            }
            None => false,
        }
    }

    /// Deliver one change event to every subscriber of `actor_id`.
    ///
    /// The list is snapshotted under the map lock and callbacks run outside
    /// it. A panicking callback is caught and logged; the rest still fire.
    pub fn notify(&self, actor_id: &str, key: &str, value: &str) {
        let snapshot: Vec<Arc<Subscription>> = {
            let lists = self.lists.lock();
            match lists.get(actor_id) {
                Some(list) => list.entries.clone(),
                None => return,
            }
        };

        for sub in snapshot {
            let _invoke = sub.invoke_lock.lock();
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (sub.callback)(actor_id, key, value)));
            if result.is_err() {
                error!(actor_id, key, sub_id = sub.id, "subscriber callback panicked");
            }
        }
    }

    /// Number of live subscriptions for an actor
    pub fn subscriber_count(&self, actor_id: &str) -> usize {
        self.lists
            .lock()
            .get(actor_id)
            .map(|l| l.entries.len())
            .unwrap_or(0)
    }

    /// Tear down every subscription for an actor.
    pub fn clear_actor(&self, actor_id: &str) -> usize {
        let removed = {
            let mut lists = self.lists.lock();
            lists.remove(actor_id)
        };
        match removed {
            Some(list) => {
                for sub in &list.entries {
                    sub.active.store(false, Ordering::SeqCst);
                }
                if !list.entries.is_empty() {
                    warn!(actor_id, count = list.entries.len(), "tore down live subscriptions");
                }
                list.entries.len()
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> SubCallback {
        let counter = Arc::clone(counter);
        Arc::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn subscribe_ids_are_per_actor_monotone_from_one() {
        let subs = SubscriptionSystem::new();
        let cb: SubCallback = Arc::new(|_, _, _| {});
        assert_eq!(subs.subscribe("a1", Arc::clone(&cb)), 1);
        assert_eq!(subs.subscribe("a1", Arc::clone(&cb)), 2);
        assert_eq!(subs.subscribe("a2", cb), 1);
    }

    #[test]
    fn notify_reaches_all_subscribers_of_actor() {
        let subs = SubscriptionSystem::new();
        let c1 = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        subs.subscribe("a1", counting_callback(&c1));
        subs.subscribe("a1", counting_callback(&c2));
        subs.subscribe("a2", counting_callback(&other));

        subs.notify("a1", "k", "v");

        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_stops_delivery_and_erases_empty_list() {
        let subs = SubscriptionSystem::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = subs.subscribe("a1", counting_callback(&counter));

        assert!(subs.unsubscribe("a1", id));
        assert_eq!(subs.subscriber_count("a1"), 0);

        subs.notify("a1", "k", "v");
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Second removal reports false.
        assert!(!subs.unsubscribe("a1", id));
    }

    #[test]
    fn panicking_subscriber_does_not_starve_the_rest() {
        let subs = SubscriptionSystem::new();
        let counter = Arc::new(AtomicUsize::new(0));

        subs.subscribe("a1", Arc::new(|_, _, _| panic!("bad subscriber")));
        subs.subscribe("a1", counting_callback(&counter));

        subs.notify("a1", "k", "v");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_reentering_the_fabric_does_not_deadlock() {
        let subs = Arc::new(SubscriptionSystem::new());
        let count = {
            let subs = Arc::clone(&subs);
            Arc::new(move |_: &str, _: &str, _: &str| {
                // Re-enter the map from inside a callback.
                let _ = subs.subscriber_count("a1");
            })
        };
        subs.subscribe("a1", count);
        subs.notify("a1", "k", "v");
    }

    #[test]
    fn unsubscribe_waits_out_inflight_invocation() {
        let subs = Arc::new(SubscriptionSystem::new());
        let in_callback = Arc::new(AtomicBool::new(false));
        let callback_done = Arc::new(AtomicBool::new(false));

        let id = {
            let in_callback = Arc::clone(&in_callback);
            let callback_done = Arc::clone(&callback_done);
            subs.subscribe(
                "a1",
                Arc::new(move |_, _, _| {
                    in_callback.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    callback_done.store(true, Ordering::SeqCst);
                }),
            )
        };

        let notifier = {
            let subs = Arc::clone(&subs);
            thread::spawn(move || subs.notify("a1", "k", "v"))
        };

        while !in_callback.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // Unsubscribe must block until the slow callback finished.
        assert!(subs.unsubscribe("a1", id));
        assert!(callback_done.load(Ordering::SeqCst));

        notifier.join().unwrap();
    }
}
