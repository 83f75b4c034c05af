//! Service facade: maps the five external verbs onto store and lifecycle
//! operations.
//!
//! The request/response structs mirror the wire contract; the transport
//! adapter serialises them as JSON. Errors never cross the boundary as
//! panics: spawn/terminate report `success` plus an optional message, reads
//! report a `found` flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nixie_core::constants::{SUBSCRIBE_POLL_TIMEOUT_MS, SUBSCRIBE_QUEUE_CAPACITY};
use nixie_core::{Error, Result};
use nixie_runtime::ActorLifecycle;
use nixie_store::{StateStore, SubscriptionId};
use nixie_sync::{Mailbox, OverflowPolicy, PopError};

/// Event type emitted for every successful set
pub const EVENT_TYPE_UPDATED: &str = "UPDATED";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub actor_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: String,
    pub found: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRequest {
    pub actor_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub actor_id: String,
}

/// One change event on a subscription stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChange {
    pub actor_id: String,
    pub key: String,
    pub value: String,
    pub event_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnActorRequest {
    pub actor_id: String,
    #[serde(default)]
    pub initial_state: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnActorResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateActorRequest {
    pub actor_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateActorResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

/// Stateless facade over the store and the lifecycle registry
pub struct StateService {
    store: Arc<StateStore>,
    lifecycle: Arc<ActorLifecycle>,
}

impl StateService {
    pub fn new(store: Arc<StateStore>, lifecycle: Arc<ActorLifecycle>) -> Self {
        Self { store, lifecycle }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<ActorLifecycle> {
        &self.lifecycle
    }

    /// Read a value; missing or expired keys report `found: false`.
    pub fn get(&self, req: &GetRequest) -> GetResponse {
        match self.store.get(&req.actor_id, &req.key) {
            Some(value) => GetResponse { value, found: true },
            None => GetResponse {
                value: String::new(),
                found: false,
            },
        }
    }

    /// Write a value with no TTL; triggers the WAL append and notification.
    pub fn set(&self, req: &SetRequest) -> SetResponse {
        match self.store.set(&req.actor_id, &req.key, &req.value, None) {
            Ok(()) => SetResponse { success: true },
            Err(e) => {
                warn!(actor_id = %req.actor_id, key = %req.key, error = %e, "set failed");
                SetResponse { success: false }
            }
        }
    }

    /// Open a change stream for an actor. Rejects inactive actors.
    pub fn subscribe(&self, req: &SubscribeRequest) -> Result<SubscriptionStream> {
        if !self.lifecycle.is_actor_active(&req.actor_id) {
            return Err(Error::ActorNotActive {
                id: req.actor_id.clone(),
            });
        }

        // The stream owns one bounded inbound queue; a slow consumer loses
        // its oldest undelivered events rather than blocking the notifier.
        let queue = Arc::new(Mailbox::with_capacity(
            SUBSCRIBE_QUEUE_CAPACITY,
            OverflowPolicy::DropOldest,
        ));

        let sub_id = {
            let queue = Arc::clone(&queue);
            self.store.subscribe(
                &req.actor_id,
                Arc::new(move |actor_id: &str, key: &str, value: &str| {
                    let change = StateChange {
                        actor_id: actor_id.to_string(),
                        key: key.to_string(),
                        value: value.to_string(),
                        event_type: EVENT_TYPE_UPDATED.to_string(),
                    };
                    let _ = queue.push(change);
                }),
            )
        };

        debug!(actor_id = %req.actor_id, sub_id, "subscription stream opened");
        Ok(SubscriptionStream {
            actor_id: req.actor_id.clone(),
            sub_id,
            queue,
            store: Arc::clone(&self.store),
        })
    }

    /// Bring an actor to life, seeding its keyspace.
    pub fn spawn_actor(&self, req: &SpawnActorRequest) -> SpawnActorResponse {
        match self.lifecycle.spawn_actor(&req.actor_id, &req.initial_state) {
            Ok(()) => SpawnActorResponse {
                success: true,
                error_message: None,
            },
            Err(e) => SpawnActorResponse {
                success: false,
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Retire an actor; `force` clears its keyspace and subscriptions.
    pub fn terminate_actor(&self, req: &TerminateActorRequest) -> TerminateActorResponse {
        match self.lifecycle.terminate_actor(&req.actor_id, req.force) {
            Ok(()) => TerminateActorResponse {
                success: true,
                error_message: None,
            },
            Err(e) => TerminateActorResponse {
                success: false,
                error_message: Some(e.to_string()),
            },
        }
    }

    /// Ids of all live actors
    pub fn active_actors(&self) -> Vec<String> {
        self.lifecycle.active_actors()
    }
}

// =============================================================================
// Subscription stream
// =============================================================================

/// Outcome of one stream poll
#[derive(Debug, PartialEq, Eq)]
pub enum StreamPoll {
    /// A change event arrived
    Event(StateChange),
    /// The poll timeout elapsed; check for cancellation and poll again
    Idle,
    /// The stream was torn down
    Closed,
}

/// Server side of one Subscribe call: owns the inbound queue and the
/// registered callback. Dropping the stream unsubscribes; the callback is
/// guaranteed not to fire afterwards.
pub struct SubscriptionStream {
    actor_id: String,
    sub_id: SubscriptionId,
    queue: Arc<Mailbox<StateChange>>,
    store: Arc<StateStore>,
}

impl SubscriptionStream {
    /// Wait up to the poll timeout for the next event.
    ///
    /// Returning `Idle` on a timeout lets the transport loop observe client
    /// cancellation between polls.
    pub fn poll(&self) -> StreamPoll {
        match self
            .queue
            .wait_and_pop(Duration::from_millis(SUBSCRIBE_POLL_TIMEOUT_MS))
        {
            Ok(change) => StreamPoll::Event(change),
            Err(PopError::TimedOut) => StreamPoll::Idle,
            Err(PopError::Stopped) => StreamPoll::Closed,
        }
    }

    /// Wait up to `timeout` for the next event (test harnesses).
    pub fn poll_timeout(&self, timeout: Duration) -> StreamPoll {
        match self.queue.wait_and_pop(timeout) {
            Ok(change) => StreamPoll::Event(change),
            Err(PopError::TimedOut) => StreamPoll::Idle,
            Err(PopError::Stopped) => StreamPoll::Closed,
        }
    }

    /// The actor this stream watches
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Events buffered and not yet delivered
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.queue.stop();
        if !self.store.unsubscribe(&self.actor_id, self.sub_id) {
            // Already torn down with the actor (force terminate).
            debug!(actor_id = %self.actor_id, sub_id = self.sub_id, "stream already unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> StateService {
        let store = Arc::new(StateStore::in_memory());
        let lifecycle = Arc::new(ActorLifecycle::new(Arc::clone(&store)));
        StateService::new(store, lifecycle)
    }

    fn spawn(service: &StateService, actor_id: &str) {
        let resp = service.spawn_actor(&SpawnActorRequest {
            actor_id: actor_id.to_string(),
            initial_state: HashMap::new(),
        });
        assert!(resp.success);
    }

    #[test]
    fn get_reports_found_flag() {
        let service = service();
        spawn(&service, "a1");

        let resp = service.get(&GetRequest {
            actor_id: "a1".into(),
            key: "k".into(),
        });
        assert!(!resp.found);
        assert_eq!(resp.value, "");

        service.set(&SetRequest {
            actor_id: "a1".into(),
            key: "k".into(),
            value: "v1".into(),
        });

        let resp = service.get(&GetRequest {
            actor_id: "a1".into(),
            key: "k".into(),
        });
        assert!(resp.found);
        assert_eq!(resp.value, "v1");
    }

    #[test]
    fn set_with_invalid_actor_reports_failure_not_panic() {
        let service = service();
        let resp = service.set(&SetRequest {
            actor_id: "bad id!".into(),
            key: "k".into(),
            value: "v".into(),
        });
        assert!(!resp.success);
    }

    #[test]
    fn duplicate_spawn_reports_conflict() {
        let service = service();
        spawn(&service, "a1");

        let resp = service.spawn_actor(&SpawnActorRequest {
            actor_id: "a1".into(),
            initial_state: HashMap::new(),
        });
        assert!(!resp.success);
        assert!(resp.error_message.unwrap().contains("already active"));
    }

    #[test]
    fn terminate_unknown_actor_reports_failure() {
        let service = service();
        let resp = service.terminate_actor(&TerminateActorRequest {
            actor_id: "ghost".into(),
            force: false,
        });
        assert!(!resp.success);
        assert!(resp.error_message.is_some());
    }

    #[test]
    fn subscribe_rejects_inactive_actor() {
        let service = service();
        let result = service.subscribe(&SubscribeRequest {
            actor_id: "ghost".into(),
        });
        assert!(matches!(result, Err(Error::ActorNotActive { .. })));
    }

    #[test]
    fn subscription_stream_delivers_updates() {
        let service = service();
        spawn(&service, "a1");

        let stream = service
            .subscribe(&SubscribeRequest {
                actor_id: "a1".into(),
            })
            .unwrap();

        service.set(&SetRequest {
            actor_id: "a1".into(),
            key: "k".into(),
            value: "v".into(),
        });

        match stream.poll_timeout(Duration::from_secs(1)) {
            StreamPoll::Event(change) => {
                assert_eq!(
                    change,
                    StateChange {
                        actor_id: "a1".into(),
                        key: "k".into(),
                        value: "v".into(),
                        event_type: EVENT_TYPE_UPDATED.into(),
                    }
                );
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn dropping_stream_unsubscribes() {
        let service = service();
        spawn(&service, "a1");

        let stream = service
            .subscribe(&SubscribeRequest {
                actor_id: "a1".into(),
            })
            .unwrap();
        assert_eq!(service.store().subscriber_count("a1"), 1);

        drop(stream);
        assert_eq!(service.store().subscriber_count("a1"), 0);
    }

    #[test]
    fn idle_poll_observes_timeout() {
        let service = service();
        spawn(&service, "a1");
        let stream = service
            .subscribe(&SubscribeRequest {
                actor_id: "a1".into(),
            })
            .unwrap();

        assert_eq!(
            stream.poll_timeout(Duration::from_millis(30)),
            StreamPoll::Idle
        );
    }
}
