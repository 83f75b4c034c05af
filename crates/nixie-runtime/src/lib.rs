//! Actor runtime for Nixie: lifecycle registry, scheduler, and the typed
//! actor abstraction built on the mailbox/pool substrate.

pub mod actor;
pub mod lifecycle;
pub mod scheduler;

pub use actor::{Actor, ActorBehavior, ActorOptions, ReplyHandle, STATE_KEY};
pub use lifecycle::{ActorLifecycle, LifecycleHook};
pub use scheduler::{Scheduler, WorkItem, WorkMailbox};
