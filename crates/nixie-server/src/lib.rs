//! Nixie server: the service facade plus its HTTP/SSE transport adapter.

pub mod api;
pub mod service;

pub use service::{
    GetRequest, GetResponse, SetRequest, SetResponse, SpawnActorRequest, SpawnActorResponse,
    StateChange, StateService, StreamPoll, SubscribeRequest, SubscriptionStream,
    TerminateActorRequest, TerminateActorResponse, EVENT_TYPE_UPDATED,
};
