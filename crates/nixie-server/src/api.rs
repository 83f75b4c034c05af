//! HTTP/JSON adapter over the service facade.
//!
//! Routes map one-to-one onto the five verbs; Subscribe is served as an
//! SSE stream. Handlers that hit the WAL run on the blocking pool so file
//! flushes never park an async worker. The subscribe bridge drains the
//! blocking stream with its poll timeout and exits when the client side of
//! the channel closes, which drops the stream and removes the callback.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::service::{
    GetRequest, GetResponse, SetRequest, SetResponse, SpawnActorRequest, SpawnActorResponse,
    StateService, StreamPoll, SubscribeRequest, TerminateActorRequest, TerminateActorResponse,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StateService>,
}

/// Build the router over a service instance.
pub fn router(service: Arc<StateService>) -> Router {
    let state = AppState { service };
    Router::new()
        .route("/health", get(health))
        .route("/v1/actors", get(list_actors).post(spawn_actor))
        .route("/v1/actors/:actor_id", delete(terminate_actor))
        .route("/v1/actors/:actor_id/state/:key", get(get_value).put(set_value))
        .route("/v1/actors/:actor_id/events", get(subscribe_events))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_actors(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.service.active_actors())
}

async fn get_value(
    State(app): State<AppState>,
    Path((actor_id, key)): Path<(String, String)>,
) -> Json<GetResponse> {
    Json(app.service.get(&GetRequest { actor_id, key }))
}

#[derive(Debug, Deserialize)]
struct SetValueBody {
    value: String,
}

async fn set_value(
    State(app): State<AppState>,
    Path((actor_id, key)): Path<(String, String)>,
    Json(body): Json<SetValueBody>,
) -> Json<SetResponse> {
    // Write-ahead mode flushes a file before returning; keep that off the
    // async workers.
    let response = tokio::task::spawn_blocking(move || {
        app.service.set(&SetRequest {
            actor_id,
            key,
            value: body.value,
        })
    })
    .await
    .unwrap_or(SetResponse { success: false });
    Json(response)
}

async fn spawn_actor(
    State(app): State<AppState>,
    Json(request): Json<SpawnActorRequest>,
) -> Json<SpawnActorResponse> {
    let response =
        tokio::task::spawn_blocking(move || app.service.spawn_actor(&request))
            .await
            .unwrap_or(SpawnActorResponse {
                success: false,
                error_message: Some("spawn task failed".into()),
            });
    Json(response)
}

#[derive(Debug, Deserialize)]
struct TerminateParams {
    #[serde(default)]
    force: bool,
}

async fn terminate_actor(
    State(app): State<AppState>,
    Path(actor_id): Path<String>,
    Query(params): Query<TerminateParams>,
) -> Json<TerminateActorResponse> {
    Json(app.service.terminate_actor(&TerminateActorRequest {
        actor_id,
        force: params.force,
    }))
}

async fn subscribe_events(
    State(app): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let stream = app
        .service
        .subscribe(&SubscribeRequest { actor_id })
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let (tx, rx) = tokio::sync::mpsc::channel(64);

    tokio::task::spawn_blocking(move || {
        loop {
            match stream.poll() {
                StreamPoll::Event(change) => {
                    if tx.blocking_send(change).is_err() {
                        break;
                    }
                }
                StreamPoll::Idle => {
                    if tx.is_closed() {
                        break;
                    }
                }
                StreamPoll::Closed => break,
            }
        }
        debug!("subscribe bridge exiting");
        // `stream` drops here, removing the callback.
    });

    let events = ReceiverStream::new(rx).map(|change| {
        let event = Event::default().event(change.event_type.clone());
        Ok::<_, Infallible>(event.json_data(&change).unwrap_or_default())
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
