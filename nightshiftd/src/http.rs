//! The daemon's HTTP surface: run submission and SSE event streaming.
//!
//! Deploy, listing, and authentication belong to the outer platform; this
//! process only accepts runs for agents declared in its configuration and
//! streams their event buffers back out.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use machine::{AgentDescriptor, ControlEvent, RunRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::events::EventBuffer;
use crate::pool::VmPool;
use crate::run::{self, CompletionHook};

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<VmPool>,
    pub buffer: Arc<EventBuffer>,
    pub agents: Arc<HashMap<String, AgentDescriptor>>,
    pub hook: Arc<dyn CompletionHook>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents/{agent_id}/runs", post(create_run))
        .route("/api/runs/{run_id}/events", get(stream_run_events))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct CreateRunBody {
    #[serde(default)]
    prompt: String,
    /// Per-run secrets; forwarded to the guest, never baked into the image.
    #[serde(default)]
    env: BTreeMap<String, String>,
}

async fn create_run(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<CreateRunBody>,
) -> Response {
    if body.prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "prompt is required"})),
        )
            .into_response();
    }
    let Some(descriptor) = state.agents.get(&agent_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown agent: {agent_id}")})),
        )
            .into_response();
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let workspace = descriptor
        .workspace_source
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    state
        .buffer
        .publish_typed(&run_id, ControlEvent::Started { workspace });

    let request = RunRequest {
        run_id: run_id.clone(),
        agent_id,
        prompt: body.prompt,
        runtime_env: body.env,
    };
    let descriptor = descriptor.clone();
    let pool = Arc::clone(&state.pool);
    let buffer = Arc::clone(&state.buffer);
    let hook = Arc::clone(&state.hook);
    tokio::spawn(async move {
        let error = run::execute(&pool, &buffer, &descriptor, &request).await;
        hook.run_complete(&request.run_id, error.as_deref()).await;
    });

    info!(run_id = %run_id, "run accepted");
    (
        StatusCode::ACCEPTED,
        Json(json!({"id": run_id, "status": "started"})),
    )
        .into_response()
}

/// Replay-plus-live-tail SSE stream for one run. When the stream terminates
/// (first terminal event, or buffer cleanup) the run's records are reaped;
/// an early disconnect leaves them for the next subscriber.
async fn stream_run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    if !state.buffer.known(&run_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "run not found"})),
        )
            .into_response();
    }

    let buffer = Arc::clone(&state.buffer);
    let stream = async_stream::stream! {
        let frames = Arc::clone(&buffer).stream_sse(run_id.clone());
        futures_util::pin_mut!(frames);
        while let Some((event_type, data)) = frames.next().await {
            yield Ok::<Event, Infallible>(Event::default().event(event_type).data(data));
        }
        buffer.reap(&run_id);
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
