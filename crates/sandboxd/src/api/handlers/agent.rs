//! Agent endpoints: feature toggle, key management, task pipeline.

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::runner::AgentKind;

#[derive(Debug, Deserialize)]
pub struct AgentToggleBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeysBody {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskBody {
    pub agent: AgentKind,
    pub prompt: String,
    pub working_dir: Option<String>,
}

pub async fn toggle(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(body): Json<AgentToggleBody>,
) -> Result<Json<Value>, ApiError> {
    state.agent.set_enabled(&username, body.enabled).await?;
    Ok(Json(json!({ "enabled": body.enabled })))
}

pub async fn set_keys(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(body): Json<ApiKeysBody>,
) -> Result<Json<Value>, ApiError> {
    let keys = state
        .agent
        .set_api_keys(
            &username,
            body.anthropic_api_key.as_deref(),
            body.openai_api_key.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "keys": keys })))
}

pub async fn key_status(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let keys = state.agent.key_status(&username).await?;
    Ok(Json(json!({ "keys": keys })))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tasks = state.agent.list(&username).await?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn submit_task(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(body): Json<SubmitTaskBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.prompt.trim().is_empty() {
        return Err(ApiError::Validation("prompt must not be empty".to_string()));
    }

    let task = state
        .agent
        .submit(&username, body.agent, &body.prompt, body.working_dir)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path((username, task_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let task = state.agent.get(&username, &task_id).await?;
    Ok(Json(json!({ "task": task })))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path((username, task_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let task = state.agent.cancel(&username, &task_id).await?;
    Ok(Json(json!({ "task": task })))
}

/// Proxy the runner's SSE stream for a task. The upstream body is forwarded
/// as-is; buffering would defeat the point of the stream.
pub async fn stream_task(
    State(state): State<AppState>,
    Path((username, task_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (port, runner_id) = state.agent.stream_target(&username, &task_id).await?;

    let upstream = state
        .runner
        .stream(port, &runner_id)
        .await
        .map_err(|e| ApiError::Upstream(format!("{e:#}")))?;

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ApiError::Internal(e.into()))
}
