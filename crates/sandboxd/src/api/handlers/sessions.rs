//! Session endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::exposure::{SSH_PREFIX, exposure_hostname};
use crate::session::{CreateSessionParams, Session, validate_password, validate_username};

const MEMORY_LIMIT_RANGE: std::ops::RangeInclusive<i64> = 128..=4096;
const CPU_LIMIT_RANGE: std::ops::RangeInclusive<f64> = 0.1..=4.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub username: String,
    pub password: String,
    pub memory_limit: Option<i64>,
    pub cpu_limit: Option<f64>,
    pub ttl_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session: Session,
    pub ssh_command: String,
}

fn ssh_command(state: &AppState, session: &Session) -> String {
    let host = exposure_hostname(&state.domain, &session.username, SSH_PREFIX);
    format!("ssh -p {} {}@{host}", session.ssh_port, session.username)
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let sessions = state.sessions.list().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    validate_username(&body.username).map_err(ApiError::Validation)?;
    validate_password(&body.password).map_err(ApiError::Validation)?;
    if let Some(memory) = body.memory_limit
        && !MEMORY_LIMIT_RANGE.contains(&memory)
    {
        return Err(ApiError::Validation(
            "memory limit must be 128-4096 MB".to_string(),
        ));
    }
    if let Some(cpu) = body.cpu_limit
        && !CPU_LIMIT_RANGE.contains(&cpu)
    {
        return Err(ApiError::Validation(
            "cpu limit must be 0.1-4.0 cores".to_string(),
        ));
    }

    let session = state
        .sessions
        .create(CreateSessionParams {
            username: body.username,
            password: body.password,
            memory_limit: body.memory_limit,
            cpu_limit: body.cpu_limit,
            ttl_hours: body.ttl_hours,
        })
        .await?;

    let ssh_command = ssh_command(&state, &session);
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session,
            ssh_command,
        }),
    ))
}

pub async fn get(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.get(&username).await?;
    let container_status = state.sessions.status(&username).await?;
    let ssh_command = ssh_command(&state, &session);
    Ok(Json(json!({
        "session": session,
        "containerStatus": container_status,
        "sshCommand": ssh_command,
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.delete(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restart(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.restart(&username).await?;
    Ok(Json(json!({ "session": session })))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stats = state.sessions.stats(&username).await?;
    Ok(Json(json!({ "stats": stats })))
}
