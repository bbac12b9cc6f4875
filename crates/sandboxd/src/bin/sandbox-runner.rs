//! In-container agent runner.
//!
//! Small HTTP service that runs inside each sandbox, spawns coding-agent
//! CLIs on behalf of the daemon, and streams their output as SSE. It binds
//! all interfaces because the container's network namespace only admits
//! traffic through the published agent port.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use clap::Parser;
use futures::stream::{Stream, StreamExt};
use log::{info, warn};
use tokio::net::TcpListener;

use sandboxd::runner::{
    CreateTaskRequest, HealthResponse, TaskEnvelope, TaskListEnvelope, TaskRegistry,
    subscriber_stream,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Sandbox agent task runner.")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9090)]
    port: u16,
    /// Run agent commands as this user instead of the current one
    #[arg(long)]
    user: Option<String>,
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn try_main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init()
        .ok();

    let cli = Cli::parse();
    let user = cli.user.or_else(|| std::env::var("SANDBOX_USER").ok());
    if let Some(ref user) = user {
        info!("running agent commands as {user}");
    }

    let registry = Arc::new(TaskRegistry::new(user));

    let app = Router::new()
        .route("/health", get(health))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/tasks/{id}/stream", get(stream_task))
        .with_state(registry);

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("sandbox-runner listening on {addr}");

    axum::serve(listener, app).await.context("serving HTTP")
}

async fn health(State(registry): State<Arc<TaskRegistry>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        tasks: registry.len(),
    })
}

async fn list_tasks(State(registry): State<Arc<TaskRegistry>>) -> Json<TaskListEnvelope> {
    Json(TaskListEnvelope {
        tasks: registry.list(),
    })
}

async fn create_task(
    State(registry): State<Arc<TaskRegistry>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskEnvelope>), (StatusCode, String)> {
    if req.prompt.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "prompt must not be empty".to_string(),
        ));
    }

    match registry.create(&req) {
        Ok(task) => Ok((StatusCode::CREATED, Json(TaskEnvelope { task }))),
        Err(err) => {
            warn!("spawning task: {err:#}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))
        }
    }
}

async fn get_task(
    State(registry): State<Arc<TaskRegistry>>,
    Path(id): Path<String>,
) -> Result<Json<TaskEnvelope>, StatusCode> {
    registry
        .get(&id)
        .map(|task| Json(TaskEnvelope { task }))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn cancel_task(
    State(registry): State<Arc<TaskRegistry>>,
    Path(id): Path<String>,
) -> Result<Json<TaskEnvelope>, StatusCode> {
    registry
        .cancel(&id)
        .map(|task| Json(TaskEnvelope { task }))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Stream a task's output. Buffered events replay first so late subscribers
/// see the full history, then live events follow until `done`. A task that
/// is already terminal gets the replay alone and the stream closes.
async fn stream_task(
    State(registry): State<Arc<TaskRegistry>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    let (initial, rx) = registry.subscribe(&id).ok_or(StatusCode::NOT_FOUND)?;

    let events = subscriber_stream(initial, rx).map(|event| Event::default().json_data(&event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
