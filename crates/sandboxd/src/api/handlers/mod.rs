//! HTTP handlers.

pub mod agent;
pub mod sessions;

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, Path, State, WebSocketUpgrade},
    http::request::Parts,
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::AuthError;
use crate::terminal;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub password: String,
}

/// Peer address for login-lockout bookkeeping. Reads the connect info that
/// `into_make_service_with_connect_info` stores in request extensions and is
/// `None` when the router is driven without it, as in tests.
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn login(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, AuthError> {
    let client = addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let token = state.auth.login(&client, &body.password)?;
    Ok(Json(json!({ "token": token })))
}

/// Terminal WebSocket. Authentication is in-band (the first `auth` frame),
/// so this route sits outside the bearer-token middleware.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(username): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let deps = state.terminal.clone();
    ws.on_upgrade(move |socket| terminal::serve(socket, username, deps))
}
