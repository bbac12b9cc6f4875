//! Browser terminal: a WebSocket to SSH shell bridge.
//!
//! Authentication happens in-band with the first `auth` message because
//! browsers cannot attach headers to WebSocket upgrades. The SSH server
//! inside the sandbox is the actual password authority; this side only
//! checks that the session exists and is running before dialing it.

mod bridge;
mod protocol;

pub use bridge::{BridgeError, SshShell};
pub use protocol::{ClientMessage, ServerMessage};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use log::{debug, warn};
use russh::ChannelMsg;

use crate::session::{SessionRepository, SessionStatus};

/// Live terminal connections, keyed by connection id rather than username so
/// one user can hold several independent terminals.
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    next_id: AtomicU64,
    active: DashMap<u64, String>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, username: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(id, username.to_string());
        id
    }

    fn unregister(&self, id: u64) {
        self.active.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// What the socket loop needs from the rest of the daemon.
#[derive(Clone)]
pub struct TerminalDeps {
    pub sessions: SessionRepository,
    pub registry: Arc<TerminalRegistry>,
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let _ = send(
        socket,
        &ServerMessage::Error {
            message: message.to_string(),
        },
    )
    .await;
}

/// Drive one terminal connection to completion. All per-connection state
/// dies with this future.
pub async fn serve(mut socket: WebSocket, username: String, deps: TerminalDeps) {
    let Some(shell) = authenticate(&mut socket, &username, &deps).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let connection_id = deps.registry.register(&username);
    debug!("terminal {connection_id} opened for {username}");

    bridge_io(&mut socket, shell).await;

    deps.registry.unregister(connection_id);
    debug!("terminal {connection_id} closed for {username}");
    let _ = socket.send(Message::Close(None)).await;
}

/// Pre-auth phase: answer pings, reject everything but `auth`, and turn a
/// valid `auth` into a live SSH shell.
async fn authenticate(
    socket: &mut WebSocket,
    username: &str,
    deps: &TerminalDeps,
) -> Option<SshShell> {
    loop {
        let frame = socket.recv().await?;
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };

        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(_) => {
                send_error(socket, "malformed message").await;
                continue;
            }
        };

        match message {
            ClientMessage::Ping => {
                if !send(socket, &ServerMessage::Pong).await {
                    return None;
                }
            }
            ClientMessage::Auth {
                password,
                cols,
                rows,
            } => {
                let session = match deps.sessions.get(username).await {
                    Ok(Some(session)) => session,
                    Ok(None) => {
                        send_error(socket, "session not found").await;
                        return None;
                    }
                    Err(e) => {
                        warn!("terminal session lookup for {username} failed: {e:#}");
                        send_error(socket, "internal error").await;
                        return None;
                    }
                };
                if session.status != SessionStatus::Running {
                    send_error(socket, "session is not running").await;
                    return None;
                }

                match SshShell::open(session.ports().ssh, username, &password, cols, rows).await
                {
                    Ok(shell) => {
                        let _ = deps.sessions.touch(username).await;
                        if !send(socket, &ServerMessage::Authenticated).await {
                            shell.close().await;
                            return None;
                        }
                        return Some(shell);
                    }
                    Err(e) => {
                        warn!("terminal ssh connect for {username} failed: {e}");
                        send_error(socket, &e.to_string()).await;
                        return None;
                    }
                }
            }
            ClientMessage::Data { .. } | ClientMessage::Resize { .. } => {
                send_error(socket, "not authenticated").await;
            }
        }
    }
}

/// Post-auth phase: shuttle bytes both ways until either side hangs up.
async fn bridge_io(socket: &mut WebSocket, mut shell: SshShell) {
    loop {
        tokio::select! {
            frame = socket.recv() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => {
                        if !send(socket, &ServerMessage::Pong).await {
                            break;
                        }
                    }
                    Ok(ClientMessage::Data { data }) => {
                        let bytes = match BASE64.decode(data.as_bytes()) {
                            Ok(bytes) => bytes,
                            Err(_) => {
                                send_error(socket, "invalid base64 payload").await;
                                continue;
                            }
                        };
                        if shell.write(&bytes).await.is_err() {
                            let _ = send(socket, &ServerMessage::Disconnect).await;
                            break;
                        }
                    }
                    Ok(ClientMessage::Resize { cols, rows }) => {
                        if let Err(e) = shell.resize(cols, rows).await {
                            debug!("terminal resize failed: {e}");
                        }
                    }
                    Ok(ClientMessage::Auth { .. }) => {
                        send_error(socket, "already authenticated").await;
                    }
                    Err(_) => {
                        send_error(socket, "malformed message").await;
                    }
                }
            }
            ssh_msg = shell.channel.wait() => {
                match ssh_msg {
                    Some(ChannelMsg::Data { data }) => {
                        let encoded = BASE64.encode(&data[..]);
                        if !send(socket, &ServerMessage::Data { data: encoded }).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        let encoded = BASE64.encode(&data[..]);
                        if !send(socket, &ServerMessage::Data { data: encoded }).await {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        let _ = send(socket, &ServerMessage::Disconnect).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    shell.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_are_unique_per_connection() {
        let registry = TerminalRegistry::new();

        let a = registry.register("alice");
        let b = registry.register("alice");
        let c = registry.register("bob");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(registry.active_count(), 3);

        registry.unregister(b);
        assert_eq!(registry.active_count(), 2);

        // Closing one of a user's terminals leaves the others alone.
        assert!(registry.active.contains_key(&a));
        assert!(registry.active.contains_key(&c));
    }
}
