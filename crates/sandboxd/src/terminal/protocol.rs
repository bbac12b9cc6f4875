//! Terminal WebSocket message types.
//!
//! Everything is JSON text frames; terminal bytes travel base64-wrapped
//! inside `data` messages, never as raw binary frames.

use serde::{Deserialize, Serialize};

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Messages the browser sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    Auth {
        password: String,
        #[serde(default = "default_cols")]
        cols: u16,
        #[serde(default = "default_rows")]
        rows: u16,
    },
    Data {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Pong,
    Authenticated,
    Data { data: String },
    Error { message: String },
    Disconnect,
}
