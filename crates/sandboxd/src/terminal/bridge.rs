//! SSH shell channel for the terminal bridge.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Msg};
use russh::{Channel, Disconnect};
use thiserror::Error;

/// Deadline for the TCP connect plus SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const TERM: &str = "xterm-256color";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("ssh connection timed out")]
    Timeout,

    #[error("ssh authentication failed")]
    AuthFailed,

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    // The sandbox regenerates its host key on every rebuild and only
    // listens on loopback, so there is nothing to pin.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live interactive shell inside a sandbox.
pub struct SshShell {
    handle: client::Handle<AcceptingHandler>,
    pub channel: Channel<Msg>,
}

impl SshShell {
    /// Connect to the sandbox's SSH port on loopback, authenticate with the
    /// session password and open a sized PTY running the login shell.
    pub async fn open(
        port: u16,
        username: &str,
        password: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Self, BridgeError> {
        let config = Arc::new(client::Config::default());

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, ("127.0.0.1", port), AcceptingHandler),
        )
        .await
        .map_err(|_| BridgeError::Timeout)??;

        let auth = handle.authenticate_password(username, password).await?;
        if !auth.success() {
            return Err(BridgeError::AuthFailed);
        }

        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(false, TERM, u32::from(cols), u32::from(rows), 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;

        Ok(Self { handle, channel })
    }

    /// Propagate a terminal resize to the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.channel
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await?;
        Ok(())
    }

    /// Write keyboard input to the shell.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        self.channel.data(bytes).await?;
        Ok(())
    }

    /// Tear the connection down. Safe to call on an already-dead link.
    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "terminal closed", "en")
            .await;
    }
}
