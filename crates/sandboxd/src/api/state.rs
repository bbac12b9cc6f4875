//! Shared application state.

use crate::agent::AgentService;
use crate::auth::AuthState;
use crate::runner::RunnerClient;
use crate::session::SessionService;
use crate::terminal::TerminalDeps;

/// Everything the API handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionService,
    pub agent: AgentService,
    pub auth: AuthState,
    pub terminal: TerminalDeps,
    pub runner: RunnerClient,
    /// Public base domain sessions are exposed under.
    pub domain: String,
}
