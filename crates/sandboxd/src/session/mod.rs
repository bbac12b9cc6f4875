//! Sandbox session lifecycle: models, persistence and orchestration.

mod models;
mod repository;
mod service;

pub use models::{NewSession, Session, SessionStatus};
pub use repository::SessionRepository;
pub use service::{CreateSessionParams, SessionError, SessionService};

/// Username policy: 2-30 characters, ASCII alphanumeric only. The username
/// becomes an OS account, a container name fragment and a DNS label, so the
/// intersection of all three charsets applies.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.len() < 2 || username.len() > 30 {
        return Err("username must be 2-30 characters".to_string());
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("username must be alphanumeric".to_string());
    }
    Ok(())
}

/// Password policy for the sandbox OS account.
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < 6 {
        return Err("password must be at least 6 characters".to_string());
    }
    Ok(())
}
