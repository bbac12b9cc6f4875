//! Admin authentication: password login with lockout, JWT session tokens.

mod error;
mod middleware;

pub use error::AuthError;
pub use middleware::auth_middleware;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::warn;
use serde::{Deserialize, Serialize};

/// Failed attempts from one client before lockout.
const MAX_FAILURES: u32 = 5;

/// How long a locked-out client waits.
const LOCKOUT: Duration = Duration::from_secs(15 * 60);

/// Token lifetime.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// JWT claims for the admin session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Default)]
struct LoginAttempts {
    failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// Shared authentication state.
#[derive(Clone)]
pub struct AuthState {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    admin_password_hash: Arc<String>,
    /// Failed-login bookkeeping, keyed by client address.
    attempts: Arc<DashMap<String, LoginAttempts>>,
}

impl AuthState {
    pub fn new(jwt_secret: &str, admin_password_hash: String) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(jwt_secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(jwt_secret.as_bytes())),
            admin_password_hash: Arc::new(admin_password_hash),
            attempts: Arc::new(DashMap::new()),
        }
    }

    /// Verify the admin password and issue a token. `client` identifies the
    /// caller for lockout purposes, normally the peer address.
    pub fn login(&self, client: &str, password: &str) -> Result<String, AuthError> {
        {
            let entry = self.attempts.get(client);
            if let Some(entry) = entry
                && let Some(until) = entry.locked_until
                && until > Utc::now()
            {
                return Err(AuthError::LockedOut);
            }
        }

        let valid = bcrypt::verify(password, &self.admin_password_hash)
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        if !valid {
            let mut entry = self.attempts.entry(client.to_string()).or_default();
            entry.failures += 1;
            if entry.failures >= MAX_FAILURES {
                warn!("client {client} locked out after {} failed logins", entry.failures);
                entry.locked_until = Some(
                    Utc::now()
                        + chrono::Duration::from_std(LOCKOUT)
                            .map_err(|e| AuthError::Internal(e.to_string()))?,
                );
                entry.failures = 0;
            }
            return Err(AuthError::InvalidCredentials);
        }

        self.attempts.remove(client);
        self.issue_token()
    }

    fn issue_token(&self) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: "admin".to_string(),
            role: "admin".to_string(),
            exp: (now + chrono::Duration::from_std(TOKEN_TTL).expect("constant fits")).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AuthState {
        let hash = bcrypt::hash("admin-password", 4).unwrap();
        AuthState::new("test-secret", hash)
    }

    #[test]
    fn test_login_issues_valid_token() {
        let auth = state();
        let token = auth.login("127.0.0.1", "admin-password").unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert_eq!(claims.role, "admin");
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = state();
        assert!(matches!(
            auth.login("127.0.0.1", "nope"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_lockout_after_repeated_failures() {
        let auth = state();
        for _ in 0..5 {
            let _ = auth.login("10.0.0.1", "wrong");
        }
        assert!(matches!(
            auth.login("10.0.0.1", "admin-password"),
            Err(AuthError::LockedOut)
        ));

        // Other clients are unaffected.
        assert!(auth.login("10.0.0.2", "admin-password").is_ok());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let auth = state();
        for _ in 0..4 {
            let _ = auth.login("10.0.0.1", "wrong");
        }
        auth.login("10.0.0.1", "admin-password").unwrap();
        for _ in 0..4 {
            let _ = auth.login("10.0.0.1", "wrong");
        }
        // Still under the threshold after the reset.
        assert!(auth.login("10.0.0.1", "admin-password").is_ok());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let auth = state();
        let token = auth.login("127.0.0.1", "admin-password").unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(auth.validate_token(&tampered).is_err());

        let other = AuthState::new("other-secret", bcrypt::hash("x", 4).unwrap());
        assert!(other.validate_token(&token).is_err());
    }
}
