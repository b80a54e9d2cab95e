use crate::subscription::Caller;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("missing session token")]
    MissingToken,

    #[error("unknown session token")]
    InvalidToken,

    #[error("session expired")]
    Expired,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

struct Session {
    caller: Caller,
    expires_at: DateTime<Utc>,
}

/// Gate in front of the dashboard and control submission.
///
/// Checks a single operator credential and hands out opaque bearer tokens.
/// The services behind it only ever see the resulting `Caller`.
pub struct AuthGate {
    username: String,
    password: String,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AuthGate {
    pub fn new(username: impl Into<String>, password: impl Into<String>, ttl: Duration) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, AuthError> {
        if credentials.username != self.username || credentials.password != self.password {
            warn!("Rejected login for {}", credentials.username);
            return Err(AuthError::InvalidCredentials);
        }

        let token = Uuid::new_v4().simple().to_string();
        let expires_at = session_expiry(Utc::now(), self.ttl);
        let caller = Caller::new(format!("{}@{}", credentials.username, &token[..8]));

        let mut sessions = self.sessions();
        sessions.retain(|_, s| s.expires_at > Utc::now());
        sessions.insert(token.clone(), Session { caller, expires_at });
        info!("Operator {} logged in", credentials.username);

        Ok(SessionToken { token, expires_at })
    }

    pub fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        let mut sessions = self.sessions();
        let session = sessions.get(token).ok_or(AuthError::InvalidToken)?;

        if session.expires_at <= Utc::now() {
            sessions.remove(token);
            debug!("Session expired");
            return Err(AuthError::Expired);
        }
        Ok(session.caller.clone())
    }

    /// Ends a session. Returns false when the token was not active.
    pub fn revoke(&self, token: &str) -> bool {
        let removed = self.sessions().remove(token);
        if let Some(session) = &removed {
            info!("Session {} logged out", session.caller);
        }
        removed.is_some()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Expiry for a session opened at `now`, saturating at the end of time.
pub fn session_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
