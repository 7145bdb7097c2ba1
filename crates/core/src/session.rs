use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed credential token: {0}")]
    MalformedToken(String),

    #[error("credential token carries no user id")]
    MissingUserId,

    #[error("I/O error accessing credentials: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated user, derived from the stored credential token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: UserId,
}

impl SessionIdentity {
    /// Reads `userId` from the payload segment of a `header.payload.signature` token.
    pub fn from_token(token: &str) -> Result<Self, SessionError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next()) {
            (Some(_), Some(payload)) if !payload.is_empty() => payload,
            _ => {
                return Err(SessionError::MalformedToken(
                    "expected header.payload.signature".to_string(),
                ));
            }
        };

        let trimmed = payload.trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed)
            .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
            .map_err(|e| SessionError::MalformedToken(e.to_string()))?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| SessionError::MalformedToken(e.to_string()))?;

        let user_id = match claims.get("userId") {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .ok_or(SessionError::MissingUserId)?;

        Ok(Self {
            user_id: UserId(user_id),
        })
    }

    /// Resolves the identity from a store, or `None` when the session is inert.
    pub fn resolve(store: &dyn CredentialStore) -> Option<Self> {
        let token = store.token()?;
        match Self::from_token(&token) {
            Ok(identity) => Some(identity),
            Err(error) => {
                debug!(error = %error, "stored token does not yield an identity");
                None
            }
        }
    }
}

/// Source of the bearer token. Implementations must read fresh on every call
/// so a token refreshed between reconnects is picked up.
pub trait CredentialStore: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Token kept in a file, trimmed of surrounding whitespace.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn store(&self, token: &str) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn token(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let token = contents.trim();
        (!token.is_empty()).then(|| token.to_string())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    token: RwLock<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
