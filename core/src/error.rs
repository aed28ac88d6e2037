/// Error types for the bridge core
use crate::ids::IdError;
use thiserror::Error;

/// Remote error codes that mean the account needs to be logged in again.
const FATAL_API_CODES: &[&str] = &[
    "UNAUTHORIZED",
    "INVALID_API_KEY",
    "USER_DEACTIVATED",
    "REALM_DEACTIVATED",
];

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Zulip API error {code}: {msg}")]
    Api { code: String, msg: String },

    #[error("Event queue expired: {0}")]
    QueueExpired(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid identifier: {0}")]
    Id(#[from] IdError),

    #[error("Failed to resolve identity of user {user_id}: {reason}")]
    Resolve { user_id: u64, reason: String },

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Login error: {0}")]
    Login(String),
}

impl BridgeError {
    /// The server no longer knows our event queue and it must be registered again.
    pub fn is_queue_expired(&self) -> bool {
        matches!(self, BridgeError::QueueExpired(_))
    }

    /// Errors that polling can't recover from without new credentials.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Unauthorized(_) => true,
            BridgeError::Api { code, .. } => FATAL_API_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
