//! Error types for pairgate.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors surfaced by a pairing attempt.
///
/// Each session produces at most one of these, through its settlement guard.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PairingError {
    #[error("Invalid phone number: {reason}")]
    InvalidPhoneNumber { reason: String },

    #[error("Session {session_id}: pairing code request failed: {reason}")]
    CodeRequest { session_id: String, reason: String },

    #[error("Session {session_id}: connection closed: {reason}")]
    ConnectionClosed { session_id: String, reason: String },

    #[error("Session {session_id} timed out after {timeout:?}")]
    Timeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("Pairing gave up after {attempts} attempts, last failure: {last_reason}")]
    RetriesExhausted { attempts: u32, last_reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Filesystem error: {0}")]
    Filesystem(#[from] FilesystemError),

    #[error("Session {session_id} ended without an outcome: {reason}")]
    Internal { session_id: String, reason: String },
}

impl PairingError {
    /// Taxonomy label used in logs and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PairingError::InvalidPhoneNumber { .. } => "validation",
            PairingError::CodeRequest { .. }
            | PairingError::ConnectionClosed { .. }
            | PairingError::Transport(_) => "transport",
            PairingError::Timeout { .. } => "timeout",
            PairingError::RetriesExhausted { .. } => "retries_exhausted",
            PairingError::Filesystem(_) => "filesystem",
            PairingError::Internal { .. } => "internal",
        }
    }

    /// Whether a keep-alive request should start a fresh attempt after this error.
    pub fn is_restartable(&self) -> bool {
        matches!(self, PairingError::ConnectionClosed { .. })
    }
}

/// Messaging transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to messaging transport: {reason}")]
    ConnectFailed { reason: String },

    #[error("Request {op} failed: {reason}")]
    RequestFailed { op: String, reason: String },

    #[error("Request {op} timed out after {timeout:?}")]
    RequestTimeout { op: String, timeout: Duration },

    #[error("Failed to send message to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Transport already closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Auth state error at {path}: {reason}")]
    AuthState { path: PathBuf, reason: String },
}

/// Credential backend errors.
///
/// Upload failures never leave `CredentialStore::upload_bundle`; these only
/// surface from downloads.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Credential backend is not configured")]
    NotConfigured,

    #[error("Invalid session id {id}: expected \"{prefix}\" and an alphanumeric suffix")]
    InvalidSessionId { id: String, prefix: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No session data received for {id}")]
    MissingData { id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session directory errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FilesystemError {
    #[error("Failed to create session directory {path}: {reason}")]
    CreateDir { path: PathBuf, reason: String },

    #[error("Failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server failed to start on {addr}: {reason}")]
    StartupFailed { addr: String, reason: String },
}
