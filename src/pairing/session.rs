//! Pairing session model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PairingError;
use crate::transport::Address;

/// Shortest digit string accepted as a phone number (country code included).
const MIN_PHONE_DIGITS: usize = 7;

/// Longest digit string accepted (E.164 allows 15).
const MAX_PHONE_DIGITS: usize = 15;

/// A phone number reduced to its digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneNumber {
    digits: String,
}

impl PhoneNumber {
    /// Normalize `raw` to digits only and check its length.
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        if raw.trim().is_empty() {
            return Err(PairingError::InvalidPhoneNumber {
                reason: "phone number is required".to_string(),
            });
        }

        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
            return Err(PairingError::InvalidPhoneNumber {
                reason: format!(
                    "expected {}-{} digits including country code, got {}",
                    MIN_PHONE_DIGITS,
                    MAX_PHONE_DIGITS,
                    digits.len()
                ),
            });
        }

        Ok(Self { digits })
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }

    /// Messaging address derived from this number.
    pub fn address(&self) -> Address {
        Address::for_phone_digits(&self.digits)
    }
}

impl std::fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.digits)
    }
}

/// Lifecycle state of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    AuthLoading,
    CodeRequested,
    AwaitingConnection,
    OpenProcessing,
    Reconnecting,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Init, AuthLoading) => true,
            (AuthLoading, CodeRequested | AwaitingConnection) => true,
            (CodeRequested, AwaitingConnection) => true,
            (AwaitingConnection, OpenProcessing | Reconnecting) => true,
            (OpenProcessing, Done) => true,
            (Reconnecting, Init) => true,
            // Any live state can fail (transport error, timeout, close).
            (s, Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::AuthLoading => "auth_loading",
            SessionState::CodeRequested => "code_requested",
            SessionState::AwaitingConnection => "awaiting_connection",
            SessionState::OpenProcessing => "open_processing",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One pairing attempt.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub id: String,
    pub phone: PhoneNumber,
    /// Directory owned exclusively by this session.
    pub auth_dir: PathBuf,
    pub state: SessionState,
    pub deadline: DateTime<Utc>,
    pub keep_alive: bool,
    /// 1-based attempt number within its pairing request.
    pub attempt: u32,
}

impl PairingSession {
    /// Move to `next`, logging the transition. Illegal moves are logged and ignored.
    pub fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.id,
                from = %self.state,
                to = %next,
                "Ignoring illegal session state transition"
            );
            return;
        }
        tracing::debug!(
            session_id = %self.id,
            attempt = self.attempt,
            from = %self.state,
            to = %next,
            "Session state transition"
        );
        self.state = next;
    }
}

/// A request to link one phone number.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingRequest {
    #[serde(alias = "number")]
    pub phone_number: String,
    #[serde(default, alias = "keepAlive")]
    pub keep_alive: bool,
}

impl PairingRequest {
    pub fn new(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            keep_alive: false,
        }
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Successful result of a pairing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingOutcome {
    /// Id of the pairing session that linked.
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Id the credential bundle was stored under.
    pub id: String,
    /// Whether the credential backend accepted the bundle.
    #[serde(skip)]
    pub uploaded: bool,
}

/// Events reported to a pairing caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PairingEvent {
    Code {
        code: String,
    },
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        id: String,
    },
    Error {
        error: String,
    },
}

impl From<PairingOutcome> for PairingEvent {
    fn from(outcome: PairingOutcome) -> Self {
        PairingEvent::Session {
            session_id: outcome.session_id,
            id: outcome.id,
        }
    }
}
