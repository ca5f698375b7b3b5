//! Device pairing sessions.
//!
//! A pairing request turns a phone number into a linked messaging identity.
//! The code is shown to the caller, the phone confirms it, and the resulting
//! credential blob is shipped to the session backend under a fresh id.
//!
//! - [`PairingOrchestrator`] drives attempts end to end
//! - [`SettlementGuard`] makes each attempt resolve exactly once
//! - [`CredentialStore`] owns session directories and backend uploads
//! - [`CredsPersister`] serializes credential writes for a session

pub mod id;
mod orchestrator;
pub mod persist;
pub mod retry;
mod session;
pub mod settlement;
pub mod store;

pub use id::{SESSION_ID_PREFIX, SessionIdGenerator};
pub use orchestrator::{CodeSink, PairingEvents, PairingOrchestrator};
pub use persist::CredsPersister;
pub use retry::RetryPolicy;
pub use session::{
    PairingEvent, PairingOutcome, PairingRequest, PairingSession, PhoneNumber, SessionState,
};
pub use settlement::{CancelToken, Settlement, SettlementGuard};
pub use store::{CredentialBackend, CredentialBundle, CredentialStore, HttpCredentialBackend};
