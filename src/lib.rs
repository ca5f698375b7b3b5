//! pairgate: pairing-code onboarding for messaging accounts.
//!
//! A caller submits a phone number and receives a pairing code. Once the
//! phone confirms it, the linked session's credentials are uploaded to a
//! session backend and the caller receives an id that restores the session.

pub mod cli;
pub mod config;
pub mod error;
pub mod pairing;
pub mod server;
pub mod transport;
