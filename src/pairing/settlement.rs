//! One-shot settlement for a pairing session.
//!
//! A [`SettlementGuard`] holds at most one outcome. The first `settle` call
//! wins and is delivered to the [`Settlement`] the caller awaits; later calls
//! are ignored. Settling also fires the guard's cancellation token, which
//! stops the deadline timer and tells the session driver to wind down.
//!
//! ```text
//! arm(deadline) ──► (guard, settlement)
//!   guard.settle(..)   first call wins, token fires
//!   deadline elapses   settle(Err(Timeout)) unless already settled
//!   settlement.wait()  resolves exactly once
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};

use crate::error::PairingError;

type Outcome<T> = Result<T, PairingError>;

struct GuardInner<T> {
    session_id: String,
    slot: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    cancel: watch::Sender<bool>,
}

/// Write side of a session's one-shot outcome.
pub struct SettlementGuard<T> {
    inner: Arc<GuardInner<T>>,
}

impl<T> Clone for SettlementGuard<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Read side: resolves with the session's single outcome.
pub struct Settlement<T> {
    session_id: String,
    rx: oneshot::Receiver<Outcome<T>>,
}

/// Cancellation signal tied to a guard's settlement.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl<T: Send + 'static> SettlementGuard<T> {
    /// Arm a guard whose deadline timer settles `Timeout` after `deadline`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(session_id: impl Into<String>, deadline: Duration) -> (Self, Settlement<T>) {
        let (guard, settlement) = Self::unarmed(session_id);

        let timer_guard = guard.clone();
        let mut token = guard.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    let session_id = timer_guard.session_id().to_string();
                    if timer_guard.settle(Err(PairingError::Timeout { session_id: session_id.clone(), timeout: deadline })) {
                        tracing::warn!(session_id = %session_id, ?deadline, "Pairing session timed out");
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        (guard, settlement)
    }
}

impl<T> SettlementGuard<T> {
    /// A guard without a deadline.
    pub fn unarmed(session_id: impl Into<String>) -> (Self, Settlement<T>) {
        let session_id = session_id.into();
        let (tx, rx) = oneshot::channel();
        let (cancel, _) = watch::channel(false);
        let guard = Self {
            inner: Arc::new(GuardInner {
                session_id: session_id.clone(),
                slot: Mutex::new(Some(tx)),
                cancel,
            }),
        };
        (guard, Settlement { session_id, rx })
    }

    /// Record the outcome. Returns `true` if this call won.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        let sender = match self.inner.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(sender) = sender else {
            return false;
        };

        // The caller may have stopped listening; the outcome still counts.
        let _ = sender.send(outcome);
        self.inner.cancel.send_replace(true);
        true
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Token that fires once this guard settles.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.inner.cancel.subscribe(),
        }
    }
}

impl<T> Settlement<T> {
    /// Wait for the outcome.
    ///
    /// If every guard is dropped without settling, resolves to
    /// [`PairingError::Internal`].
    pub async fn wait(self) -> Outcome<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(PairingError::Internal {
                session_id: self.session_id,
                reason: "settlement guard dropped without an outcome".to_string(),
            }),
        }
    }
}

impl CancelToken {
    /// Resolve once the owning guard has settled.
    pub async fn cancelled(&mut self) {
        // An error means every guard is gone, which also ends the session.
        let _ = self.rx.wait_for(|settled| *settled).await;
    }
}
