//! Pairing session orchestrator.
//!
//! Drives one pairing request from phone number to a single outcome:
//!
//! ```text
//! INIT ──► AUTH_LOADING ──► CODE_REQUESTED ──► AWAITING_CONNECTION
//!                 │                                   │
//!                 └── (already registered) ───────────┤
//!                                                     ├── open  ──► OPEN_PROCESSING ──► DONE
//!                                                     └── close ──► FAILED
//!                                                               └─► RECONNECTING ──► INIT (keep-alive, bounded)
//! ```
//!
//! Every attempt owns a fresh session id, a session directory, and a
//! [`SettlementGuard`] armed with the session deadline. The attempt's driver
//! runs as its own task; whatever ends the attempt (link, close, timeout,
//! driver failure) settles the guard once and then tears the session down.
//! An attempt returns only after its teardown has finished, or after a
//! linked keep-alive session has been handed to its lingering task.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::pairing::id::SessionIdGenerator;
use crate::pairing::persist::CredsPersister;
use crate::pairing::session::{
    PairingEvent, PairingOutcome, PairingRequest, PairingSession, PhoneNumber, SessionState,
};
use crate::pairing::settlement::SettlementGuard;
use crate::pairing::store::CredentialStore;
use crate::transport::{
    Address, ClientEvent, ConnectionUpdate, DisconnectReason, EVENT_BUFFER, EventSubscription,
    MessageKey, MessagingClient, MessagingTransport, OutgoingMessage,
};

/// Events buffered for a caller of [`PairingOrchestrator::start`].
const CALLER_EVENT_BUFFER: usize = 8;

/// Receives the pairing code for a session.
///
/// Called at most once per attempt, before the attempt settles. Errors are
/// logged and otherwise ignored.
pub trait CodeSink: Send + Sync {
    fn deliver(&self, code: &str) -> Result<(), String>;
}

impl<F> CodeSink for F
where
    F: Fn(&str) -> Result<(), String> + Send + Sync,
{
    fn deliver(&self, code: &str) -> Result<(), String> {
        self(code)
    }
}

/// Forwards codes into a caller's event channel.
struct EventSink {
    tx: mpsc::Sender<PairingEvent>,
}

impl CodeSink for EventSink {
    fn deliver(&self, code: &str) -> Result<(), String> {
        self.tx
            .try_send(PairingEvent::Code {
                code: code.to_string(),
            })
            .map_err(|e| e.to_string())
    }
}

/// Event feed for one pairing request: zero or more `code` events followed by
/// exactly one `session` or `error` event.
pub struct PairingEvents {
    rx: mpsc::Receiver<PairingEvent>,
}

impl PairingEvents {
    pub async fn next(&mut self) -> Option<PairingEvent> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<PairingEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// Connection updates for one session, fed by a task that also routes
/// credential updates to the session's persister.
///
/// Dropping the pump releases the client subscription.
struct EventPump {
    updates: mpsc::Receiver<ConnectionUpdate>,
    task: JoinHandle<()>,
}

impl EventPump {
    fn start(mut subscription: EventSubscription, persister: CredsPersister, session_id: String) -> Self {
        let (tx, updates) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                match event {
                    ClientEvent::CredsUpdate(creds) => {
                        if !persister.enqueue(creds).await {
                            tracing::warn!(session_id = %session_id, "Credential writer is gone, update dropped");
                        }
                    }
                    ClientEvent::Connection(update) => {
                        if tx.send(update).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self { updates, task }
    }

    async fn next(&mut self) -> Option<ConnectionUpdate> {
        self.updates.recv().await
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct LinkParts {
    client: Option<Arc<dyn MessagingClient>>,
    persister: Option<CredsPersister>,
}

/// Live resources of a session that teardown must release.
///
/// Shared by the session driver and its watchdog, so the transport is still
/// closed when the driver dies.
#[derive(Clone, Default)]
struct SessionLink {
    parts: Arc<Mutex<LinkParts>>,
}

impl SessionLink {
    fn attach(&self, client: Arc<dyn MessagingClient>, persister: CredsPersister) {
        let mut parts = self.lock();
        parts.client = Some(client);
        parts.persister = Some(persister);
    }

    fn take(&self) -> LinkParts {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LinkParts> {
        self.parts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What happens to a session's resources once it has settled.
enum Disposition {
    /// Close the transport and remove the directory now.
    Release,
    /// Linked: let outgoing messages drain for the close grace, then release.
    Drain(EventPump),
    /// Keep the transport open until it closes on its own.
    Linger(EventPump),
}

struct OrchestratorInner {
    transport: Arc<dyn MessagingTransport>,
    store: Arc<CredentialStore>,
    ids: SessionIdGenerator,
    config: PairingConfig,
}

/// Coordinates pairing attempts.
///
/// Cheap to clone; clones share the transport, store and configuration.
/// Attempts share no mutable state with each other.
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl PairingOrchestrator {
    pub fn new(
        transport: Arc<dyn MessagingTransport>,
        store: Arc<CredentialStore>,
        config: PairingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                transport,
                store,
                ids: SessionIdGenerator::new(),
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &PairingConfig {
        &self.inner.config
    }

    /// Run a pairing request to completion.
    ///
    /// The phone number is validated before any session exists. Without
    /// keep-alive the first attempt's outcome is returned. With keep-alive, a
    /// connection that closes before linking starts a fresh attempt after the
    /// configured backoff, up to the configured attempt ceiling.
    pub async fn pair(
        &self,
        request: PairingRequest,
        sink: Arc<dyn CodeSink>,
    ) -> Result<PairingOutcome, PairingError> {
        let phone = PhoneNumber::parse(&request.phone_number)?;
        let policy = &self.inner.config.retry;

        let mut attempt = 1;
        loop {
            match self
                .run_attempt(&phone, request.keep_alive, Arc::clone(&sink), attempt)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if request.keep_alive && e.is_restartable() => {
                    if !policy.allows_another(attempt) {
                        tracing::warn!(phone = %phone, attempts = attempt, error = %e, "Keep-alive pairing exhausted its attempts");
                        return Err(PairingError::RetriesExhausted {
                            attempts: attempt,
                            last_reason: e.to_string(),
                        });
                    }
                    let delay = policy.delay_for(attempt);
                    tracing::info!(phone = %phone, attempt, ?delay, error = %e, "Connection closed, restarting pairing");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Start a pairing request in the background and return its event feed.
    ///
    /// The attempt keeps running if the caller stops reading.
    pub fn start(&self, request: PairingRequest) -> PairingEvents {
        let (tx, rx) = mpsc::channel(CALLER_EVENT_BUFFER);
        let sink: Arc<dyn CodeSink> = Arc::new(EventSink { tx: tx.clone() });
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let event = match orchestrator.pair(request, sink).await {
                Ok(outcome) => PairingEvent::from(outcome),
                Err(e) => PairingEvent::Error {
                    error: e.to_string(),
                },
            };
            if tx.send(event).await.is_err() {
                tracing::debug!("Pairing caller went away before the outcome");
            }
        });

        PairingEvents { rx }
    }

    async fn run_attempt(
        &self,
        phone: &PhoneNumber,
        keep_alive: bool,
        sink: Arc<dyn CodeSink>,
        attempt: u32,
    ) -> Result<PairingOutcome, PairingError> {
        let config = &self.inner.config;
        let id = self.inner.ids.generate();
        let auth_dir = self.inner.store.prepare_directory(&id).await?;

        let session = PairingSession {
            id: id.clone(),
            phone: phone.clone(),
            auth_dir: auth_dir.clone(),
            state: SessionState::Init,
            deadline: deadline_after(config.timeout),
            keep_alive,
            attempt,
        };
        tracing::info!(session_id = %id, attempt, keep_alive, deadline = %session.deadline, "Starting pairing session");

        let (guard, settlement) = SettlementGuard::arm(id.clone(), config.timeout);
        let link = SessionLink::default();
        let driver = tokio::spawn(self.clone().drive(session, guard.clone(), sink, link.clone()));
        let released = self.watch_driver(driver, guard, id.clone(), auth_dir, link);

        // The outcome may already be settled; teardown still finishes first.
        let _ = released.await;
        let outcome = settlement.wait().await;
        match &outcome {
            Ok(linked) => {
                tracing::info!(session_id = %id, creds_id = %linked.id, uploaded = linked.uploaded, "Pairing session linked");
            }
            Err(e) => {
                tracing::info!(session_id = %id, kind = e.kind(), error = %e, "Pairing session failed");
            }
        }
        outcome
    }

    /// Wait for a session driver to finish. A driver that dies is settled as
    /// `Internal` and its session torn down here.
    ///
    /// The returned receiver fires once the session's resources are released.
    fn watch_driver(
        &self,
        driver: JoinHandle<()>,
        guard: SettlementGuard<PairingOutcome>,
        session_id: String,
        auth_dir: PathBuf,
        link: SessionLink,
    ) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = driver.await {
                tracing::error!(session_id = %session_id, error = %e, "Pairing session driver aborted");
                guard.settle(Err(PairingError::Internal {
                    session_id: session_id.clone(),
                    reason: e.to_string(),
                }));
                orchestrator.teardown(&session_id, &auth_dir, &link).await;
            }
            let _ = done_tx.send(());
        });
        done_rx
    }

    async fn drive(
        self,
        mut session: PairingSession,
        guard: SettlementGuard<PairingOutcome>,
        sink: Arc<dyn CodeSink>,
        link: SessionLink,
    ) {
        let mut token = guard.token();

        let advanced = tokio::select! {
            result = self.advance(&mut session, &guard, sink.as_ref(), &link) => Some(result),
            _ = token.cancelled() => None,
        };

        let disposition = match advanced {
            Some(Ok(disposition)) => disposition,
            Some(Err(e)) => {
                session.transition(SessionState::Failed);
                guard.settle(Err(e));
                Disposition::Release
            }
            // Settled from outside, which only the deadline timer does.
            None => {
                session.transition(SessionState::Failed);
                Disposition::Release
            }
        };

        match disposition {
            Disposition::Release => {
                self.teardown(&session.id, &session.auth_dir, &link).await;
            }
            Disposition::Drain(pump) => {
                tokio::time::sleep(self.inner.config.close_grace).await;
                drop(pump);
                self.teardown(&session.id, &session.auth_dir, &link).await;
            }
            Disposition::Linger(pump) => self.linger(session, link, pump),
        }
    }

    /// Run the session up to settlement. Nothing may be awaited after the
    /// guard is settled here; teardown happens in the caller.
    async fn advance(
        &self,
        session: &mut PairingSession,
        guard: &SettlementGuard<PairingOutcome>,
        sink: &dyn CodeSink,
        link: &SessionLink,
    ) -> Result<Disposition, PairingError> {
        let config = &self.inner.config;

        session.transition(SessionState::AuthLoading);
        let auth = self
            .inner
            .transport
            .load_auth_state(&session.auth_dir)
            .await?;
        let persister = CredsPersister::spawn(auth.saver(), config.persist_queue_capacity);
        let client = self.inner.transport.connect(auth).await?;
        link.attach(Arc::clone(&client), persister.clone());
        let mut pump = EventPump::start(client.subscribe(), persister.clone(), session.id.clone());

        if client.is_registered() {
            tracing::debug!(session_id = %session.id, "Identity already registered, no pairing code needed");
        } else {
            session.transition(SessionState::CodeRequested);
            // The transport needs a moment after construction before it accepts a code request.
            tokio::time::sleep(config.code_request_delay).await;
            let code = client
                .request_pairing_code(session.phone.digits())
                .await
                .map_err(|e| PairingError::CodeRequest {
                    session_id: session.id.clone(),
                    reason: e.to_string(),
                })?;
            tracing::info!(session_id = %session.id, "Pairing code issued");
            if let Err(e) = sink.deliver(&code) {
                tracing::warn!(session_id = %session.id, error = %e, "Pairing code callback failed");
            }
        }
        session.transition(SessionState::AwaitingConnection);

        let reason = loop {
            let Some(update) = pump.next().await else {
                break DisconnectReason::Message("connection event stream ended".to_string());
            };
            match update {
                ConnectionUpdate::Opening => {
                    tracing::debug!(session_id = %session.id, "Connection opening");
                }
                ConnectionUpdate::Open => {
                    session.transition(SessionState::OpenProcessing);
                    persister.flush().await;
                    let bundle = self.inner.store.upload_bundle(&session.id).await;
                    self.announce(client.as_ref(), session, &bundle.local_id)
                        .await;
                    let outcome = PairingOutcome {
                        session_id: session.id.clone(),
                        id: bundle.local_id,
                        uploaded: bundle.uploaded,
                    };

                    session.transition(SessionState::Done);
                    guard.settle(Ok(outcome));
                    return Ok(if session.keep_alive {
                        Disposition::Linger(pump)
                    } else {
                        Disposition::Drain(pump)
                    });
                }
                ConnectionUpdate::Closed { reason } => break reason,
            }
        };

        tracing::info!(session_id = %session.id, reason = %reason, "Connection closed before linking");
        session.transition(if session.keep_alive {
            SessionState::Reconnecting
        } else {
            SessionState::Failed
        });
        guard.settle(Err(PairingError::ConnectionClosed {
            session_id: session.id.clone(),
            reason: reason.to_string(),
        }));
        Ok(Disposition::Release)
    }

    /// Send the credential id to the linked account, then the follow-up
    /// message quoting it. Returns the address that accepted the id.
    async fn announce(
        &self,
        client: &dyn MessagingClient,
        session: &PairingSession,
        creds_id: &str,
    ) -> Option<Address> {
        let (to, key) = match self
            .send_with_fallback(client, session, OutgoingMessage::text(creds_id))
            .await
        {
            Some(sent) => sent,
            None => {
                tracing::warn!(session_id = %session.id, "Could not deliver the credential id to any address");
                return None;
            }
        };

        let follow_up = OutgoingMessage::text(&self.inner.config.brand_message).quoting(key);
        if let Err(e) = client.send_message(&to, follow_up).await {
            tracing::warn!(session_id = %session.id, to = %to, error = %e, "Follow-up message failed");
        }
        Some(to)
    }

    /// Send to the phone-derived address, falling back to the client's own address.
    async fn send_with_fallback(
        &self,
        client: &dyn MessagingClient,
        session: &PairingSession,
        message: OutgoingMessage,
    ) -> Option<(Address, MessageKey)> {
        let primary = session.phone.address();
        match client.send_message(&primary, message.clone()).await {
            Ok(key) => return Some((primary, key)),
            Err(e) => {
                tracing::warn!(session_id = %session.id, to = %primary, error = %e, "Send to phone address failed, falling back to own address");
            }
        }

        let own = client.own_address()?;
        match client.send_message(&own, message).await {
            Ok(key) => Some((own, key)),
            Err(e) => {
                tracing::warn!(session_id = %session.id, to = %own, error = %e, "Send to own address failed");
                None
            }
        }
    }

    /// Close the transport, settle pending credential writes and remove the
    /// session directory. Safe to call more than once.
    async fn teardown(&self, session_id: &str, auth_dir: &Path, link: &SessionLink) {
        let LinkParts { client, persister } = link.take();
        if let Some(client) = client
            && let Err(e) = client.close().await
        {
            tracing::debug!(session_id = %session_id, error = %e, "Transport close failed");
        }
        if let Some(persister) = persister {
            persister.flush().await;
            if persister.failed() > 0 {
                tracing::warn!(
                    session_id = %session_id,
                    saved = persister.saved(),
                    failed = persister.failed(),
                    "Some credential updates could not be written"
                );
            } else {
                tracing::debug!(
                    session_id = %session_id,
                    saved = persister.saved(),
                    coalesced = persister.coalesced(),
                    "Credential writer drained"
                );
            }
        }
        self.inner.store.remove_directory(auth_dir).await;
    }

    /// Keep a linked keep-alive session running until its connection closes.
    fn linger(&self, session: PairingSession, link: SessionLink, mut pump: EventPump) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tracing::info!(session_id = %session.id, "Keeping linked session open");
            while let Some(update) = pump.next().await {
                if let ConnectionUpdate::Closed { reason } = update {
                    tracing::info!(session_id = %session.id, reason = %reason, "Linked session closed");
                    break;
                }
            }
            drop(pump);
            orchestrator
                .teardown(&session.id, &session.auth_dir, &link)
                .await;
        });
    }
}

fn deadline_after(timeout: std::time::Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
