//! In-memory transport that plays back a fixed script.
//!
//! Used by the test suites and by `pairgate pair --dry-run`. Each `connect`
//! takes the next [`Script`] (the last one repeats) and returns a client that
//! records every code request, sent message and close.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use crate::error::TransportError;
use crate::transport::{
    Address, AuthState, ClientEvent, ConnectionUpdate, DisconnectReason, EventHub,
    EventSubscription, MessageKey, MessagingClient, MessagingTransport, OutgoingMessage,
};

/// Code handed out when a script does not name one.
pub const DEFAULT_SCRIPTED_CODE: &str = "ABCD1234";

/// One step of a scripted event stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Creds(Value),
    Connection(ConnectionUpdate),
    Pause(Duration),
    /// Drop the event stream without a close event.
    EndStream,
}

/// Behavior of one scripted connection.
#[derive(Debug, Clone)]
pub struct Script {
    registered: bool,
    connect_error: Option<String>,
    code: Result<String, String>,
    steps: Vec<ScriptStep>,
    failing_targets: HashSet<Address>,
    own_address: Option<Address>,
}

impl Script {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            registered: false,
            connect_error: None,
            code: Ok(DEFAULT_SCRIPTED_CODE.to_string()),
            steps,
            failing_targets: HashSet::new(),
            own_address: Some(Address::new("100200300@s.whatsapp.net")),
        }
    }

    /// Opens, writes a registered credential blob, and reports the link.
    pub fn linking() -> Self {
        Self::new(vec![
            ScriptStep::Connection(ConnectionUpdate::Opening),
            ScriptStep::Creds(json!({"registered": true, "me": {"id": "100200300@s.whatsapp.net"}})),
            ScriptStep::Connection(ConnectionUpdate::Open),
        ])
    }

    /// Opens and then closes with `status` before linking.
    pub fn closing(status: u16) -> Self {
        Self::new(vec![
            ScriptStep::Connection(ConnectionUpdate::Opening),
            ScriptStep::Connection(ConnectionUpdate::Closed {
                reason: DisconnectReason::Status(status),
            }),
        ])
    }

    /// Never reports anything.
    pub fn silent() -> Self {
        Self::new(vec![ScriptStep::Pause(Duration::from_secs(3600))])
    }

    pub fn registered(mut self) -> Self {
        self.registered = true;
        self
    }

    pub fn connect_error(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Ok(code.into());
        self
    }

    pub fn code_error(mut self, reason: impl Into<String>) -> Self {
        self.code = Err(reason.into());
        self
    }

    pub fn failing_send_to(mut self, to: Address) -> Self {
        self.failing_targets.insert(to);
        self
    }

    pub fn own_address(mut self, own: Option<Address>) -> Self {
        self.own_address = own;
        self
    }

    pub fn then(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::linking()
    }
}

/// Transport handing out scripted clients.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Script>,
    clients: Mutex<Vec<Arc<ScriptedClient>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Self {
        Self::with_scripts(vec![script])
    }

    /// Play `scripts` in order, one per connect; the last one repeats.
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        let last = scripts.last().cloned().unwrap_or_default();
        Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(last),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Every client connected so far, oldest first.
    pub fn clients(&self) -> Vec<Arc<ScriptedClient>> {
        lock(&self.clients).clone()
    }

    fn next_script(&self) -> Script {
        lock(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| lock(&self.last).clone())
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingTransport for ScriptedTransport {
    async fn connect(&self, state: AuthState) -> Result<Arc<dyn MessagingClient>, TransportError> {
        let script = self.next_script();
        if let Some(reason) = &script.connect_error {
            return Err(TransportError::ConnectFailed {
                reason: reason.clone(),
            });
        }

        let client = Arc::new(ScriptedClient::new(script, state.is_registered()));
        lock(&self.clients).push(Arc::clone(&client));
        Ok(client)
    }
}

/// A client following one [`Script`].
pub struct ScriptedClient {
    script: Script,
    registered: bool,
    events: Arc<EventHub>,
    started: Mutex<bool>,
    code_requests: Mutex<Vec<String>>,
    sent: Mutex<Vec<(Address, OutgoingMessage)>>,
    closes: AtomicU32,
}

impl ScriptedClient {
    fn new(script: Script, restored: bool) -> Self {
        Self {
            registered: script.registered || restored,
            script,
            events: Arc::new(EventHub::new()),
            started: Mutex::new(false),
            code_requests: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closes: AtomicU32::new(0),
        }
    }

    pub fn code_requests(&self) -> Vec<String> {
        lock(&self.code_requests).clone()
    }

    pub fn sent(&self) -> Vec<(Address, OutgoingMessage)> {
        lock(&self.sent).clone()
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    fn play(&self) {
        let steps = self.script.steps.clone();
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            for step in steps {
                let event = match step {
                    ScriptStep::Pause(delay) => {
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    ScriptStep::EndStream => {
                        events.close();
                        return;
                    }
                    ScriptStep::Creds(creds) => ClientEvent::CredsUpdate(creds),
                    ScriptStep::Connection(update) => ClientEvent::Connection(update),
                };
                if !events.publish(event) {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl MessagingClient for ScriptedClient {
    fn is_registered(&self) -> bool {
        self.registered
    }

    fn own_address(&self) -> Option<Address> {
        self.script.own_address.clone()
    }

    fn subscribe(&self) -> EventSubscription {
        let subscription = self.events.subscribe();

        let mut started = lock(&self.started);
        if !*started {
            *started = true;
            self.play();
        }
        subscription
    }

    async fn request_pairing_code(&self, phone_digits: &str) -> Result<String, TransportError> {
        lock(&self.code_requests).push(phone_digits.to_string());
        self.script
            .code
            .clone()
            .map_err(|reason| TransportError::RequestFailed {
                op: "request_pairing_code".to_string(),
                reason,
            })
    }

    async fn send_message(
        &self,
        to: &Address,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut sent = lock(&self.sent);
        sent.push((to.clone(), message));
        if self.script.failing_targets.contains(to) {
            return Err(TransportError::SendFailed {
                to: to.to_string(),
                reason: "recipient rejected".to_string(),
            });
        }
        Ok(MessageKey(format!("SCRIPTED{:04}", sent.len())))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.events.close();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
