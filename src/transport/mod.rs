//! Messaging transport contract.
//!
//! The pairing core never speaks the messaging protocol itself. It drives a
//! [`MessagingTransport`] that loads auth state, builds a [`MessagingClient`]
//! bound to it, and exposes the client's events as a closed set of variants.
//!
//! ```text
//! MessagingTransport::load_auth_state(dir) --> AuthState (+ CredsSaver)
//! MessagingTransport::connect(state)       --> MessagingClient
//! MessagingClient::subscribe()             --> EventSubscription
//!                                                 ├── CredsUpdate(blob)
//!                                                 └── Connection(Opening | Open | Closed { reason })
//! ```

pub mod auth_state;
pub mod bridge;
pub mod scripted;

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

pub use auth_state::{AuthState, CREDS_FILE, CredsSaver};
pub use bridge::BridgeTransport;

use crate::error::TransportError;

/// Server suffix for user addresses.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Buffered events per subscription before a slow subscriber starts lagging.
pub const EVENT_BUFFER: usize = 64;

/// Addressable identity within the messaging backend (a JID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// User address for a digits-only phone number.
    pub fn for_phone_digits(digits: &str) -> Self {
        Self(format!("{}@{}", digits, USER_SERVER))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a sent message, used for quoting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(pub String);

/// A text message, optionally quoting an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted: Option<MessageKey>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            quoted: None,
        }
    }

    pub fn quoting(mut self, key: MessageKey) -> Self {
        self.quoted = Some(key);
        self
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Protocol status code (e.g. 401 logged out, 428 connection closed).
    Status(u16),
    /// Free-form error message.
    Message(String),
    Unspecified,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Status(code) => write!(f, "status {}", code),
            DisconnectReason::Message(msg) => write!(f, "{}", msg),
            DisconnectReason::Unspecified => write!(f, "unspecified"),
        }
    }
}

/// Connection state change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    Opening,
    Open,
    Closed { reason: DisconnectReason },
}

/// Events emitted by a messaging client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The client's credential material changed and should be persisted.
    CredsUpdate(serde_json::Value),
    Connection(ConnectionUpdate),
}

/// Fan-out of one client's events to its subscribers.
///
/// Events travel over a bounded broadcast channel. The newest connection
/// update is also held on the side, so a subscriber that lags past it still
/// learns the connection state.
pub struct EventHub {
    events: Mutex<Option<broadcast::Sender<ClientEvent>>>,
    connection: watch::Sender<Option<ConnectionUpdate>>,
    /// Subscription created with the hub so the first subscriber misses nothing.
    first: Mutex<Option<EventSubscription>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let (connection, connection_rx) = watch::channel(None);
        Self {
            events: Mutex::new(Some(tx)),
            connection,
            first: Mutex::new(Some(EventSubscription {
                rx,
                connection: connection_rx,
            })),
        }
    }

    /// Publish `event`. Returns `false` once the hub is closed.
    pub fn publish(&self, event: ClientEvent) -> bool {
        let events = lock(&self.events);
        let Some(tx) = events.as_ref() else {
            return false;
        };
        if let ClientEvent::Connection(update) = &event {
            self.connection.send_replace(Some(update.clone()));
        }
        // No subscribers is not an error.
        let _ = tx.send(event);
        true
    }

    /// Publish a final connection update and end every subscription.
    pub fn close_with(&self, update: ConnectionUpdate) {
        if let Some(tx) = lock(&self.events).take() {
            self.connection.send_replace(Some(update.clone()));
            let _ = tx.send(ClientEvent::Connection(update));
        }
    }

    /// End every subscription once its buffered events are read.
    pub fn close(&self) {
        lock(&self.events).take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.events).is_none()
    }

    pub fn subscribe(&self) -> EventSubscription {
        if let Some(first) = lock(&self.first).take() {
            return first;
        }
        let rx = match lock(&self.events).as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        EventSubscription {
            rx,
            connection: self.connection.subscribe(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's view of a client's event stream.
///
/// Dropping the subscription releases it; there is no process-wide
/// listener ceiling to manage.
pub struct EventSubscription {
    rx: broadcast::Receiver<ClientEvent>,
    connection: watch::Receiver<Option<ConnectionUpdate>>,
}

impl EventSubscription {
    /// Next event, or `None` once the hub has closed and the buffer is drained.
    ///
    /// A lagging subscriber loses the skipped credential updates, but not
    /// the connection state: the newest connection update is delivered in
    /// place of the gap, and may arrive again if it was still buffered.
    pub async fn next(&mut self) -> Option<ClientEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if matches!(event, ClientEvent::Connection(_)) {
                        let _ = self.connection.borrow_and_update();
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscription lagged, events dropped");
                    if self.connection.has_changed().unwrap_or(true) {
                        let latest = self.connection.borrow_and_update().clone();
                        if let Some(update) = latest {
                            return Some(ClientEvent::Connection(update));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A client bound to one session's auth state.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Whether the loaded identity is already linked (no pairing code needed).
    fn is_registered(&self) -> bool;

    /// The authenticated account's own address, once known.
    fn own_address(&self) -> Option<Address>;

    /// Subscribe to credential and connection events.
    fn subscribe(&self) -> EventSubscription;

    /// Request a pairing code for a digits-only phone number.
    async fn request_pairing_code(&self, phone_digits: &str) -> Result<String, TransportError>;

    /// Send a message, returning its key.
    async fn send_message(
        &self,
        to: &Address,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError>;

    /// Shut the transport down. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for messaging clients.
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Load (or start fresh) the auth state kept in `dir`.
    async fn load_auth_state(&self, dir: &Path) -> Result<AuthState, TransportError> {
        AuthState::load(dir).await
    }

    /// Construct a client bound to `state`.
    async fn connect(&self, state: AuthState) -> Result<Arc<dyn MessagingClient>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phone_address() {
        let addr = Address::for_phone_digits("628123456789");
        assert_eq!(addr.as_str(), "628123456789@s.whatsapp.net");
        assert_eq!(addr.to_string(), "628123456789@s.whatsapp.net");
    }

    #[test]
    fn test_quoting_message() {
        let msg = OutgoingMessage::text("hello").quoting(MessageKey("ABC".to_string()));
        assert_eq!(msg.quoted, Some(MessageKey("ABC".to_string())));
        let json = serde_json::to_value(&OutgoingMessage::text("x")).unwrap();
        assert!(json.get("quoted").is_none());
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::Status(428).to_string(), "status 428");
        assert_eq!(
            DisconnectReason::Message("stream errored".to_string()).to_string(),
            "stream errored"
        );
        assert_eq!(DisconnectReason::Unspecified.to_string(), "unspecified");
    }

    #[tokio::test]
    async fn test_subscription_ends_when_hub_closes() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        assert!(hub.publish(ClientEvent::Connection(ConnectionUpdate::Opening)));
        hub.close();
        assert!(!hub.publish(ClientEvent::Connection(ConnectionUpdate::Open)));
        assert_eq!(
            sub.next().await,
            Some(ClientEvent::Connection(ConnectionUpdate::Opening))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_first_subscriber_sees_events_published_before_subscribing() {
        let hub = EventHub::new();
        hub.publish(ClientEvent::CredsUpdate(serde_json::json!({ "seq": 1 })));
        let mut sub = hub.subscribe();
        assert_eq!(
            sub.next().await,
            Some(ClientEvent::CredsUpdate(serde_json::json!({ "seq": 1 })))
        );
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_connection_state() {
        let hub = EventHub::with_capacity(2);
        let mut sub = hub.subscribe();
        hub.publish(ClientEvent::Connection(ConnectionUpdate::Opening));
        hub.publish(ClientEvent::Connection(ConnectionUpdate::Closed {
            reason: DisconnectReason::Status(428),
        }));
        // A burst of credential updates pushes the close out of the buffer.
        for seq in 0..4 {
            hub.publish(ClientEvent::CredsUpdate(serde_json::json!({ "seq": seq })));
        }
        hub.close();

        let mut received = Vec::new();
        while let Some(event) = sub.next().await {
            received.push(event);
        }
        assert_eq!(
            received.first(),
            Some(&ClientEvent::Connection(ConnectionUpdate::Closed {
                reason: DisconnectReason::Status(428),
            }))
        );
        assert_eq!(
            received.last(),
            Some(&ClientEvent::CredsUpdate(serde_json::json!({ "seq": 3 })))
        );
    }

    #[tokio::test]
    async fn test_close_with_delivers_final_update() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        hub.close_with(ConnectionUpdate::Closed {
            reason: DisconnectReason::Unspecified,
        });
        assert!(hub.is_closed());
        assert_eq!(
            sub.next().await,
            Some(ClientEvent::Connection(ConnectionUpdate::Closed {
                reason: DisconnectReason::Unspecified,
            }))
        );
        assert_eq!(sub.next().await, None);
    }
}
