//! WebSocket adapter to an out-of-process messaging bridge.
//!
//! The bridge owns the actual messaging protocol. This side speaks a small
//! JSON protocol over one WebSocket per session:
//!
//! ```text
//! client -> bridge   {"id": 1, "op": "init", "creds": {..} | null}
//!                    {"id": 2, "op": "request_pairing_code", "number": "628.."}
//!                    {"id": 3, "op": "send_message", "to": "..", "text": "..", "quoted": ".."}
//!                    {"id": 4, "op": "close"}
//! bridge -> client   {"id": 1, "ok": true, "result": {..}}  |  {"id": 1, "ok": false, "error": ".."}
//!                    {"event": "creds.update", "creds": {..}}
//!                    {"event": "connection.update", "connection": "connecting" | "open" | "close",
//!                     "lastDisconnect": {"error": {"output": {"statusCode": 428}, "message": ".."}}}
//! ```
//!
//! Loosely typed payloads are mapped onto [`ClientEvent`] at this boundary;
//! nothing past it sees raw bridge JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::config::BridgeConfig;
use crate::error::TransportError;
use crate::transport::{
    Address, AuthState, ClientEvent, ConnectionUpdate, DisconnectReason, EVENT_BUFFER, EventHub,
    EventSubscription, MessageKey, MessagingClient, MessagingTransport, OutgoingMessage,
    USER_SERVER,
};

/// How long `close` waits for the bridge to acknowledge.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Reply = Result<Value, String>;

/// A decoded bridge frame.
#[derive(Debug, PartialEq)]
enum Inbound {
    Reply { id: u64, reply: Reply },
    Event(ClientEvent),
    Ignored,
}

fn parse_frame(raw: &str) -> Result<Inbound, TransportError> {
    let frame: Value =
        serde_json::from_str(raw).map_err(|e| TransportError::Protocol(e.to_string()))?;

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let reply = if frame.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        } else {
            Err(frame
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("bridge reported failure")
                .to_string())
        };
        return Ok(Inbound::Reply { id, reply });
    }

    match frame.get("event").and_then(Value::as_str) {
        Some("creds.update") => match frame.get("creds") {
            Some(creds) if creds.is_object() => Ok(Inbound::Event(ClientEvent::CredsUpdate(creds.clone()))),
            _ => Err(TransportError::Protocol(
                "creds.update without a creds object".to_string(),
            )),
        },
        Some("connection.update") => Ok(parse_connection_update(&frame)
            .map(|update| Inbound::Event(ClientEvent::Connection(update)))
            .unwrap_or(Inbound::Ignored)),
        Some(_) => Ok(Inbound::Ignored),
        None => Err(TransportError::Protocol(
            "frame has neither id nor event".to_string(),
        )),
    }
}

/// Map a `connection.update` payload. Updates without a connection state
/// (progress or QR notices) yield `None`.
fn parse_connection_update(payload: &Value) -> Option<ConnectionUpdate> {
    match payload.get("connection").and_then(Value::as_str)? {
        "connecting" => Some(ConnectionUpdate::Opening),
        "open" => Some(ConnectionUpdate::Open),
        "close" => Some(ConnectionUpdate::Closed {
            reason: disconnect_reason(payload),
        }),
        other => {
            tracing::debug!(state = other, "Unknown connection state from bridge");
            None
        }
    }
}

fn disconnect_reason(payload: &Value) -> DisconnectReason {
    let error = payload.pointer("/lastDisconnect/error");
    if let Some(status) = error
        .and_then(|e| e.pointer("/output/statusCode"))
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
    {
        return DisconnectReason::Status(status);
    }
    match error.and_then(|e| e.get("message")).and_then(Value::as_str) {
        Some(message) => DisconnectReason::Message(message.to_string()),
        None => DisconnectReason::Unspecified,
    }
}

/// Reduce a device-qualified id (`628..:12@s.whatsapp.net`) to a user address.
fn user_address(raw: &str) -> Option<Address> {
    let (user, server) = raw.split_once('@').unwrap_or((raw, USER_SERVER));
    let user = user.split(':').next().unwrap_or(user);
    if user.is_empty() {
        return None;
    }
    Some(Address::new(format!("{}@{}", user, server)))
}

/// Own id carried in a credential blob or init reply (`me.id` or `me`).
fn me_from(value: &Value) -> Option<Address> {
    let me = value.get("me")?;
    let raw = me.get("id").and_then(Value::as_str).or_else(|| me.as_str())?;
    user_address(raw)
}

/// Transport that opens one bridge WebSocket per session.
pub struct BridgeTransport {
    config: BridgeConfig,
}

impl BridgeTransport {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MessagingTransport for BridgeTransport {
    async fn connect(&self, state: AuthState) -> Result<Arc<dyn MessagingClient>, TransportError> {
        let connect_timeout = self.config.connect_timeout;
        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(self.config.url.as_str()))
            .await
            .map_err(|_| TransportError::RequestTimeout {
                op: "connect".to_string(),
                timeout: connect_timeout,
            })?
            .map_err(|e| TransportError::ConnectFailed {
                reason: format!("{}: {}", self.config.url, e),
            })?;
        tracing::debug!(url = %self.config.url, dir = %state.dir().display(), "Connected to messaging bridge");

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(EVENT_BUFFER);
        let shared = Arc::new(BridgeShared {
            pending: Mutex::new(HashMap::new()),
            events: EventHub::new(),
            own_address: Mutex::new(state.creds().and_then(me_from)),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    tracing::debug!(error = %e, "Bridge write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_shared.dispatch(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Bridge connection error");
                        break;
                    }
                }
            }
            reader_shared.connection_lost();
        });

        let client = BridgeClient {
            shared,
            out_tx,
            next_id: AtomicU64::new(1),
            request_timeout: self.config.request_timeout,
            registered: AtomicBool::new(state.is_registered()),
        };

        let ready = client
            .call("init", json!({ "creds": state.creds().cloned() }))
            .await?;
        if let Some(registered) = ready.get("registered").and_then(Value::as_bool) {
            client.registered.store(registered, Ordering::SeqCst);
        }
        if let Some(me) = me_from(&ready) {
            client.shared.set_own_address(me);
        }

        Ok(Arc::new(client))
    }
}

struct BridgeShared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    events: EventHub,
    own_address: Mutex<Option<Address>>,
    closed: AtomicBool,
}

impl BridgeShared {
    fn dispatch(&self, raw: &str) {
        match parse_frame(raw) {
            Ok(Inbound::Reply { id, reply }) => match lock(&self.pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => tracing::debug!(id, "Reply for unknown or expired bridge request"),
            },
            Ok(Inbound::Event(event)) => {
                if let ClientEvent::CredsUpdate(creds) = &event
                    && let Some(me) = me_from(creds)
                {
                    self.set_own_address(me);
                }
                self.events.publish(event);
            }
            Ok(Inbound::Ignored) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed bridge frame"),
        }
    }

    /// Reader ended: fail in-flight requests and report the close once.
    fn connection_lost(&self) {
        lock(&self.pending).clear();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.close_with(ConnectionUpdate::Closed {
            reason: DisconnectReason::Message("bridge connection lost".to_string()),
        });
    }

    fn set_own_address(&self, address: Address) {
        *lock(&self.own_address) = Some(address);
    }
}

/// Client for one bridge WebSocket.
pub struct BridgeClient {
    shared: Arc<BridgeShared>,
    out_tx: mpsc::Sender<Message>,
    next_id: AtomicU64,
    request_timeout: Duration,
    registered: AtomicBool,
}

impl BridgeClient {
    async fn call(&self, op: &str, params: Value) -> Result<Value, TransportError> {
        self.call_with_timeout(op, params, self.request_timeout).await
    }

    async fn call_with_timeout(
        &self,
        op: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = match params {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        frame.insert("id".to_string(), json!(id));
        frame.insert("op".to_string(), json!(op));

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        if self
            .out_tx
            .send(Message::text(Value::Object(frame).to_string()))
            .await
            .is_err()
        {
            lock(&self.shared.pending).remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(TransportError::RequestTimeout {
                    op: op.to_string(),
                    timeout,
                })
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(Err(reason))) => Err(TransportError::RequestFailed {
                op: op.to_string(),
                reason,
            }),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn own_address(&self) -> Option<Address> {
        lock(&self.shared.own_address).clone()
    }

    fn subscribe(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    async fn request_pairing_code(&self, phone_digits: &str) -> Result<String, TransportError> {
        let result = self
            .call("request_pairing_code", json!({ "number": phone_digits }))
            .await?;
        result
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::Protocol("pairing code reply without code".to_string()))
    }

    async fn send_message(
        &self,
        to: &Address,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError> {
        let result = self
            .call(
                "send_message",
                json!({
                    "to": to.as_str(),
                    "text": message.text,
                    "quoted": message.quoted.as_ref().map(|k| k.0.as_str()),
                }),
            )
            .await
            .map_err(|e| match e {
                TransportError::RequestFailed { reason, .. } => TransportError::SendFailed {
                    to: to.to_string(),
                    reason,
                },
                other => other,
            })?;
        result
            .get("key")
            .and_then(Value::as_str)
            .map(|key| MessageKey(key.to_string()))
            .ok_or_else(|| TransportError::Protocol("send reply without message key".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self
            .call_with_timeout("close", json!({}), CLOSE_TIMEOUT)
            .await
        {
            tracing::debug!(error = %e, "Bridge did not acknowledge close");
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.events.close();
        lock(&self.shared.pending).clear();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
