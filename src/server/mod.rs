//! HTTP front door.
//!
//! - `GET /code?number=&keepAlive=` starts pairing and answers with the first event
//! - `GET /code/stream?number=&keepAlive=` streams every event as SSE
//! - `GET /validate?sessionId=` checks that a stored bundle can be fetched
//! - `GET /health` liveness check
//!
//! Pairing keeps running in the background after `/code` has answered.

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{BackendError, ServerError};
use crate::pairing::{PairingEvent, PairingOrchestrator, PairingRequest, PhoneNumber};

const PHONE_REQUIRED: &str = "Phone number is required";
const SESSION_ID_REQUIRED: &str = "Session id is required";

#[derive(Clone)]
struct AppState {
    orchestrator: PairingOrchestrator,
}

#[derive(Debug, Deserialize)]
struct CodeQuery {
    number: Option<String>,
    #[serde(rename = "keepAlive")]
    keep_alive: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct ValidateBody {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Build the router for `orchestrator`.
pub fn routes(orchestrator: PairingOrchestrator) -> Router {
    Router::new()
        .route("/code", get(request_code))
        .route("/code/stream", get(stream_code))
        .route("/validate", get(validate_session))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { orchestrator })
}

/// The pairing HTTP server.
pub struct PairingServer {
    config: ServerConfig,
    orchestrator: PairingOrchestrator,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PairingServer {
    pub fn new(config: ServerConfig, orchestrator: PairingOrchestrator) -> Self {
        Self {
            config,
            orchestrator,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind the listener and spawn the server. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| ServerError::StartupFailed {
                addr: self.config.addr.to_string(),
                reason: format!("Failed to bind: {}", e),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::StartupFailed {
                addr: self.config.addr.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Pairing server listening on {}", local_addr);

        let app = routes(self.orchestrator.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Pairing server shutting down");
                })
                .await
            {
                tracing::error!("Pairing server error: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(local_addr)
    }

    /// Resolve once the server task exits.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await;
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn pairing_request(query: CodeQuery) -> Result<PairingRequest, Response> {
    let number = match query.number.as_deref().map(str::trim) {
        Some(number) if !number.is_empty() => number.to_string(),
        _ => return Err(bad_request(PHONE_REQUIRED)),
    };
    // Reject malformed numbers here so they get a 400 rather than an error event.
    if let Err(e) = PhoneNumber::parse(&number) {
        return Err(bad_request(e.to_string()));
    }

    let keep_alive = query
        .keep_alive
        .as_deref()
        .is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"));
    Ok(PairingRequest::new(number).keep_alive(keep_alive))
}

async fn request_code(State(state): State<AppState>, Query(query): Query<CodeQuery>) -> Response {
    let request = match pairing_request(query) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let mut events = state.orchestrator.start(request);
    match events.next().await {
        Some(event @ PairingEvent::Error { .. }) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(event)).into_response()
        }
        Some(event) => Json(event).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "Pairing ended without a result".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn stream_code(State(state): State<AppState>, Query(query): Query<CodeQuery>) -> Response {
    let request = match pairing_request(query) {
        Ok(request) => request,
        Err(response) => return response,
    };

    let stream = state
        .orchestrator
        .start(request)
        .into_stream()
        .map(|event| {
            let name = match &event {
                PairingEvent::Code { .. } => "code",
                PairingEvent::Session { .. } => "session",
                PairingEvent::Error { .. } => "error",
            };
            Event::default().event(name).json_data(&event)
        });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn validate_session(
    State(state): State<AppState>,
    Query(query): Query<ValidateQuery>,
) -> Response {
    let Some(session_id) = query
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ValidateBody {
                valid: false,
                error: Some(SESSION_ID_REQUIRED.to_string()),
            }),
        )
            .into_response();
    };

    match state.orchestrator.store().download_bundle(session_id).await {
        Ok(_) => Json(ValidateBody {
            valid: true,
            error: None,
        })
        .into_response(),
        Err(e) => {
            let status = match &e {
                BackendError::InvalidSessionId { .. } => StatusCode::BAD_REQUEST,
                BackendError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                BackendError::Status { status: 404, .. } | BackendError::MissingData { .. } => {
                    StatusCode::NOT_FOUND
                }
                _ => StatusCode::BAD_GATEWAY,
            };
            (
                status,
                Json(ValidateBody {
                    valid: false,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}
