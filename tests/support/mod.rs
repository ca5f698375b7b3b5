//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};
use tempfile::TempDir;

use pairgate::config::{BackendConfig, PairingConfig};
use pairgate::pairing::{
    CodeSink, CredentialStore, HttpCredentialBackend, PairingOrchestrator, RetryPolicy,
};
use pairgate::transport::scripted::ScriptedTransport;

pub const API_KEY: &str = "test-key";

pub type Uploads = Arc<Mutex<Vec<Value>>>;

/// Pairing settings with short delays so flows finish in milliseconds.
pub fn fast_pairing(root: &TempDir) -> PairingConfig {
    PairingConfig {
        sessions_root: root.path().to_path_buf(),
        timeout: Duration::from_secs(5),
        code_request_delay: Duration::from_millis(5),
        close_grace: Duration::from_millis(5),
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 5,
            max_delay_ms: 20,
            jitter_factor: 0.0,
        },
        ..PairingConfig::default()
    }
}

pub fn backend_at(base_url: Option<String>) -> BackendConfig {
    BackendConfig {
        base_url,
        api_key: SecretString::from(API_KEY.to_string()),
        upload_timeout: Duration::from_secs(2),
        download_timeout: Duration::from_secs(2),
        ..BackendConfig::default()
    }
}

pub fn orchestrator(
    root: &TempDir,
    transport: Arc<ScriptedTransport>,
    backend: BackendConfig,
    pairing: PairingConfig,
) -> PairingOrchestrator {
    let store = Arc::new(CredentialStore::new(
        root.path(),
        Arc::new(HttpCredentialBackend::new(backend)),
    ));
    PairingOrchestrator::new(transport, store, pairing)
}

/// Sink that records every code it is handed.
pub fn recording_sink() -> (Arc<dyn CodeSink>, Arc<Mutex<Vec<String>>>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&codes);
    let sink: Arc<dyn CodeSink> = Arc::new(move |code: &str| {
        seen.lock().unwrap().push(code.to_string());
        Ok(())
    });
    (sink, codes)
}

/// Number of entries under the sessions root.
pub fn session_dirs(root: &TempDir) -> usize {
    std::fs::read_dir(root.path()).map(|d| d.count()).unwrap_or(0)
}

/// Poll `check` for up to two seconds.
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Throwaway credential backend on 127.0.0.1:0.
///
/// Uploads require the test API key. Downloads return `credsData` as a
/// JSON-encoded string.
pub async fn mock_backend() -> (String, Uploads) {
    let uploads: Uploads = Arc::new(Mutex::new(Vec::new()));

    let app = Router::new()
        .route("/api/uploadCreds", post(upload))
        .route("/api/downloadCreds/{id}", get(download))
        .with_state(Arc::clone(&uploads));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), uploads)
}

async fn upload(
    State(uploads): State<Uploads>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if headers.get("x-api-key").and_then(|v| v.to_str().ok()) != Some(API_KEY) {
        return StatusCode::UNAUTHORIZED;
    }
    uploads.lock().unwrap().push(body);
    StatusCode::OK
}

async fn download(State(uploads): State<Uploads>, Path(id): Path<String>) -> impl IntoResponse {
    let found = uploads
        .lock()
        .unwrap()
        .iter()
        .find(|u| u["credsId"] == id.as_str())
        .map(|u| u["credsData"].to_string());
    match found {
        Some(raw) => (StatusCode::OK, Json(json!({ "credsData": raw }))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))),
    }
}
