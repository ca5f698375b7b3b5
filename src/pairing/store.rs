//! Session-scoped credential storage.
//!
//! Each pairing session owns one directory under the sessions root. The
//! messaging client's save hook keeps `creds.json` current; once the link is
//! confirmed the blob is read once and shipped to the remote backend.
//! Backend trouble never fails a pairing: the caller always gets a usable id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::{BackendError, FilesystemError};
use crate::pairing::id::SessionIdGenerator;
use crate::transport::auth_state::creds_path;

/// Remote store for credential bundles.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Store `creds` under `creds_id`.
    async fn upload(&self, creds_id: &str, creds: &Value) -> Result<(), BackendError>;

    /// Fetch the bundle stored under `creds_id`.
    async fn download(&self, creds_id: &str) -> Result<Value, BackendError>;
}

#[derive(Serialize)]
struct UploadRequest<'a> {
    #[serde(rename = "credsId")]
    creds_id: &'a str,
    #[serde(rename = "credsData")]
    creds_data: &'a Value,
}

#[derive(Deserialize)]
struct DownloadResponse {
    #[serde(rename = "credsData", default)]
    creds_data: Option<Value>,
}

/// HTTP credential backend authenticated with an `x-api-key` header.
pub struct HttpCredentialBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl HttpCredentialBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> Result<String, BackendError> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or(BackendError::NotConfigured)?;
        Ok(format!("{}{}", base, path))
    }
}

#[async_trait]
impl CredentialBackend for HttpCredentialBackend {
    async fn upload(&self, creds_id: &str, creds: &Value) -> Result<(), BackendError> {
        let url = self.endpoint(&self.config.upload_path)?;
        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .timeout(self.config.upload_timeout)
            .json(&UploadRequest {
                creds_id,
                creds_data: creds,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn download(&self, creds_id: &str) -> Result<Value, BackendError> {
        let url = self.endpoint(&format!(
            "{}/{}",
            self.config.download_path.trim_end_matches('/'),
            urlencoding::encode(creds_id)
        ))?;
        let response = self
            .client
            .get(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .timeout(self.config.download_timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: DownloadResponse = response.json().await?;
        match payload.creds_data {
            // Some backends store the blob as a JSON-encoded string.
            Some(Value::String(raw)) => Ok(serde_json::from_str(&raw)?),
            Some(Value::Null) | None => Err(BackendError::MissingData {
                id: creds_id.to_string(),
            }),
            Some(other) => Ok(other),
        }
    }
}

/// Credential material captured for a session.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    /// Id the bundle is (or would have been) stored under.
    pub local_id: String,
    /// The blob as read from disk, if there was one.
    pub blob: Option<Value>,
    /// Whether the backend accepted the upload.
    pub uploaded: bool,
}

/// Manages session directories and hands bundles to the backend.
pub struct CredentialStore {
    root: PathBuf,
    backend: Arc<dyn CredentialBackend>,
    ids: SessionIdGenerator,
}

impl CredentialStore {
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn CredentialBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
            ids: SessionIdGenerator::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by session `id`.
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Create the directory for session `id` if absent. Idempotent.
    pub async fn prepare_directory(&self, id: &str) -> Result<PathBuf, FilesystemError> {
        let dir = self.session_dir(id);
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(FilesystemError::CreateDir {
                path: dir,
                reason: "session id is not a plain directory name".to_string(),
            });
        }

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FilesystemError::CreateDir {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        Ok(dir)
    }

    /// Read session `id`'s credential blob and upload it under a fresh id.
    ///
    /// Always returns a well-formed id. A missing or unreadable blob skips the
    /// network entirely; a backend failure is logged and the local id is
    /// returned with `uploaded = false`.
    pub async fn upload_bundle(&self, id: &str) -> CredentialBundle {
        let local_id = self.ids.generate();
        let path = creds_path(&self.session_dir(id));

        let blob = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(blob) => blob,
                Err(e) => {
                    tracing::warn!(session_id = id, path = %path.display(), error = %e, "Credential blob is not valid JSON, using local id");
                    return CredentialBundle {
                        local_id,
                        blob: None,
                        uploaded: false,
                    };
                }
            },
            Err(e) => {
                tracing::warn!(session_id = id, path = %path.display(), error = %e, "No credential blob to upload, using local id");
                return CredentialBundle {
                    local_id,
                    blob: None,
                    uploaded: false,
                };
            }
        };

        let uploaded = match self.backend.upload(&local_id, &blob).await {
            Ok(()) => {
                tracing::info!(session_id = id, creds_id = %local_id, "Uploaded credential bundle");
                true
            }
            Err(e) => {
                tracing::warn!(session_id = id, creds_id = %local_id, error = %e, "Credential upload failed, keeping local id");
                false
            }
        };

        CredentialBundle {
            local_id,
            blob: Some(blob),
            uploaded,
        }
    }

    /// Fetch a previously uploaded bundle.
    ///
    /// Ids this service could not have issued are rejected without a request.
    pub async fn download_bundle(&self, id: &str) -> Result<Value, BackendError> {
        if !self.ids.recognizes(id) {
            return Err(BackendError::InvalidSessionId {
                id: id.to_string(),
                prefix: self.ids.prefix().to_string(),
            });
        }
        self.backend.download(id).await.inspect_err(|e| {
            tracing::warn!(creds_id = id, error = %e, "Credential download failed");
        })
    }

    /// Recursively delete `path`.
    ///
    /// Returns `true` if this call removed it, `false` if it was already gone
    /// or could not be removed. Never fails; safe to call repeatedly and from
    /// several cleanup paths at once.
    pub async fn remove_directory(&self, path: &Path) -> bool {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Removed session directory");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove session directory");
                false
            }
        }
    }
}
