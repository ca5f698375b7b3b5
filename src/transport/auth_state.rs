//! Directory-backed auth state.
//!
//! A session directory holds the transport's serialized credentials in
//! `creds.json`. The core treats the blob as opaque JSON; only the
//! `registered` flag is inspected.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{FilesystemError, TransportError};

/// File name of the credential blob inside a session directory.
pub const CREDS_FILE: &str = "creds.json";

/// Auth state loaded from a session directory.
#[derive(Debug, Clone)]
pub struct AuthState {
    dir: PathBuf,
    creds: Option<Value>,
}

impl AuthState {
    /// Load the state stored in `dir`. A missing file yields fresh state.
    pub async fn load(dir: &Path) -> Result<Self, TransportError> {
        let path = creds_path(dir);
        let creds = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Some(serde_json::from_str(&raw).map_err(|e| TransportError::AuthState {
                path: path.clone(),
                reason: e.to_string(),
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(TransportError::AuthState {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            creds,
        })
    }

    /// Fresh state for `dir` without touching the filesystem.
    pub fn fresh(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            creds: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The stored credential blob, if any.
    pub fn creds(&self) -> Option<&Value> {
        self.creds.as_ref()
    }

    /// Whether the stored identity has already been linked.
    pub fn is_registered(&self) -> bool {
        self.creds
            .as_ref()
            .and_then(|c| c.get("registered"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Save hook writing credential updates back into this directory.
    pub fn saver(&self) -> CredsSaver {
        CredsSaver {
            path: creds_path(&self.dir),
        }
    }
}

/// Writes credential blobs to a session directory.
#[derive(Debug, Clone)]
pub struct CredsSaver {
    path: PathBuf,
}

impl CredsSaver {
    /// Persist `creds`, replacing the previous blob atomically.
    pub async fn save(&self, creds: &Value) -> Result<(), FilesystemError> {
        let write_err = |e: std::io::Error| FilesystemError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let body = serde_json::to_vec_pretty(creds).map_err(|e| FilesystemError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Path of the credential blob inside `dir`.
pub fn creds_path(dir: &Path) -> PathBuf {
    dir.join(CREDS_FILE)
}
