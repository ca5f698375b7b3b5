//! Environment-driven configuration.
//!
//! Values come from the process environment, optionally seeded from a `.env`
//! file. Every knob has a default; only malformed values are errors.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pairing::retry::RetryPolicy;

/// Follow-up text sent after the credential id message.
pub const DEFAULT_BRAND_MESSAGE: &str = "Your session is linked.\n\
Keep the id above private: anyone holding it can restore this session.";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub pairing: PairingConfig,
    pub bridge: BridgeConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

/// Remote credential backend settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL without trailing slash. `None` disables uploads and downloads.
    pub base_url: Option<String>,
    /// Sent as the `x-api-key` header.
    pub api_key: SecretString,
    pub upload_path: String,
    pub download_path: String,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: SecretString::from(String::new()),
            upload_path: "/api/uploadCreds".to_string(),
            download_path: "/api/downloadCreds".to_string(),
            upload_timeout: Duration::from_secs(8),
            download_timeout: Duration::from_secs(10),
        }
    }
}

/// Pairing session settings.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Directory holding one sub-directory per live session.
    pub sessions_root: PathBuf,
    /// Deadline for a single session.
    pub timeout: Duration,
    /// Pause between client construction and the pairing code request.
    pub code_request_delay: Duration,
    /// Pause between announcing the credential id and closing the transport.
    pub close_grace: Duration,
    /// Restart policy for keep-alive requests.
    pub retry: RetryPolicy,
    /// Capacity of the per-session credential persistence queue.
    pub persist_queue_capacity: usize,
    pub brand_message: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            sessions_root: PathBuf::from("temp"),
            timeout: Duration::from_secs(120),
            code_request_delay: Duration::from_millis(1_500),
            close_grace: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            persist_queue_capacity: 16,
            brand_message: DEFAULT_BRAND_MESSAGE.to_string(),
        }
    }
}

/// Messaging bridge connection settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".to_string(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);

        let bind: IpAddr = env.parse_or("BIND_ADDRESS", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = env.parse_or("PORT", 8000)?;

        let backend_defaults = BackendConfig::default();
        let base_url = match env.get("SESSIONS_API_URL") {
            Some(raw) => {
                url::Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: "SESSIONS_API_URL".to_string(),
                    message: e.to_string(),
                })?;
                Some(raw.trim_end_matches('/').to_string())
            }
            None => None,
        };
        let backend = BackendConfig {
            base_url,
            api_key: SecretString::from(env.get("SESSIONS_API_KEY").unwrap_or_default()),
            upload_path: env
                .get("SESSIONS_UPLOAD_PATH")
                .unwrap_or(backend_defaults.upload_path),
            download_path: env
                .get("SESSIONS_DOWNLOAD_PATH")
                .unwrap_or(backend_defaults.download_path),
            upload_timeout: env.millis_or("SESSIONS_UPLOAD_TIMEOUT_MS", backend_defaults.upload_timeout)?,
            download_timeout: env.millis_or(
                "SESSIONS_DOWNLOAD_TIMEOUT_MS",
                backend_defaults.download_timeout,
            )?,
        };

        let pairing_defaults = PairingConfig::default();
        let retry_defaults = RetryPolicy::default();
        let max_attempts: u32 = env.parse_or("PAIRING_MAX_ATTEMPTS", retry_defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PAIRING_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let pairing = PairingConfig {
            sessions_root: env
                .get("SESSIONS_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(pairing_defaults.sessions_root),
            timeout: Duration::from_secs(
                env.parse_or("PAIRING_TIMEOUT_SECS", pairing_defaults.timeout.as_secs())?,
            ),
            code_request_delay: env
                .millis_or("PAIRING_CODE_DELAY_MS", pairing_defaults.code_request_delay)?,
            close_grace: env.millis_or("PAIRING_CLOSE_GRACE_MS", pairing_defaults.close_grace)?,
            retry: RetryPolicy {
                max_attempts,
                base_delay_ms: env.parse_or("PAIRING_RETRY_BASE_MS", retry_defaults.base_delay_ms)?,
                max_delay_ms: env.parse_or("PAIRING_RETRY_MAX_MS", retry_defaults.max_delay_ms)?,
                jitter_factor: retry_defaults.jitter_factor,
            },
            persist_queue_capacity: pairing_defaults.persist_queue_capacity,
            brand_message: env
                .get("PAIRING_BRAND_MESSAGE")
                .unwrap_or(pairing_defaults.brand_message),
        };

        let bridge_defaults = BridgeConfig::default();
        let bridge = BridgeConfig {
            url: env.get("BRIDGE_URL").unwrap_or(bridge_defaults.url),
            connect_timeout: env
                .millis_or("BRIDGE_CONNECT_TIMEOUT_MS", bridge_defaults.connect_timeout)?,
            request_timeout: env
                .millis_or("BRIDGE_REQUEST_TIMEOUT_MS", bridge_defaults.request_timeout)?,
        };

        Ok(Self {
            server: ServerConfig {
                addr: SocketAddr::new(bind, port),
            },
            backend,
            pairing,
            bridge,
        })
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    /// Non-empty value for `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse_or(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server.addr.port(), 8000);
        assert!(config.backend.base_url.is_none());
        assert_eq!(config.backend.upload_timeout, Duration::from_secs(8));
        assert_eq!(config.pairing.timeout, Duration::from_secs(120));
        assert_eq!(config.pairing.code_request_delay, Duration::from_millis(1_500));
        assert_eq!(config.pairing.sessions_root, PathBuf::from("temp"));
        assert_eq!(config.bridge.url, "ws://127.0.0.1:8787");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PORT", "9100"),
            ("SESSIONS_API_URL", "https://sessions.example.com/"),
            ("SESSIONS_API_KEY", "k3y"),
            ("PAIRING_TIMEOUT_SECS", "30"),
            ("PAIRING_MAX_ATTEMPTS", "2"),
            ("SESSIONS_TEMP_DIR", "/tmp/pairgate"),
        ])
        .unwrap();
        assert_eq!(config.server.addr.port(), 9100);
        assert_eq!(
            config.backend.base_url.as_deref(),
            Some("https://sessions.example.com")
        );
        assert_eq!(config.backend.api_key.expose_secret(), "k3y");
        assert_eq!(config.pairing.timeout, Duration::from_secs(30));
        assert_eq!(config.pairing.retry.max_attempts, 2);
        assert_eq!(config.pairing.sessions_root, PathBuf::from("/tmp/pairgate"));
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let config = load(&[("PORT", "  "), ("SESSIONS_API_URL", "")]).unwrap();
        assert_eq!(config.server.addr.port(), 8000);
        assert!(config.backend.base_url.is_none());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[("PAIRING_TIMEOUT_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "PAIRING_TIMEOUT_SECS"),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_backend_url_is_rejected() {
        let err = load(&[("SESSIONS_API_URL", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let err = load(&[("PAIRING_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }
}
