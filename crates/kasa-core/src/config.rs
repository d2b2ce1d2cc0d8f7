//! Configuration for the broker, daemons, session workers and actors.
//!
//! Loaded from TOML. Every field has a default so an empty (or missing)
//! file yields a working configuration. Durations are milliseconds.
//!
//! ```toml
//! [broker]
//! client_endpoint = "0.0.0.0:9800"
//! daemon_endpoint = "0.0.0.0:9801"
//!
//! [daemon]
//! identity = "GATT"
//!
//! [session]
//! idle_timeout_ms = 10000
//! connect_retries = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "KASA_CONFIG";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KasaConfig {
    pub broker: BrokerConfig,
    pub daemon: DaemonConfig,
    pub session: SessionConfig,
    pub actors: ActorConfig,
}

/// Broker endpoints and request bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address for clients.
    pub client_endpoint: String,
    /// Listen address for daemons.
    pub daemon_endpoint: String,
    /// How long a client waits for a daemon reply before getting `timeout`.
    pub request_timeout_ms: u64,
    /// Maximum size of a single framed message.
    pub max_message_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            client_endpoint: "0.0.0.0:9800".to_string(),
            daemon_endpoint: "0.0.0.0:9801".to_string(),
            request_timeout_ms: 30_000,
            max_message_size: 1_048_576,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Daemon identity and broker link behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Identity registered at the broker.
    pub identity: String,
    /// Broker daemon-facing endpoint to connect to.
    pub broker_endpoint: String,
    /// Spawn a session on first device command instead of answering `unknown_device`.
    pub auto_connect: bool,
    /// First delay before re-dialing a lost broker.
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound for the broker re-dial backoff.
    pub reconnect_max_delay_ms: u64,
    /// Scan window handed to the discovery collaborator.
    pub discovery_window_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            identity: "GATT".to_string(),
            broker_endpoint: "127.0.0.1:9801".to_string(),
            auto_connect: false,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            discovery_window_ms: 3_000,
        }
    }
}

impl DaemonConfig {
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms)
    }
}

/// Session worker timing and retry bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle wait on the command channel; doubles as the liveness interval.
    pub idle_timeout_ms: u64,
    /// Handshake attempts before reporting `connect_failed`.
    pub connect_retries: u32,
    /// Per-attempt connect deadline.
    pub connect_timeout_ms: u64,
    /// Deadline for any single device call.
    pub command_timeout_ms: u64,
    /// Default settle time between enable and read in `read_value`.
    pub read_value_delay_ms: u64,
    /// Largest settle time a `read_value` request may ask for.
    pub max_read_value_delay_ms: u64,
    /// Queue depth of a worker's private command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10_000,
            connect_retries: 3,
            connect_timeout_ms: 3_000,
            command_timeout_ms: 10_000,
            read_value_delay_ms: 300,
            max_read_value_delay_ms: 10_000,
            command_buffer: 16,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn read_value_delay(&self) -> Duration {
        Duration::from_millis(self.read_value_delay_ms)
    }

    pub fn max_read_value_delay(&self) -> Duration {
        Duration::from_millis(self.max_read_value_delay_ms)
    }
}

/// Actor framework tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Buffered items per subscriber before a publishing actor waits for it.
    pub channel_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl KasaConfig {
    /// Parses configuration from a TOML string and validates it.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: KasaConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the first location that exists:
    /// the explicit path, `$KASA_CONFIG`, then the user config directory.
    ///
    /// An explicit path that does not exist is an error; the implicit
    /// locations silently fall back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }

        let candidate = std::env::var_os(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .or_else(default_config_path);

        match candidate {
            Some(path) if path.exists() => Self::load_file(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&contents)
    }

    /// Rejects values that would make the system unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.connect_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "session.connect_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.session.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "session.idle_timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.session.command_buffer == 0 {
            return Err(ConfigError::Invalid {
                field: "session.command_buffer",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.session.read_value_delay_ms > self.session.max_read_value_delay_ms {
            return Err(ConfigError::Invalid {
                field: "session.read_value_delay_ms",
                reason: format!(
                    "default {}ms exceeds max_read_value_delay_ms {}ms",
                    self.session.read_value_delay_ms, self.session.max_read_value_delay_ms
                ),
            });
        }
        if self.actors.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "actors.channel_capacity",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.daemon.identity.is_empty() || self.daemon.identity.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "daemon.identity",
                reason: format!("'{}' must be a single non-empty token", self.daemon.identity),
            });
        }
        Ok(())
    }
}

/// Returns `<config dir>/kasa/config.toml`, if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("kasa").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_constants() {
        let config = KasaConfig::default();
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.connect_retries, 3);
        assert_eq!(config.session.read_value_delay(), Duration::from_millis(300));
        assert_eq!(config.session.max_read_value_delay(), Duration::from_secs(10));
        assert_eq!(config.broker.client_endpoint, "0.0.0.0:9800");
        assert_eq!(config.broker.daemon_endpoint, "0.0.0.0:9801");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = KasaConfig::from_toml_str("").unwrap();
        assert_eq!(config, KasaConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = KasaConfig::from_toml_str(
            r#"
            [daemon]
            identity = "WeMo"
            auto_connect = true

            [session]
            idle_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.identity, "WeMo");
        assert!(config.daemon.auto_connect);
        assert_eq!(config.session.idle_timeout(), Duration::from_millis(250));
        assert_eq!(config.session.connect_retries, 3);
    }

    #[test]
    fn test_zero_retries_rejected() {
        let result = KasaConfig::from_toml_str("[session]\nconnect_retries = 0\n");
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "session.connect_retries",
                ..
            })
        ));
    }

    #[test]
    fn test_default_settle_above_max_rejected() {
        let result = KasaConfig::from_toml_str(
            "[session]\nread_value_delay_ms = 500\nmax_read_value_delay_ms = 100\n",
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "session.read_value_delay_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_identity_with_whitespace_rejected() {
        let result = KasaConfig::from_toml_str("[daemon]\nidentity = \"We Mo\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nrequest_timeout_ms = 1500").unwrap();

        let config = KasaConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.broker.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = KasaConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
