//! Client Configuration Settings
//!
//! Configuration types for the quote stream client, loaded from environment
//! variables. Unparseable numbers fall back to their defaults; structural
//! problems (bad URL schemes, malformed watchlist keys) are errors.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::instrument::{InstrumentError, InstrumentKey};
use crate::infrastructure::stream::{HeartbeatConfig, ManagerConfig, ReconnectConfig};

/// Streaming endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// WebSocket endpoint (`ws://` or `wss://`). `None` disables streaming.
    pub url: Option<String>,
    /// Update batching window.
    pub batch_window: Duration,
    /// Grace delay between context-switch unsubscribes and subscribes.
    pub grace_delay: Duration,
    /// Interval between market-status checks while the market is closed.
    pub market_recheck: Duration,
    /// Keepalive pings and silence detection.
    pub heartbeat: HeartbeatConfig,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            batch_window: Duration::from_millis(120),
            grace_delay: Duration::from_millis(250),
            market_recheck: Duration::from_secs(60),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Request/response collaborator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorSettings {
    /// Market-status endpoint. Without one the market is assumed open.
    pub market_status_url: Option<String>,
    /// Snapshot-quote endpoint. Without one there is no fallback.
    pub snapshot_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            market_status_url: None,
            snapshot_url: None,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Streaming endpoint settings.
    pub stream: StreamSettings,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Collaborator endpoints.
    pub collaborators: CollaboratorSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Persistence cache file.
    pub cache_path: PathBuf,
    /// Instruments to stream at startup.
    pub watchlist: Vec<InstrumentKey>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            reconnect: ReconnectConfig::default(),
            collaborators: CollaboratorSettings::default(),
            server: ServerSettings::default(),
            cache_path: PathBuf::from(".quote-cache.json"),
            watchlist: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL has the wrong scheme, the batch window is
    /// zero, or a watchlist entry is not a canonical instrument key.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let stream = StreamSettings {
            url: env.url("QUOTE_STREAM_URL", &["ws", "wss"])?,
            batch_window: env.millis("QUOTE_STREAM_BATCH_WINDOW_MS", defaults.stream.batch_window),
            grace_delay: env.millis("QUOTE_STREAM_GRACE_MS", defaults.stream.grace_delay),
            market_recheck: env.secs(
                "QUOTE_STREAM_MARKET_RECHECK_SECS",
                defaults.stream.market_recheck,
            ),
            heartbeat: HeartbeatConfig::new(
                env.secs(
                    "QUOTE_STREAM_PING_INTERVAL_SECS",
                    defaults.stream.heartbeat.ping_interval,
                ),
                env.secs(
                    "QUOTE_STREAM_PONG_TIMEOUT_SECS",
                    defaults.stream.heartbeat.pong_timeout,
                ),
            ),
        };
        if stream.batch_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "QUOTE_STREAM_BATCH_WINDOW_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        let reconnect = ReconnectConfig {
            initial_delay: env.millis(
                "QUOTE_STREAM_RECONNECT_INITIAL_MS",
                defaults.reconnect.initial_delay,
            ),
            max_delay: env.millis("QUOTE_STREAM_RECONNECT_MAX_MS", defaults.reconnect.max_delay),
            multiplier: env.parse(
                "QUOTE_STREAM_RECONNECT_MULTIPLIER",
                defaults.reconnect.multiplier,
            ),
            jitter_factor: env
                .parse("QUOTE_STREAM_RECONNECT_JITTER", defaults.reconnect.jitter_factor)
                .clamp(0.0, 1.0),
            max_attempts: env.parse(
                "QUOTE_STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.reconnect.max_attempts,
            ),
        };

        let collaborators = CollaboratorSettings {
            market_status_url: env.url("QUOTE_STREAM_MARKET_STATUS_URL", &["http", "https"])?,
            snapshot_url: env.url("QUOTE_STREAM_SNAPSHOT_URL", &["http", "https"])?,
            timeout: env.millis(
                "QUOTE_STREAM_COLLABORATOR_TIMEOUT_MS",
                defaults.collaborators.timeout,
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("QUOTE_STREAM_HEALTH_PORT", defaults.server.health_port),
        };

        let cache_path = env
            .get("QUOTE_STREAM_CACHE_PATH")
            .map_or(defaults.cache_path, PathBuf::from);

        let watchlist = env
            .get("QUOTE_STREAM_WATCHLIST")
            .map(|raw| parse_watchlist(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            stream,
            reconnect,
            collaborators,
            server,
            cache_path,
            watchlist,
        })
    }

    /// Connection manager settings derived from this configuration.
    #[must_use]
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            url: self.stream.url.clone(),
            batch_window: self.stream.batch_window,
            grace_delay: self.stream.grace_delay,
            reconnect: self.reconnect.clone(),
            market_recheck: self.stream.market_recheck,
            heartbeat: self.stream.heartbeat.clone(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// URL is missing a supported scheme.
    #[error("{key} must use one of {expected}: {value}")]
    InvalidUrl {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Accepted schemes.
        expected: String,
    },
    /// Value is out of range.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Watchlist entry is not a canonical key.
    #[error("invalid watchlist entry {entry:?}: {source}")]
    InvalidWatchlistKey {
        /// Offending entry.
        entry: String,
        /// Parse failure.
        #[source]
        source: InstrumentError,
    },
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn url(&self, key: &str, schemes: &[&str]) -> Result<Option<String>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let valid = value
            .split_once("://")
            .is_some_and(|(scheme, rest)| {
                !rest.is_empty() && schemes.iter().any(|s| scheme.eq_ignore_ascii_case(s))
            });
        if valid {
            Ok(Some(value))
        } else {
            Err(ConfigError::InvalidUrl {
                key: key.to_string(),
                value,
                expected: schemes.join("/"),
            })
        }
    }
}

fn parse_watchlist(raw: &str) -> Result<Vec<InstrumentKey>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<InstrumentKey>()
                .map_err(|source| ConfigError::InvalidWatchlistKey {
                    entry: entry.to_string(),
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ClientConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert!(config.stream.url.is_none());
        assert_eq!(config.stream.batch_window, Duration::from_millis(120));
        assert_eq!(config.stream.grace_delay, Duration::from_millis(250));
        assert_eq!(config.stream.market_recheck, Duration::from_secs(60));
        assert_eq!(config.stream.heartbeat, HeartbeatConfig::default());
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.collaborators.timeout, Duration::from_secs(5));
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.cache_path, PathBuf::from(".quote-cache.json"));
        assert!(config.watchlist.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("QUOTE_STREAM_URL", "wss://feed.example.com/quotes"),
            ("QUOTE_STREAM_SNAPSHOT_URL", "https://api.example.com/quote"),
            ("QUOTE_STREAM_BATCH_WINDOW_MS", "50"),
            ("QUOTE_STREAM_RECONNECT_MAX_MS", "10000"),
            ("QUOTE_STREAM_MAX_RECONNECT_ATTEMPTS", "5"),
            ("QUOTE_STREAM_PING_INTERVAL_SECS", "0"),
            ("QUOTE_STREAM_HEALTH_PORT", "not-a-port"),
            ("QUOTE_STREAM_WATCHLIST", "NSE:NIFTY 50:cash, NIFTY|2024-06-27|CALL|22000"),
        ])
        .unwrap();

        assert_eq!(config.stream.url.as_deref(), Some("wss://feed.example.com/quotes"));
        assert_eq!(config.stream.batch_window, Duration::from_millis(50));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.watchlist.len(), 2);
        assert!(config.watchlist[1].is_derivative());

        let manager = config.manager_config();
        assert_eq!(manager.url, config.stream.url);
        assert_eq!(manager.batch_window, Duration::from_millis(50));
        assert!(!manager.heartbeat.is_enabled());
        assert_eq!(manager.heartbeat.pong_timeout, Duration::from_secs(20));
    }

    #[test]
    fn rejects_wrong_scheme() {
        let err = load(&[("QUOTE_STREAM_URL", "https://feed.example.com")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let err = load(&[("QUOTE_STREAM_MARKET_STATUS_URL", "ws://status")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn rejects_zero_batch_window() {
        let err = load(&[("QUOTE_STREAM_BATCH_WINDOW_MS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_malformed_watchlist_entry() {
        let err = load(&[("QUOTE_STREAM_WATCHLIST", "NSE:TCS:cash,garbage")]).unwrap_err();
        let ConfigError::InvalidWatchlistKey { entry, .. } = err else {
            panic!("expected watchlist error");
        };
        assert_eq!(entry, "garbage");
    }
}
