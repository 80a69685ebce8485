//! Configuration for a live session.
//!
//! Loads configuration from environment variables with sensible defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;
use tikit_realtime_runtime::retry::{BackoffPolicy, duration_ms};

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the session cannot run with
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Live session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LiveConfig {
    /// Channel lifecycle settings
    pub connection: ConnectionConfig,
    /// Offline action queue settings
    pub queue: QueueConfig,
    /// Per-topic view settings
    pub views: ViewConfig,
    /// Capacity of the outbound event broadcast
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

const fn default_event_buffer() -> usize {
    256
}

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound for the open + authentication handshake
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Time between liveness probes while connected
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// How long a probe may stay unanswered
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Reconnect delays and attempt budget
    pub reconnect: BackoffPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            reconnect: BackoffPolicy::new(),
        }
    }
}

/// Offline action queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Retry delays and per-action attempt budget
    pub retry: BackoffPolicy,
    /// Upper bound for one dispatch attempt
    #[serde(with = "duration_ms")]
    pub dispatch_timeout: Duration,
    /// Number of failed actions kept for inspection
    pub failed_history: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: BackoffPolicy::builder()
                .max_attempts(5)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .build(),
            dispatch_timeout: Duration::from_secs(15),
            failed_history: 50,
        }
    }
}

/// View configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Ranks kept in a leaderboard view
    pub leaderboard_max_ranks: usize,
    /// Notifications kept in a notification view
    pub notification_max_retained: usize,
    /// Broadcast messages kept per channel
    pub broadcast_max_retained: usize,
    /// Retry policy for snapshot fetches that hit a transport error
    pub fetch_retry: BackoffPolicy,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            leaderboard_max_ranks: 10,
            notification_max_retained: 50,
            broadcast_max_retained: 100,
            fetch_retry: BackoffPolicy::builder()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(5))
                .build(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_parse::<u64>(name).map_or(default, Duration::from_millis)
}

impl LiveConfig {
    /// Load configuration from `TIKIT_LIVE_*` environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults. Durations are
    /// given in milliseconds.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            connection: ConnectionConfig {
                handshake_timeout: env_millis(
                    "TIKIT_LIVE_HANDSHAKE_TIMEOUT_MS",
                    defaults.connection.handshake_timeout,
                ),
                heartbeat_interval: env_millis(
                    "TIKIT_LIVE_HEARTBEAT_INTERVAL_MS",
                    defaults.connection.heartbeat_interval,
                ),
                heartbeat_timeout: env_millis(
                    "TIKIT_LIVE_HEARTBEAT_TIMEOUT_MS",
                    defaults.connection.heartbeat_timeout,
                ),
                reconnect: BackoffPolicy {
                    max_attempts: env_parse("TIKIT_LIVE_RECONNECT_MAX_ATTEMPTS")
                        .unwrap_or(defaults.connection.reconnect.max_attempts),
                    initial_delay: env_millis(
                        "TIKIT_LIVE_RECONNECT_INITIAL_DELAY_MS",
                        defaults.connection.reconnect.initial_delay,
                    ),
                    max_delay: env_millis(
                        "TIKIT_LIVE_RECONNECT_MAX_DELAY_MS",
                        defaults.connection.reconnect.max_delay,
                    ),
                    multiplier: env_parse("TIKIT_LIVE_RECONNECT_MULTIPLIER")
                        .unwrap_or(defaults.connection.reconnect.multiplier),
                    jitter: env_parse("TIKIT_LIVE_RECONNECT_JITTER")
                        .unwrap_or(defaults.connection.reconnect.jitter),
                },
            },
            queue: QueueConfig {
                retry: BackoffPolicy {
                    max_attempts: env_parse("TIKIT_LIVE_QUEUE_MAX_ATTEMPTS")
                        .unwrap_or(defaults.queue.retry.max_attempts),
                    initial_delay: env_millis(
                        "TIKIT_LIVE_QUEUE_RETRY_INITIAL_DELAY_MS",
                        defaults.queue.retry.initial_delay,
                    ),
                    ..defaults.queue.retry
                },
                dispatch_timeout: env_millis(
                    "TIKIT_LIVE_DISPATCH_TIMEOUT_MS",
                    defaults.queue.dispatch_timeout,
                ),
                failed_history: env_parse("TIKIT_LIVE_FAILED_HISTORY")
                    .unwrap_or(defaults.queue.failed_history),
            },
            views: ViewConfig {
                leaderboard_max_ranks: env_parse("TIKIT_LIVE_LEADERBOARD_MAX_RANKS")
                    .unwrap_or(defaults.views.leaderboard_max_ranks),
                notification_max_retained: env_parse("TIKIT_LIVE_NOTIFICATION_MAX_RETAINED")
                    .unwrap_or(defaults.views.notification_max_retained),
                broadcast_max_retained: env_parse("TIKIT_LIVE_BROADCAST_MAX_RETAINED")
                    .unwrap_or(defaults.views.broadcast_max_retained),
                fetch_retry: BackoffPolicy {
                    max_attempts: env_parse("TIKIT_LIVE_FETCH_MAX_ATTEMPTS")
                        .unwrap_or(defaults.views.fetch_retry.max_attempts),
                    ..defaults.views.fetch_retry
                },
            },
            event_buffer: env_parse("TIKIT_LIVE_EVENT_BUFFER").unwrap_or(defaults.event_buffer),
        }
    }

    /// Check that the configuration can drive a session.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = &self.connection;
        if connection.handshake_timeout.is_zero() {
            return Err(ConfigError::invalid("connection.handshake_timeout", "must be non-zero"));
        }
        if connection.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid("connection.heartbeat_interval", "must be non-zero"));
        }
        if connection.heartbeat_timeout.is_zero()
            || connection.heartbeat_timeout >= connection.heartbeat_interval
        {
            return Err(ConfigError::invalid(
                "connection.heartbeat_timeout",
                "must be non-zero and shorter than the heartbeat interval",
            ));
        }

        validate_policy("connection.reconnect", &connection.reconnect)?;
        validate_policy("queue.retry", &self.queue.retry)?;
        validate_policy("views.fetch_retry", &self.views.fetch_retry)?;

        if self.queue.dispatch_timeout.is_zero() {
            return Err(ConfigError::invalid("queue.dispatch_timeout", "must be non-zero"));
        }
        if self.views.leaderboard_max_ranks == 0 {
            return Err(ConfigError::invalid("views.leaderboard_max_ranks", "must be at least 1"));
        }
        if self.views.notification_max_retained == 0 {
            return Err(ConfigError::invalid(
                "views.notification_max_retained",
                "must be at least 1",
            ));
        }
        if self.views.broadcast_max_retained == 0 {
            return Err(ConfigError::invalid("views.broadcast_max_retained", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid("event_buffer", "must be at least 1"));
        }
        Ok(())
    }
}

fn validate_policy(field: &'static str, policy: &BackoffPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(ConfigError::invalid(field, "attempt budget must be at least 1"));
    }
    if policy.multiplier.is_nan() || policy.multiplier < 1.0 {
        return Err(ConfigError::invalid(field, "multiplier must be at least 1.0"));
    }
    if policy.initial_delay > policy.max_delay {
        return Err(ConfigError::invalid(field, "initial delay exceeds the ceiling"));
    }
    Ok(())
}
