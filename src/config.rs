use serde::{Deserialize, Serialize};

use crate::utils::get_env_with_prefix;

/// Configuration for the realtime subsystem
///
/// All durations are policy, not correctness: the defaults track the UI
/// heuristics of the surrounding platform (a few seconds of typing expiry,
/// a short reconnect grace) but every deployment can override them via the
/// builder or `CLASSWIRE_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    /// Delay before a user with zero live connections is declared offline.
    /// Absorbs transient reconnects (tab refresh, flaky mobile networks).
    #[serde(default = "default_presence_grace_ms")]
    pub presence_grace_ms: u64,

    /// Window for coalescing presence-changed signals into one broadcast
    #[serde(default = "default_presence_coalesce_ms")]
    pub presence_coalesce_ms: u64,

    /// How long a typing indicator stays alive without a refresh
    #[serde(default = "default_typing_expiry_ms")]
    pub typing_expiry_ms: u64,

    /// Interval of the background sweep that stops silently-expired typing
    #[serde(default = "default_typing_sweep_interval_ms")]
    pub typing_sweep_interval_ms: u64,

    /// Upper bound on a single enqueue into a connection's outbound queue
    #[serde(default = "default_connection_write_timeout_ms")]
    pub connection_write_timeout_ms: u64,

    /// Capacity of each connection's bounded outbound queue
    #[serde(default = "default_message_queue_limit")]
    pub message_queue_limit: usize,

    /// Maximum number of concurrent connections (0 = unlimited)
    #[serde(default)]
    pub max_connections: usize,

    /// Interval between heartbeat pings on each connection
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// A connection that has not ponged for this long is considered dead
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            presence_grace_ms: default_presence_grace_ms(),
            presence_coalesce_ms: default_presence_coalesce_ms(),
            typing_expiry_ms: default_typing_expiry_ms(),
            typing_sweep_interval_ms: default_typing_sweep_interval_ms(),
            connection_write_timeout_ms: default_connection_write_timeout_ms(),
            message_queue_limit: default_message_queue_limit(),
            max_connections: 0,
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
        }
    }
}

impl RealtimeConfig {
    /// Create a new RealtimeConfig builder
    pub fn builder() -> RealtimeConfigBuilder {
        RealtimeConfigBuilder::new()
    }

    /// Load realtime configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = get_env_with_prefix("PRESENCE_GRACE_MS") {
            if let Ok(ms) = val.parse() {
                config.presence_grace_ms = ms;
            }
        }

        if let Some(val) = get_env_with_prefix("PRESENCE_COALESCE_MS") {
            if let Ok(ms) = val.parse() {
                config.presence_coalesce_ms = ms;
            }
        }

        if let Some(val) = get_env_with_prefix("TYPING_EXPIRY_MS") {
            if let Ok(ms) = val.parse() {
                config.typing_expiry_ms = ms;
            }
        }

        if let Some(val) = get_env_with_prefix("TYPING_SWEEP_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.typing_sweep_interval_ms = ms;
            }
        }

        if let Some(val) = get_env_with_prefix("CONNECTION_WRITE_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.connection_write_timeout_ms = ms;
            }
        }

        if let Some(val) = get_env_with_prefix("MESSAGE_QUEUE_LIMIT") {
            if let Ok(limit) = val.parse() {
                config.message_queue_limit = limit;
            }
        }

        if let Some(val) = get_env_with_prefix("MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                config.max_connections = max;
            }
        }

        if let Some(val) = get_env_with_prefix("HEARTBEAT_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                config.heartbeat_interval_secs = secs;
            }
        }

        if let Some(val) = get_env_with_prefix("HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.heartbeat_timeout_secs = secs;
            }
        }

        config
    }

    pub(crate) fn presence_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.presence_grace_ms)
    }

    pub(crate) fn presence_coalesce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.presence_coalesce_ms)
    }

    pub(crate) fn typing_expiry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.typing_expiry_ms)
    }

    pub(crate) fn typing_sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.typing_sweep_interval_ms)
    }

    pub(crate) fn connection_write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connection_write_timeout_ms)
    }
}

/// Builder for RealtimeConfig
#[must_use = "builder does nothing until you call build()"]
pub struct RealtimeConfigBuilder {
    config: RealtimeConfig,
}

impl RealtimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RealtimeConfig::default(),
        }
    }

    pub fn presence_grace_ms(mut self, ms: u64) -> Self {
        self.config.presence_grace_ms = ms;
        self
    }

    pub fn presence_coalesce_ms(mut self, ms: u64) -> Self {
        self.config.presence_coalesce_ms = ms;
        self
    }

    pub fn typing_expiry_ms(mut self, ms: u64) -> Self {
        self.config.typing_expiry_ms = ms;
        self
    }

    pub fn typing_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.typing_sweep_interval_ms = ms;
        self
    }

    pub fn connection_write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connection_write_timeout_ms = ms;
        self
    }

    pub fn message_queue_limit(mut self, limit: usize) -> Self {
        self.config.message_queue_limit = limit;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_interval_secs = secs;
        self
    }

    pub fn heartbeat_timeout_secs(mut self, secs: u64) -> Self {
        self.config.heartbeat_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any setting would make the subsystem inert:
    /// zero typing expiry or sweep interval, zero write timeout, or a
    /// zero-capacity outbound queue.
    pub fn build(self) -> crate::error::Result<RealtimeConfig> {
        if self.config.typing_expiry_ms == 0 {
            return Err(crate::error::ClasswireError::internal(
                "typing_expiry_ms must be greater than 0",
            ));
        }

        if self.config.typing_sweep_interval_ms == 0 {
            return Err(crate::error::ClasswireError::internal(
                "typing_sweep_interval_ms must be greater than 0",
            ));
        }

        if self.config.connection_write_timeout_ms == 0 {
            return Err(crate::error::ClasswireError::internal(
                "connection_write_timeout_ms must be greater than 0",
            ));
        }

        if self.config.message_queue_limit == 0 {
            return Err(crate::error::ClasswireError::internal(
                "message_queue_limit must be greater than 0",
            ));
        }

        if self.config.heartbeat_interval_secs == 0 {
            return Err(crate::error::ClasswireError::internal(
                "heartbeat_interval_secs must be greater than 0",
            ));
        }

        if self.config.heartbeat_timeout_secs <= self.config.heartbeat_interval_secs {
            return Err(crate::error::ClasswireError::internal(
                "heartbeat_timeout_secs must exceed heartbeat_interval_secs",
            ));
        }

        Ok(self.config)
    }
}

impl Default for RealtimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_presence_grace_ms() -> u64 {
    3000
}

fn default_presence_coalesce_ms() -> u64 {
    250
}

fn default_typing_expiry_ms() -> u64 {
    4000
}

fn default_typing_sweep_interval_ms() -> u64 {
    1000
}

fn default_connection_write_timeout_ms() -> u64 {
    500
}

fn default_message_queue_limit() -> usize {
    256
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    60
}
