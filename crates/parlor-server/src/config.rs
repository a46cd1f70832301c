use std::time::Duration;

use parlor_broker::BrokerConfig;
use serde::{Deserialize, Serialize};

/// Server configuration. Every field has a default, so a config file only
/// needs the values it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds a random free port.
    pub port: u16,
    /// WebSocket upgrades beyond this are refused with 503.
    pub max_connections: usize,
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Largest inbound WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Largest chat message, in characters.
    pub max_content_len: usize,
    pub session_token_ttl_secs: u64,
    /// Refuse `SET_USER` for user ids the store has never seen.
    pub require_known_users: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_connections: 10_000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            write_timeout_secs: 10,
            max_message_size: 64 * 1024,
            max_content_len: 4_000,
            session_token_ttl_secs: 24 * 60 * 60,
            require_known_users: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_send_queue: self.max_send_queue,
            max_content_len: self.max_content_len,
            session_token_ttl: Duration::from_secs(self.session_token_ttl_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            sweep_interval: self.heartbeat_interval(),
        }
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() || self.host.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        for (field, value) in [
            ("maxSendQueue", self.max_send_queue as u64),
            ("maxConnections", self.max_connections as u64),
            ("heartbeatIntervalSecs", self.heartbeat_interval_secs),
            ("writeTimeoutSecs", self.write_timeout_secs),
            ("maxContentLen", self.max_content_len as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::HeartbeatOrder {
                interval: self.heartbeat_interval_secs,
                timeout: self.heartbeat_timeout_secs,
            });
        }
        Ok(())
    }
}

/// A setting [`ServerConfig::validate`] refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("heartbeatTimeoutSecs ({timeout}) must exceed heartbeatIntervalSecs ({interval})")]
    HeartbeatOrder { interval: u64, timeout: u64 },
}
