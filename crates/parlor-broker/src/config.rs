use std::time::Duration;

/// Limits and timers the broker enforces. The server derives this from its
/// own configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Capacity of each connection's outbox. A peer that falls this far
    /// behind is evicted.
    pub max_send_queue: usize,
    /// Maximum chat content length, in characters.
    pub max_content_len: usize,
    /// Lifetime of a reconnect token issued in `USER_SET`.
    pub session_token_ttl: Duration,
    /// Connections without a pong for this long are dropped by the sweep.
    pub heartbeat_timeout: Duration,
    /// How often the maintenance sweep runs.
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_send_queue: 256,
            max_content_len: 4_000,
            session_token_ttl: Duration::from_secs(24 * 60 * 60),
            heartbeat_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
        }
    }
}
