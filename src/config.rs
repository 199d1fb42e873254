//! Session configuration with timing and reconnection tunables

use serde::{Deserialize, Serialize};
use url::Url;

/// Configuration for a [`crate::Session`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// WebSocket endpoint of the trading-data server
    pub endpoint: String,
    /// Application identifier, appended as a query parameter
    pub app_id: String,
    /// Keepalive interval in milliseconds
    pub keepalive_interval_ms: u64,
    /// Base reconnection delay in milliseconds
    pub reconnect_base_delay_ms: u64,
    /// Maximum reconnection delay in milliseconds
    pub reconnect_max_delay_ms: u64,
    /// Maximum consecutive reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// How long a send waits for the session to open before queueing, in milliseconds
    pub connect_wait_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://stream.quotelink.io/v1/websocket".to_string(),
            app_id: "quotelink".to_string(),
            keepalive_interval_ms: 60_000,
            reconnect_base_delay_ms: 2_000,
            reconnect_max_delay_ms: 10_000,
            max_reconnect_attempts: 5,
            connect_wait_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    /// Build the connection URL with the application id attached
    pub fn url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.endpoint)?;
        url.query_pairs_mut().append_pair("app", &self.app_id);
        Ok(url)
    }
}
