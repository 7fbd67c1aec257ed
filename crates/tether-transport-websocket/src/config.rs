//! WebSocket connector configuration

use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;

/// Client-side WebSocket settings
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Bearer token presented to the relay during the handshake
    pub auth_token: Option<String>,

    /// Limit for the TCP connect plus WebSocket handshake
    pub connect_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl WebSocketConfig {
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            max_message_size: tether_proto::MAX_FRAME_SIZE,
        }
    }
}
