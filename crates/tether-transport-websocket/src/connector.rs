//! Dialing the relay

use tether_transport::{TransportError, TransportResult};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};
use url::Url;

use crate::config::WebSocketConfig;
use crate::connection::WebSocketConnection;

/// Connection produced by [`WebSocketConnector::connect`]
pub type ClientConnection = WebSocketConnection<MaybeTlsStream<TcpStream>>;

/// Opens client WebSocket connections
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Connect to a `ws://` or `wss://` URL
    ///
    /// TLS uses the platform's native root store.
    pub async fn connect(&self, url: &str) -> TransportResult<ClientConnection> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::ConnectionError(format!("Invalid URL {}: {}", url, e)))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::ConnectionError(format!(
                "Unsupported scheme {} (expected ws or wss)",
                url.scheme()
            )));
        }

        let mut request = url.as_str().into_client_request().map_err(|e| {
            TransportError::ConnectionError(format!("Invalid WebSocket request: {}", e))
        })?;

        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::ConnectionError(format!("Invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Connecting to WebSocket server: {}", url);

        let handshake = tokio_tungstenite::connect_async_with_config(
            request,
            Some(self.config.protocol_config()),
            true,
        );

        let (stream, _response) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(self.config.connect_timeout))?
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        info!("WebSocket connection established to {}", url);

        Ok(WebSocketConnection::new(stream))
    }
}
