use std::collections::BTreeMap;
use std::time::Duration;
use tether_proto::AgentMetadata;
use tether_transport::{CallTransport, TransportConfig, TransportError};
use tether_transport_websocket::{WebSocketConfig, WebSocketConnector};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::endpoint::TunnelEndpoint;
use crate::local::LocalService;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to relay {url}: {source}")]
    Connect {
        url: String,
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serve loop panicked: {0}")]
    Panicked(String),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name reported to the relay; sessions are keyed by it
    pub name: String,

    /// Relay agent endpoint (e.g. "wss://relay.example.com/ws")
    pub relay_url: String,

    /// Bearer token, when the relay requires one
    pub auth_token: Option<String>,

    /// Extra key/value pairs reported with the metadata
    pub labels: BTreeMap<String, String>,

    pub connect_timeout: Duration,

    pub transport: TransportConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "agent".to_string()),
            relay_url: "ws://localhost:8080/ws".to_string(),
            auth_token: None,
            labels: BTreeMap::new(),
            connect_timeout: Duration::from_secs(10),
            transport: TransportConfig::default(),
        }
    }
}

impl AgentConfig {
    fn metadata(&self) -> AgentMetadata {
        self.labels
            .iter()
            .fold(AgentMetadata::local(&self.name), |meta, (k, v)| {
                meta.with_label(k, v)
            })
    }
}

/// The tunnel agent
pub struct Agent;

impl Agent {
    /// Dial the relay and start serving tunneled calls
    ///
    /// Failing to connect is returned to the caller; retrying is up to it.
    pub async fn connect(
        config: AgentConfig,
        service: impl LocalService,
    ) -> Result<AgentHandle, AgentError> {
        if config.name.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "Agent name cannot be empty".to_string(),
            ));
        }

        let endpoint = TunnelEndpoint::new(service, config.metadata());

        let mut ws_config = WebSocketConfig::default().with_connect_timeout(config.connect_timeout);
        if let Some(token) = &config.auth_token {
            ws_config = ws_config.with_auth_token(token.clone());
        }

        info!("Connecting to relay at {} as {}", config.relay_url, config.name);

        let connection = WebSocketConnector::new(ws_config)
            .connect(&config.relay_url)
            .await
            .map_err(|source| AgentError::Connect {
                url: config.relay_url.clone(),
                source,
            })?;

        let transport = CallTransport::new(config.transport.clone());
        endpoint.register(&transport);

        let serve = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.serve(connection).await })
        };

        info!("Agent {} connected", config.name);

        Ok(AgentHandle {
            name: config.name,
            transport,
            serve,
        })
    }
}

/// A running agent connection
pub struct AgentHandle {
    name: String,
    transport: CallTransport,
    serve: JoinHandle<Result<(), TransportError>>,
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport to the relay, for agent-initiated calls
    pub fn transport(&self) -> &CallTransport {
        &self.transport
    }

    /// Close the connection to the relay
    pub fn stop(&self) {
        debug!("Stopping agent {}", self.name);
        self.transport.stop();
    }

    /// Wait until the connection to the relay is gone
    pub async fn closed(self) -> Result<(), AgentError> {
        let result = self
            .serve
            .await
            .map_err(|e| AgentError::Panicked(e.to_string()))?;

        info!("Agent {} disconnected", self.name);
        result.map_err(AgentError::from)
    }
}
