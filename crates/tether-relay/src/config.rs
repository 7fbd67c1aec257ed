//! Relay configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tether_transport::TransportConfig;

use crate::error::RelayError;

/// Paths served by the relay itself; the agent path may not shadow them
const RESERVED_PATHS: [&str; 4] = ["/v1", "/nodes", "/catalog", "/health"];

/// Per-session timing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeat calls; also the heartbeat call timeout
    pub heartbeat_interval: Duration,

    /// How long a freshly connected agent has to answer the Metadata call
    pub identity_timeout: Duration,

    /// Deadline for one tunneled HTTP exchange
    pub forward_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            identity_timeout: Duration::from_secs(10),
            forward_timeout: Duration::from_secs(30),
        }
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address for both the external HTTP surface and agent connections
    pub listen_addr: SocketAddr,

    /// Path agents open their WebSocket on
    pub agent_path: String,

    /// PEM certificate and key; when both are set the relay serves HTTPS/WSS
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,

    /// Bearer token agents must present, if any
    pub agent_token: Option<String>,

    /// Agent-side endpoint queried by `GET /catalog`
    pub catalog_path: String,

    /// Largest request body accepted for tunneling
    pub body_limit: usize,

    pub session: SessionConfig,

    pub transport: TransportConfig,
}

impl RelayConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Reject paths the router cannot mount
    pub fn validate(&self) -> Result<(), RelayError> {
        let path = self.agent_path.as_str();

        if !path.starts_with('/') || path.len() < 2 {
            return Err(RelayError::InvalidConfig(format!(
                "agent path '{}' must start with '/' and name a route",
                path
            )));
        }
        if path.contains(['{', '}', '*', '?', '#']) {
            return Err(RelayError::InvalidConfig(format!(
                "agent path '{}' may not contain route parameters or a query",
                path
            )));
        }
        let trimmed = path.trim_end_matches('/');
        let clash = RESERVED_PATHS.iter().find(|reserved| {
            trimmed == **reserved || path.starts_with(&format!("{}/", reserved))
        });
        if let Some(reserved) = clash {
            return Err(RelayError::InvalidConfig(format!(
                "agent path '{}' clashes with the relay's {} routes",
                path, reserved
            )));
        }

        if !self.catalog_path.starts_with('/') {
            return Err(RelayError::InvalidConfig(format!(
                "catalog path '{}' must start with '/'",
                self.catalog_path
            )));
        }

        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            agent_path: "/ws".to_string(),
            tls_cert: None,
            tls_key: None,
            agent_token: None,
            catalog_path: "/v1/plugins".to_string(),
            body_limit: 8 * 1024 * 1024,
            session: SessionConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}
