//! Tether relay
//!
//! Accepts outbound WebSocket connections from agents, keeps one [`Session`]
//! per agent name in a [`SessionRegistry`], and exposes the agents' REST APIs
//! through a single HTTP entry point:
//!
//! - `ANY /v1/{*path}?proxy_node=<name>` tunnels the request to that agent
//! - `GET /nodes`, `GET /nodes/{name}` list connected agents
//! - `GET /catalog` merges every agent's plugin catalog
//! - `GET /health`

pub mod catalog;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use config::{RelayConfig, SessionConfig};
pub use error::{RelayError, RouteError, SessionError};
pub use registry::SessionRegistry;
pub use router::{build_router, RelayState};
pub use server::RelayServer;
pub use session::{HeartbeatSample, Session, SessionState, TerminationReason};
