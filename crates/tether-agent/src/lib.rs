//! Tether agent
//!
//! Dials the relay, then serves tunneled HTTP requests by driving them through
//! a local HTTP server (any [`LocalService`]) with an in-memory response sink.

pub mod agent;
pub mod capture;
pub mod catalog;
pub mod endpoint;
pub mod local;

pub use agent::{Agent, AgentConfig, AgentError, AgentHandle};
pub use capture::{CapturedResponse, ResponseSink};
pub use catalog::{catalog_router, Plugin, PluginList};
pub use endpoint::TunnelEndpoint;
pub use local::{LocalService, TowerService};
