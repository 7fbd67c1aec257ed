//! WebSocket connections for the tether call transport
//!
//! Agents dial the relay over `ws://` or `wss://` and keep that socket open
//! for their whole lifetime. Every call frame travels as exactly one binary
//! WebSocket message, so no extra framing is needed on top.

pub mod config;
pub mod connection;
pub mod connector;

pub use config::WebSocketConfig;
pub use connection::WebSocketConnection;
pub use connector::WebSocketConnector;
