//! Duplex call transport for tether connections
//!
//! A relay and an agent share exactly one long-lived connection. This crate
//! turns that connection into named, correlated request/response calls that
//! either side may issue concurrently:
//!
//! ```text
//! ┌──────────────┐   call("Handle", ..)    ┌──────────────┐
//! │    relay     │ ──────────────────────▶ │    agent     │
//! │ CallTransport│ ◀────────────────────── │ CallTransport│
//! └──────────────┘   Response { id, .. }   └──────────────┘
//!         │                                        │
//!         └────────── DuplexConnection ────────────┘
//!              (WebSocket, length-delimited TCP,
//!               in-memory pipe for tests)
//! ```
//!
//! The connection itself only has to move opaque frames; it is abstracted by
//! [`DuplexConnection`] so the call layer never depends on a concrete
//! transport.

pub mod call;
pub mod config;
pub mod framed;
pub mod handler;

pub use call::CallTransport;
pub use config::TransportConfig;
pub use framed::FramedConnection;
pub use handler::{CallHandler, HandlerError, HandlerResult};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection closed (or was stopped) before the call completed
    #[error("Disconnected")]
    Disconnected,

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The remote handler failed or did not know the method
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport is already serving a connection")]
    AlreadyServing,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a duplex connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one frame; frame boundaries must be preserved
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Close the sending side
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a duplex connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Receive the next frame
    ///
    /// Returns `None` once the peer has closed the connection.
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>>;
}

/// A persistent, full-duplex, frame-preserving connection
pub trait DuplexConnection: Send + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    /// Stable identifier used for logging
    fn connection_id(&self) -> String;

    /// Split into independently owned halves
    fn split(self) -> (Self::Sink, Self::Source);
}
