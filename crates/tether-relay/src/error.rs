//! Relay error types

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use std::time::Duration;
use tether_transport::TransportError;
use thiserror::Error;
use tracing::warn;

/// Failure of a call issued on one session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("agent disconnected")]
    Disconnected,

    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),

    #[error("agent failed the call: {0}")]
    Remote(String),

    #[error("agent returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("agent identity rejected: {0}")]
    InvalidIdentity(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => SessionError::Disconnected,
            TransportError::Timeout(d) => SessionError::Timeout(d),
            TransportError::Remote(message) => SessionError::Remote(message),
            TransportError::ProtocolError(message) => SessionError::MalformedResponse(message),
            other => SessionError::Transport(other.to_string()),
        }
    }
}

/// Errors surfaced by the external HTTP surface
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no proxy_node url param present.")]
    MissingRoutingTarget,

    #[error("Not found: no agent named {0}")]
    UnknownAgent(String),

    #[error("request body too large")]
    BodyTooLarge,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("agent {agent}: {source}")]
    Forward {
        agent: String,
        #[source]
        source: SessionError,
    },
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::MissingRoutingTarget | RouteError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            RouteError::UnknownAgent(_) => StatusCode::NOT_FOUND,
            RouteError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RouteError::Forward {
                source: SessionError::Timeout(_),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            RouteError::Forward { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Forwarding failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

/// Relay startup and serving errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
