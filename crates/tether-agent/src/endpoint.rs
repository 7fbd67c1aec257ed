//! Agent side of the tunnel: answers Handle, Heartbeat and Metadata calls

use bytes::Bytes;
use std::sync::Arc;
use tether_proto::{
    decode_request, encode_response_for, methods, unix_millis, AgentMetadata, CallCodec,
};
use tether_transport::{CallTransport, HandlerError, HandlerResult};
use tracing::{debug, info, warn};

use crate::capture::CapturedResponse;
use crate::local::LocalService;

/// Bridges tunneled calls to the agent's local HTTP server
#[derive(Clone)]
pub struct TunnelEndpoint {
    service: Arc<dyn LocalService>,
    metadata: Arc<AgentMetadata>,
}

impl TunnelEndpoint {
    pub fn new(service: impl LocalService, metadata: AgentMetadata) -> Self {
        Self {
            service: Arc::new(service),
            metadata: Arc::new(metadata),
        }
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    /// Install the endpoint's handlers on a transport
    pub fn register(&self, transport: &CallTransport) {
        let endpoint = self.clone();
        transport.register_handler(methods::HANDLE, move |payload: Bytes| {
            let endpoint = endpoint.clone();
            async move { endpoint.handle_http(payload).await }
        });

        transport.register_handler(methods::HEARTBEAT, |payload: Bytes| async move {
            heartbeat(payload)
        });

        let endpoint = self.clone();
        transport.register_handler(methods::METADATA, move |payload: Bytes| {
            let endpoint = endpoint.clone();
            async move { endpoint.describe(payload) }
        });
    }

    /// Run one tunneled HTTP exchange through the local server
    ///
    /// Only a payload that is not an HTTP request fails the call; whatever the
    /// local server answers, error statuses included, is a successful result.
    pub async fn handle_http(&self, payload: Bytes) -> HandlerResult {
        let request = decode_request(&payload).map_err(|e| {
            warn!("Rejecting tunneled request: {}", e);
            HandlerError::new(e.to_string())
        })?;

        debug!("Tunneled {} {}", request.method(), request.uri());

        let method = request.method().clone();
        let mut captured = CapturedResponse::new();
        self.service.handle(request, &mut captured).await;

        debug!("Local server answered {}", captured.status());
        Ok(encode_response_for(&method, &captured.into_response()))
    }

    fn describe(&self, payload: Bytes) -> HandlerResult {
        let caller: String = CallCodec::decode_value(&payload).unwrap_or_else(|e| {
            debug!("Metadata call without a readable caller id: {}", e);
            String::new()
        });
        info!(
            "Relay requested metadata (session {})",
            if caller.is_empty() { "?" } else { &caller }
        );

        CallCodec::encode_value(&*self.metadata).map_err(|e| HandlerError::new(e.to_string()))
    }
}

fn heartbeat(payload: Bytes) -> HandlerResult {
    let sent: u64 = CallCodec::decode_value(&payload)
        .map_err(|e| HandlerError::new(format!("invalid heartbeat: {}", e)))?;
    let now = unix_millis();
    debug!("Heartbeat ({} ms since relay stamp)", now.saturating_sub(sent));

    CallCodec::encode_value(&now).map_err(|e| HandlerError::new(e.to_string()))
}
