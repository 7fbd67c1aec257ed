//! In-memory agents for unit tests

use bytes::Bytes;
use http::{Response, StatusCode};
use std::sync::{Arc, Mutex};
use tether_proto::{
    decode_request, encode_response_for, methods, unix_millis, AgentMetadata, CallCodec,
    PROTOCOL_VERSION,
};
use tether_transport::{
    CallTransport, FramedConnection, HandlerError, HandlerResult, TransportConfig,
};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::session::Session;

/// Scripted agent answering the three tunnel methods
#[derive(Clone)]
pub struct FakeAgent {
    pub name: String,
    pub plugins: Vec<serde_json::Value>,
    pub catalog_status: StatusCode,
    pub stall_heartbeat: bool,
    pub stall_handle: bool,
    pub garbage_response: bool,
    pub protocol_version: u32,
    /// Request heads seen by the Handle method ("METHOD target")
    pub seen: Arc<Mutex<Vec<String>>>,
    /// Header lines seen by the Handle method
    pub seen_headers: Arc<Mutex<Vec<(String, String)>>>,
}

pub fn fake_agent(name: &str) -> FakeAgent {
    FakeAgent {
        name: name.to_string(),
        plugins: Vec::new(),
        catalog_status: StatusCode::OK,
        stall_heartbeat: false,
        stall_handle: false,
        garbage_response: false,
        protocol_version: PROTOCOL_VERSION,
        seen: Arc::new(Mutex::new(Vec::new())),
        seen_headers: Arc::new(Mutex::new(Vec::new())),
    }
}

impl FakeAgent {
    fn install(&self, transport: &CallTransport) {
        let mut metadata = AgentMetadata::local(self.name.clone());
        metadata.protocol_version = self.protocol_version;
        transport.register_handler(methods::METADATA, move |_payload: Bytes| {
            let metadata = metadata.clone();
            async move {
                CallCodec::encode_value(&metadata).map_err(|e| HandlerError::new(e.to_string()))
            }
        });

        let stall = self.stall_heartbeat;
        transport.register_handler(methods::HEARTBEAT, move |_payload: Bytes| async move {
            if stall {
                std::future::pending::<()>().await;
            }
            CallCodec::encode_value(&unix_millis()).map_err(|e| HandlerError::new(e.to_string()))
        });

        let agent = self.clone();
        transport.register_handler(methods::HANDLE, move |payload: Bytes| {
            let agent = agent.clone();
            async move { agent.handle(payload).await }
        });
    }

    async fn handle(&self, payload: Bytes) -> HandlerResult {
        if self.stall_handle {
            std::future::pending::<()>().await;
        }
        if self.garbage_response {
            return Ok(Bytes::from_static(b"not an http response"));
        }

        let request = decode_request(&payload).map_err(|e| HandlerError::new(e.to_string()))?;
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default();
        self.seen
            .lock()
            .unwrap()
            .push(format!("{} {}", request.method(), target));
        self.seen_headers.lock().unwrap().extend(
            request
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string())),
        );

        let response = if request.uri().path() == "/v1/plugins" {
            let body = serde_json::json!({ "plugins": self.plugins }).to_string();
            Response::builder()
                .status(self.catalog_status)
                .header("content-type", "application/json")
                .header("content-length", body.len())
                .header("connection", "keep-alive")
                .body(Bytes::from(body))
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Bytes::from_static(b"no such route"))
        }
        .map_err(|e| HandlerError::new(e.to_string()))?;

        Ok(encode_response_for(request.method(), &response))
    }
}

/// Connect a fake agent over an in-memory pipe and identify it
///
/// Returns the (not yet activated) session and the agent's transport.
pub async fn session_over_pipe(
    agent: FakeAgent,
    config: SessionConfig,
) -> (Arc<Session>, CallTransport) {
    let (session, agent_transport) = identify_over_pipe(agent, config).await;
    (session.expect("fake agent identifies"), agent_transport)
}

/// Connect a fake agent over an in-memory pipe and run the identity call
pub async fn identify_over_pipe(
    agent: FakeAgent,
    config: SessionConfig,
) -> (Result<Arc<Session>, SessionError>, CallTransport) {
    let (relay_conn, agent_conn) = FramedConnection::pair();

    let agent_transport = CallTransport::new(TransportConfig::default());
    agent.install(&agent_transport);
    {
        let agent_transport = agent_transport.clone();
        tokio::spawn(async move { agent_transport.serve(agent_conn).await });
    }

    let relay_transport = CallTransport::new(TransportConfig::default());
    {
        let relay_transport = relay_transport.clone();
        tokio::spawn(async move { relay_transport.serve(relay_conn).await });
    }

    let session = Session::identify(relay_transport, config).await;
    (session, agent_transport)
}
