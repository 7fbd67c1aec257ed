//! Agent WebSockets accepted through axum

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tether_transport::{DuplexConnection, FrameSink, FrameSource, TransportError, TransportResult};
use tracing::{debug, trace};

/// An upgraded agent WebSocket as a [`DuplexConnection`]
pub struct AgentSocket {
    connection_id: String,
    socket: WebSocket,
}

impl AgentSocket {
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        let connection_id = match remote_addr {
            Some(addr) => format!("agent-{}-{}", addr, uuid::Uuid::new_v4().simple()),
            None => format!("agent-{}", uuid::Uuid::new_v4().simple()),
        };
        Self {
            connection_id,
            socket,
        }
    }
}

pub struct AgentSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct AgentSocketSource {
    connection_id: String,
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSink for AgentSocketSink {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        self.inner
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        // The peer may already be gone; nothing left to report then
        let _ = self.inner.send(Message::Close(None)).await;
        let _ = self.inner.close().await;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for AgentSocketSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Close(frame)) => {
                    debug!("[{}] Agent sent close: {:?}", self.connection_id, frame);
                    return Ok(None);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Text(text)) => {
                    trace!(
                        "[{}] Ignoring text message ({} bytes)",
                        self.connection_id,
                        text.as_str().len()
                    );
                }
                Err(e) => return Err(TransportError::ConnectionError(e.to_string())),
            }
        }
        Ok(None)
    }
}

impl DuplexConnection for AgentSocket {
    type Sink = AgentSocketSink;
    type Source = AgentSocketSource;

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.socket.split();
        (
            AgentSocketSink { inner: sink },
            AgentSocketSource {
                connection_id: self.connection_id,
                inner: source,
            },
        )
    }
}
