//! WebSocket-backed duplex connection

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_transport::{DuplexConnection, FrameSink, FrameSource, TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// One WebSocket carrying call frames as binary messages
pub struct WebSocketConnection<S> {
    connection_id: String,
    stream: WebSocketStream<S>,
}

impl<S> std::fmt::Debug for WebSocketConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an established WebSocket stream (client or server side)
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
            stream,
        }
    }
}

pub struct WebSocketSink<S> {
    connection_id: String,
    inner: SplitSink<WebSocketStream<S>, Message>,
}

pub struct WebSocketSource<S> {
    connection_id: String,
    inner: SplitStream<WebSocketStream<S>>,
}

fn map_error(e: tungstenite::Error) -> TransportError {
    TransportError::ConnectionError(e.to_string())
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        self.inner
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(map_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        debug!("[{}] Closing WebSocket", self.connection_id);
        match self.inner.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Close(frame)) => {
                    debug!("[{}] Peer sent close: {:?}", self.connection_id, frame);
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(other) => {
                    trace!(
                        "[{}] Ignoring non-binary message ({} bytes)",
                        self.connection_id,
                        other.len()
                    );
                }
                Err(tungstenite::Error::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(map_error(e)),
            }
        }
        Ok(None)
    }
}

impl<S> DuplexConnection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Sink = WebSocketSink<S>;
    type Source = WebSocketSource<S>;

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.stream.split();
        (
            WebSocketSink {
                connection_id: self.connection_id.clone(),
                inner: sink,
            },
            WebSocketSource {
                connection_id: self.connection_id,
                inner: source,
            },
        )
    }
}
