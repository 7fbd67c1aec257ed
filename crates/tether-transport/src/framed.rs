//! Length-delimited framing over any byte stream

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{DuplexConnection, FrameSink, FrameSource, TransportError, TransportResult};

/// A [`DuplexConnection`] over a raw byte stream
///
/// Each frame is prefixed with its big-endian u32 length. Useful for plain
/// TCP and for in-process pipes.
pub struct FramedConnection<T> {
    connection_id: String,
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T> FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: T, max_frame_size: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_codec();

        Self {
            connection_id: format!("framed-{}", uuid::Uuid::new_v4()),
            framed: Framed::new(io, codec),
        }
    }
}

impl FramedConnection<DuplexStream> {
    /// Two connected in-memory endpoints
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Self::new(a, tether_proto::MAX_FRAME_SIZE),
            Self::new(b, tether_proto::MAX_FRAME_SIZE),
        )
    }
}

pub struct FramedSink<T> {
    inner: SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>,
}

pub struct FramedSource<T> {
    inner: SplitStream<Framed<T, LengthDelimitedCodec>>,
}

#[async_trait]
impl<T> FrameSink for FramedSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        self.inner.send(frame).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inner.close().await.map_err(TransportError::from)
    }
}

#[async_trait]
impl<T> FrameSource for FramedSource<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(TransportError::from(e)),
            None => Ok(None),
        }
    }
}

impl<T> DuplexConnection for FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Sink = FramedSink<T>;
    type Source = FramedSource<T>;

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.framed.split();
        (FramedSink { inner: sink }, FramedSource { inner: source })
    }
}
