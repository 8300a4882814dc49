//! Queue-mode transport: length-prefixed JSON frames over a byte stream.
//!
//! The runner owns a unix domain socket listener and hands the engine its
//! path; the engine connects and writes one frame per event. Frames are
//! u32 big-endian length prefixes followed by the JSON body, which is what
//! `LengthDelimitedCodec` speaks out of the box. Delivery is lossless and
//! ordered; any I/O error is surfaced to the caller rather than swallowed.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::EventTransport;
use crate::errors::TransportError;
use crate::event::ProgressEvent;

/// Writer half: engine side.
pub struct QueueTransport<W: AsyncWrite + Unpin + Send> {
    framed: Option<FramedWrite<W, LengthDelimitedCodec>>,
}

impl<W: AsyncWrite + Unpin + Send> QueueTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            framed: Some(FramedWrite::new(writer, LengthDelimitedCodec::new())),
        }
    }
}

#[cfg(unix)]
impl QueueTransport<tokio::net::UnixStream> {
    /// Connect to the runner's socket.
    pub async fn connect(path: &std::path::Path) -> Result<Self, TransportError> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventTransport for QueueTransport<W> {
    async fn send(&mut self, event: &ProgressEvent) -> Result<(), TransportError> {
        let framed = self.framed.as_mut().ok_or(TransportError::Closed)?;
        let body = serde_json::to_vec(event)?;
        framed.send(Bytes::from(body)).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if let Some(mut framed) = self.framed.take() {
            framed.flush().await?;
        }
        Ok(())
    }
}

/// Reader half: runner side.
pub struct QueueEventReader<R: AsyncRead + Unpin + Send> {
    framed: FramedRead<R, LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin + Send> QueueEventReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            framed: FramedRead::new(reader, LengthDelimitedCodec::new()),
        }
    }

    /// Next event in arrival order. `None` means the peer closed cleanly.
    /// A decode failure is a transport fault in this mode, not a skippable
    /// line.
    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent, TransportError>> {
        match self.framed.next().await? {
            Ok(frame) => Some(serde_json::from_slice(&frame).map_err(TransportError::Encode)),
            Err(e) => Some(Err(TransportError::Io(e))),
        }
    }
}
