//! Transport seam between sessions and the wire.
//!
//! Sessions never touch tungstenite directly: they read [`Frame`]s from a
//! [`TransportReader`] and write payloads through a [`TransportWriter`].
//! The production implementations wrap the two halves of a tungstenite
//! stream over a hyper-upgraded connection; tests substitute scripted ones.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// The wire form of a message: text or binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Failures reported by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("text payload is not valid utf-8")]
    Utf8,
}

/// One unit delivered by a reader.
#[derive(Debug)]
pub enum Frame {
    /// A chunk of an in-progress message. `is_final` marks the last chunk.
    Chunk {
        data: Bytes,
        kind: MessageKind,
        is_final: bool,
    },
    /// The peer closed the stream. A termination signal, not an error.
    Closed,
}

/// Read side of a duplex transport. Owned by the session's receive loop.
#[async_trait]
pub trait TransportReader: Send {
    async fn next_frame(&mut self) -> Result<Frame, TransportError>;
}

/// Write side of a duplex transport. Owned by the session, behind its
/// write-serialization lock.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one complete message.
    async fn send(&mut self, data: Bytes, kind: MessageKind) -> Result<(), TransportError>;

    /// Close the stream. Safe to call after the peer already closed.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A server-side websocket stream over a hyper-upgraded connection.
pub(crate) type WsStream = WebSocketStream<TokioIo<Upgraded>>;

pub(crate) struct WsReader {
    inner: SplitStream<WsStream>,
}

pub(crate) struct WsWriter {
    inner: SplitSink<WsStream, Message>,
}

/// Split an upgraded stream into the session's reader and writer halves.
pub(crate) fn split_stream(stream: WsStream) -> (WsReader, WsWriter) {
    let (sink, stream) = stream.split();
    (WsReader { inner: stream }, WsWriter { inner: sink })
}

#[async_trait]
impl TransportReader for WsReader {
    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let message = match self.inner.next().await {
                None => return Ok(Frame::Closed),
                Some(Err(tungstenite::Error::ConnectionClosed))
                | Some(Err(tungstenite::Error::AlreadyClosed)) => return Ok(Frame::Closed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(message)) => message,
            };

            // tungstenite reassembles fragments internally, so each
            // delivered Text/Binary message is one final chunk here.
            match message {
                Message::Text(text) => {
                    return Ok(Frame::Chunk {
                        data: Bytes::from(text),
                        kind: MessageKind::Text,
                        is_final: true,
                    })
                }
                Message::Binary(data) => {
                    return Ok(Frame::Chunk {
                        data,
                        kind: MessageKind::Binary,
                        is_final: true,
                    })
                }
                Message::Close(_) => return Ok(Frame::Closed),
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) => continue,
                // Raw frames never surface from a plain read.
                Message::Frame(_) => continue,
            }
        }
    }
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send(&mut self, data: Bytes, kind: MessageKind) -> Result<(), TransportError> {
        let message = match kind {
            MessageKind::Text => {
                let text = std::str::from_utf8(&data).map_err(|_| TransportError::Utf8)?;
                Message::text(text)
            }
            MessageKind::Binary => Message::Binary(data),
        };
        self.inner.send(message).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(())
            | Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
