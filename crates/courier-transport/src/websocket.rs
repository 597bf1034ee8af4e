//! WebSocket transport implementation.
//!
//! Wraps an upgraded axum [`WebSocket`] and splits it into a reader half and
//! a writer half. Envelopes and messages travel as JSON text frames.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use courier_protocol::{codec, Envelope, Message, ProtocolError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, trace, warn};

use crate::traits::{CloseCode, EnvelopeReader, MessageWriter, TransportError, TransportKind};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024, // 64 KB
        }
    }
}

/// Split an upgraded socket into its two halves.
#[must_use]
pub fn split(socket: WebSocket, config: &WebSocketConfig) -> (WebSocketReader, WebSocketWriter) {
    let (sink, stream) = socket.split();
    (
        WebSocketReader {
            stream,
            max_message_size: config.max_message_size,
        },
        WebSocketWriter { sink, closed: false },
    )
}

/// Inbound half of a WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn decode(&self, data: &[u8]) -> Result<Envelope, TransportError> {
        if data.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                self.max_message_size
            );
            return Err(ProtocolError::FrameTooLarge(data.len()).into());
        }
        Ok(codec::decode_envelope(data)?)
    }
}

#[async_trait]
impl EnvelopeReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return self.decode(text.as_bytes()).map(Some);
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return self.decode(&data).map(Some);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                    // Pongs are queued by the protocol layer
                    trace!("Control frame");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    debug!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Outbound half of a WebSocket.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, WsMessage>,
    closed: bool,
}

#[async_trait]
impl MessageWriter for WebSocketWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode_message(message)?;
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.sink
            .send(WsMessage::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(()); // Already closed
        }

        let frame = CloseFrame {
            code: code.as_u16(),
            reason: "".into(),
        };
        self.sink
            .send(WsMessage::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}
