//! In-process transport.
//!
//! [`pair`] returns a client handle plus a reader/writer pair that behave
//! like a streaming connection. Used by tests and by tools that drive the
//! hub without a network.

use async_trait::async_trait;
use courier_protocol::{codec, Envelope, Message};
use tokio::sync::mpsc;

use crate::traits::{CloseCode, EnvelopeReader, MessageWriter, TransportError, TransportKind};

/// What the hub wrote to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    Ping,
    Close(CloseCode),
}

/// Create a connected client and server halves.
#[must_use]
pub fn pair(capacity: usize) -> (MemoryClient, MemoryReader, MemoryWriter) {
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    (
        MemoryClient {
            inbound: Some(in_tx),
            outbound: out_rx,
        },
        MemoryReader { rx: in_rx },
        MemoryWriter {
            tx: out_tx,
            closed: false,
        },
    )
}

/// The client side of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    inbound: Option<mpsc::Sender<Result<Envelope, TransportError>>>,
    outbound: mpsc::Receiver<Frame>,
}

impl MemoryClient {
    /// Send an envelope to the hub.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub dropped its reader.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.push(Ok(envelope)).await
    }

    /// Send raw bytes; undecodable input reaches the reader as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub dropped its reader.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), TransportError> {
        self.push(codec::decode_envelope(data).map_err(TransportError::from))
            .await
    }

    async fn push(&self, item: Result<Envelope, TransportError>) -> Result<(), TransportError> {
        let inbound = self
            .inbound
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?;
        inbound
            .send(item)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the client's sending side; the hub's reader sees end of stream.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Next frame written by the hub, or `None` once the writer is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next message, skipping pings. `None` on close.
    pub async fn next_message(&mut self) -> Option<Message> {
        loop {
            match self.outbound.recv().await? {
                Frame::Message(message) => return Some(message),
                Frame::Ping => continue,
                Frame::Close(_) => return None,
            }
        }
    }

    /// A frame that is already waiting, if any.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }
}

/// Hub-side reader.
#[derive(Debug)]
pub struct MemoryReader {
    rx: mpsc::Receiver<Result<Envelope, TransportError>>,
}

#[async_trait]
impl EnvelopeReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        self.rx.recv().await.transpose()
    }
}

/// Hub-side writer.
#[derive(Debug)]
pub struct MemoryWriter {
    tx: mpsc::Sender<Frame>,
    closed: bool,
}

impl MemoryWriter {
    async fn write(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::SendFailed("client gone".into()))
    }
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.write(Frame::Message(message.clone())).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write(Frame::Ping).await
    }

    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        let result = self.write(Frame::Close(code)).await;
        self.closed = true;
        result
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}
