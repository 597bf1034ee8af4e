//! Transport abstraction traits for courier.
//!
//! These traits define the interface that all transport implementations must
//! provide, allowing the hub to be transport-agnostic.

use async_trait::async_trait;
use courier_protocol::{Envelope, Message};
use std::fmt;
use thiserror::Error;

/// The shape of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// A persistent duplex stream (WebSocket).
    Stream,
    /// A single request/response cycle.
    LongPoll,
}

impl TransportKind {
    /// Whether the connection ends after its first outbound message.
    #[must_use]
    pub fn is_one_shot(self) -> bool {
        matches!(self, TransportKind::LongPoll)
    }

    /// Label used in logs and telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stream => "websocket",
            TransportKind::LongPoll => "longpoll",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close codes from RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// The session ended normally.
    Normal,
    /// The server is shutting down.
    GoingAway,
    /// The session ended on an unexpected error.
    Error,
}

impl CloseCode {
    /// Numeric code.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Error => 1011,
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Inbound data was not a valid envelope.
    #[error("Protocol error: {0}")]
    Protocol(#[from] courier_protocol::ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// The inbound half of a connection.
#[async_trait]
pub trait EnvelopeReader: Send {
    /// Receive the next envelope.
    ///
    /// Returns `None` if the peer closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// The outbound half of a connection.
#[async_trait]
pub trait MessageWriter: Send {
    /// Write one message.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Send a liveness probe. Transports without one do nothing.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Close the connection with the given code.
    async fn close(&mut self, code: CloseCode) -> Result<(), TransportError>;

    /// The connection shape.
    fn kind(&self) -> TransportKind;
}
