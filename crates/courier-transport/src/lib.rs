//! # courier-transport
//!
//! Transport abstraction layer for the courier fan-out hub.
//!
//! A connection is split into two halves so the reader task and the writer
//! task can each own one:
//!
//! - [`EnvelopeReader`] yields decoded inbound envelopes.
//! - [`MessageWriter`] writes outbound messages, heartbeats and the close
//!   handshake.
//!
//! Implementations:
//!
//! - **WebSocket** - a streaming duplex connection (axum upgrade)
//! - **Long-poll** - a one-shot response that carries a single message
//! - **Memory** - an in-process pair used by tests and tools
//!
//! ```rust,ignore
//! use courier_transport::{EnvelopeReader, MessageWriter};
//!
//! async fn echo_events(mut reader: impl EnvelopeReader, mut writer: impl MessageWriter) {
//!     while let Ok(Some(envelope)) = reader.recv().await {
//!         // Route envelope
//!     }
//! }
//! ```

pub mod longpoll;
pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{CloseCode, EnvelopeReader, MessageWriter, TransportError, TransportKind};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketReader, WebSocketWriter};
