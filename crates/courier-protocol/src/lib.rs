//! # courier-protocol
//!
//! Wire definitions for the courier fan-out hub.
//!
//! Clients and publishers speak JSON. Every inbound payload is an
//! [`Envelope`]: a flat `command` map of strings plus a free-form `message`
//! object. Outbound payloads are [`Message`]s.
//!
//! ## Inbound
//!
//! ```json
//! {"command": {"command": "message", "user": "u1"},
//!  "message": {"event": "ping", "data": {}}}
//! ```
//!
//! The envelope is validated once, at the routing boundary, by
//! [`Command::parse`], which yields a tagged union instead of loose map
//! lookups.
//!
//! ## Outbound
//!
//! ```json
//! {"event": "ping", "data": {}, "time": 1700000000}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Command};
//!
//! let raw = br#"{"command":{"command":"setpage","page":"/home"}}"#;
//! let envelope = codec::decode_envelope(raw).unwrap();
//! assert!(matches!(Command::parse(&envelope), Command::SetPage { .. }));
//! ```

pub mod codec;
pub mod command;
pub mod envelope;
pub mod message;

pub use codec::{decode_envelope, encode_envelope, encode_message, ProtocolError};
pub use command::{AndroidTarget, Addressing, Command, IosTarget, PushTarget};
pub use envelope::Envelope;
pub use message::{FormatError, Message};
