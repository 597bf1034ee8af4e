//! Telemetry contract.
//!
//! The hub reports through [`Telemetry`] unconditionally. Every method has a
//! no-op default so a sink only overrides what it records, and
//! [`NoopTelemetry`] records nothing.

use courier_transport::TransportKind;
use std::fmt;
use std::sync::Arc;

use crate::push::Platform;

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandSource {
    /// A directly-connected client.
    Client,
    /// The shared bus.
    Bus,
}

impl CommandSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandSource::Client => "client",
            CommandSource::Bus => "bus",
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a fan-out was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryTarget {
    User,
    Page,
    Groups,
    Broadcast,
}

impl DeliveryTarget {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryTarget::User => "user",
            DeliveryTarget::Page => "page",
            DeliveryTarget::Groups => "groups",
            DeliveryTarget::Broadcast => "broadcast",
        }
    }
}

/// Counters and gauges reported by the hub.
#[allow(unused_variables)]
pub trait Telemetry: Send + Sync {
    fn connection_opened(&self, kind: TransportKind) {}
    fn connection_closed(&self, kind: TransportKind) {}

    /// A command was accepted for routing.
    fn command(&self, source: CommandSource, name: &str) {}

    /// A fan-out was performed.
    fn delivery(&self, target: DeliveryTarget) {}

    fn message_read(&self) {}
    fn message_written(&self) {}

    /// A message could not be delivered because a mailbox was full.
    fn mailbox_full(&self) {}

    /// A payload could not be formatted into a message.
    fn format_failed(&self) {}

    /// A bus payload was not a valid envelope.
    fn invalid_json(&self) {}

    /// Depth of the pending backend command list.
    fn pending_commands(&self, depth: usize) {}

    fn client_count(&self, count: i64) {}

    fn push_sent(&self, platform: Platform) {}
    fn push_error(&self, platform: Platform) {}

    /// Some recipients of a delivered push failed.
    fn push_failure(&self, platform: Platform) {}
}

/// Shared telemetry handle.
pub type SharedTelemetry = Arc<dyn Telemetry>;

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}
