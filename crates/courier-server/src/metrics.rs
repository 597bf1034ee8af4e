//! Metrics collection and export for courier.
//!
//! [`PrometheusTelemetry`] records the hub's telemetry through the `metrics`
//! crate; [`start_metrics_server`] exports it in Prometheus format.

use courier_core::push::Platform;
use courier_core::telemetry::{CommandSource, DeliveryTarget};
use courier_core::Telemetry;
use courier_transport::TransportKind;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const COMMANDS_TOTAL: &str = "courier_commands_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const MESSAGES_TOTAL: &str = "courier_messages_total";
    pub const MAILBOX_FULL_TOTAL: &str = "courier_mailbox_full_total";
    pub const FORMAT_FAILURES_TOTAL: &str = "courier_format_failures_total";
    pub const INVALID_JSON_TOTAL: &str = "courier_invalid_json_total";
    pub const PENDING_COMMANDS: &str = "courier_pending_commands";
    pub const CLIENTS: &str = "courier_clients";
    pub const PUSH_TOTAL: &str = "courier_push_total";
}

/// Command names reported as their own label value; anything else is
/// folded into `other`.
const KNOWN_COMMANDS: [&str; 9] = [
    "authenticate",
    "message",
    "setpage",
    "setgroups",
    "setpresence",
    "pushios",
    "pushandroid",
    "push",
    "pushormessage",
];

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::COMMANDS_TOTAL, "Commands accepted for routing");
    metrics::describe_counter!(names::DELIVERIES_TOTAL, "Fan-out operations performed");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages read from and written to clients");
    metrics::describe_counter!(
        names::MAILBOX_FULL_TOTAL,
        "Messages dropped because a connection mailbox was full"
    );
    metrics::describe_counter!(
        names::FORMAT_FAILURES_TOTAL,
        "Payloads that could not be formatted into a message"
    );
    metrics::describe_counter!(names::INVALID_JSON_TOTAL, "Undecodable inbound payloads");
    metrics::describe_gauge!(
        names::PENDING_COMMANDS,
        "Backend commands waiting for a queue worker"
    );
    metrics::describe_gauge!(names::CLIENTS, "Connected identities");
    metrics::describe_counter!(names::PUSH_TOTAL, "Push deliveries by platform and outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Hub telemetry recorded as Prometheus metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusTelemetry;

impl PrometheusTelemetry {
    fn command_label(name: &str) -> &'static str {
        KNOWN_COMMANDS
            .iter()
            .find(|known| **known == name)
            .copied()
            .unwrap_or("other")
    }

    fn push(platform: Platform, outcome: &'static str) {
        counter!(names::PUSH_TOTAL, "platform" => platform.as_str(), "outcome" => outcome)
            .increment(1);
    }
}

impl Telemetry for PrometheusTelemetry {
    fn connection_opened(&self, kind: TransportKind) {
        counter!(names::CONNECTIONS_TOTAL, "transport" => kind.as_str()).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => kind.as_str()).increment(1.0);
    }

    fn connection_closed(&self, kind: TransportKind) {
        gauge!(names::CONNECTIONS_ACTIVE, "transport" => kind.as_str()).decrement(1.0);
    }

    fn command(&self, source: CommandSource, name: &str) {
        counter!(
            names::COMMANDS_TOTAL,
            "source" => source.as_str(),
            "command" => Self::command_label(name)
        )
        .increment(1);
    }

    fn delivery(&self, target: DeliveryTarget) {
        counter!(names::DELIVERIES_TOTAL, "target" => target.as_str()).increment(1);
    }

    fn message_read(&self) {
        counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(1);
    }

    fn message_written(&self) {
        counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(1);
    }

    fn mailbox_full(&self) {
        counter!(names::MAILBOX_FULL_TOTAL).increment(1);
    }

    fn format_failed(&self) {
        counter!(names::FORMAT_FAILURES_TOTAL).increment(1);
    }

    fn invalid_json(&self) {
        counter!(names::INVALID_JSON_TOTAL).increment(1);
    }

    fn pending_commands(&self, depth: usize) {
        gauge!(names::PENDING_COMMANDS).set(depth as f64);
    }

    fn client_count(&self, count: i64) {
        gauge!(names::CLIENTS).set(count as f64);
    }

    fn push_sent(&self, platform: Platform) {
        Self::push(platform, "sent");
    }

    fn push_error(&self, platform: Platform) {
        Self::push(platform, "error");
    }

    fn push_failure(&self, platform: Platform) {
        Self::push(platform, "failure");
    }
}
