//! # courier server
//!
//! The `courier` binary's building blocks: configuration loading, the HTTP
//! routes in front of a [`courier_core::Hub`], Prometheus telemetry, logging
//! push gateways and periodic stats reporting.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod push;
pub mod stats;
