//! Push delivery contracts.
//!
//! Mobile push gateways are external collaborators. The router formats a
//! notification and hands it to an [`IosPush`] or [`AndroidPush`]; how the
//! gateway talks to the vendor is its own business.

use async_trait::async_trait;
use courier_protocol::Message;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// A push platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push gateway errors.
#[derive(Debug, Error)]
pub enum PushError {
    /// No gateway is configured for the platform.
    #[error("{0} push is disabled")]
    Disabled(Platform),

    /// The gateway rejected or failed the request.
    #[error("gateway error: {0}")]
    Gateway(String),
}

/// An alert for one iOS device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IosNotification {
    pub device_token: String,
    /// Build variant selecting the gateway credentials.
    pub build: String,
    pub alert: Option<String>,
    pub badge: Option<i64>,
    pub sound: String,
    /// The formatted message, attached as `payload`.
    pub payload: Message,
}

impl IosNotification {
    /// Build a notification from a formatted message.
    #[must_use]
    pub fn from_message(
        device_token: impl Into<String>,
        build: impl Into<String>,
        sound: impl Into<String>,
        message: Message,
    ) -> Self {
        Self {
            device_token: device_token.into(),
            build: build.into(),
            alert: message.alert_text().map(str::to_string),
            badge: message.badge(),
            sound: sound.into(),
            payload: message,
        }
    }
}

/// A data push to a set of Android registrations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AndroidNotification {
    pub registration_ids: Vec<String>,
    /// `{event, data, time}`.
    pub data: Value,
}

impl AndroidNotification {
    #[must_use]
    pub fn from_message(registration_ids: Vec<String>, message: &Message) -> Self {
        Self {
            registration_ids,
            data: json!({
                "event": message.event,
                "data": message.data,
                "time": message.time,
            }),
        }
    }
}

/// Outcome of an Android push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AndroidReport {
    pub success: u32,
    pub failure: u32,
    /// Per-registration results, in request order.
    pub results: Vec<Value>,
}

/// Delivers iOS alerts.
#[async_trait]
pub trait IosPush: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the gateway failed the delivery.
    async fn send(&self, notification: IosNotification) -> Result<(), PushError>;
}

/// Delivers Android data messages.
#[async_trait]
pub trait AndroidPush: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the request as a whole failed.
    async fn send(&self, notification: AndroidNotification) -> Result<AndroidReport, PushError>;
}
