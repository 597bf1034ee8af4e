//! Push gateways shipped with the server.
//!
//! These log each notification instead of contacting a vendor, which is
//! enough to see what would be delivered and to exercise the hub's push
//! paths end to end. A vendor gateway implements the same traits.

use async_trait::async_trait;
use courier_core::push::{
    AndroidNotification, AndroidPush, AndroidReport, IosNotification, IosPush, PushError,
};
use serde_json::json;
use tracing::info;

/// Logs iOS alerts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingIos;

#[async_trait]
impl IosPush for LoggingIos {
    async fn send(&self, notification: IosNotification) -> Result<(), PushError> {
        info!(
            device_token = %notification.device_token,
            build = %notification.build,
            alert = ?notification.alert,
            badge = ?notification.badge,
            event = %notification.payload.event,
            "iOS push"
        );
        Ok(())
    }
}

/// Logs Android data messages. Every registration is reported delivered.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAndroid;

#[async_trait]
impl AndroidPush for LoggingAndroid {
    async fn send(&self, notification: AndroidNotification) -> Result<AndroidReport, PushError> {
        info!(
            registrations = notification.registration_ids.len(),
            data = %notification.data,
            "Android push"
        );
        let results = notification
            .registration_ids
            .iter()
            .map(|id| json!({ "registration_id": id, "logged": true }))
            .collect::<Vec<_>>();
        Ok(AndroidReport {
            success: u32::try_from(results.len()).unwrap_or(u32::MAX),
            failure: 0,
            results,
        })
    }
}
