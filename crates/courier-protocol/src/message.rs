//! The outbound message delivered to clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload could not be turned into a deliverable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatError {
    /// `event` is missing or not a string.
    #[error("payload has no string `event` field")]
    MissingEvent,

    /// `data` is missing or not an object.
    #[error("payload has no object `data` field")]
    MissingData,
}

/// A message as written to a client.
///
/// ```json
/// {"event": "ping", "data": {}, "time": 1700000000}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event name.
    pub event: String,

    /// Event data.
    pub data: Map<String, Value>,

    /// Unix timestamp (seconds) at which the message was formatted.
    pub time: i64,

    /// Deep link copied from `data.internal_url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_url: Option<String>,

    /// Optional title copied from the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Message {
    /// Create a message with no link or title.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Map<String, Value>, time: i64) -> Self {
        Self {
            event: event.into(),
            data,
            time,
            internal_url: None,
            title: None,
        }
    }

    /// Format a payload map, stamping it with `time`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the payload lacks a string `event` or an
    /// object `data`.
    pub fn format(payload: &Map<String, Value>, time: i64) -> Result<Self, FormatError> {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or(FormatError::MissingEvent)?;
        let data = payload
            .get("data")
            .and_then(Value::as_object)
            .ok_or(FormatError::MissingData)?;

        let mut message = Self::new(event, data.clone(), time);
        message.internal_url = data
            .get("internal_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        message.title = payload
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(message)
    }

    /// The short text shown in a push alert: `data.message_text`, else
    /// `data.message`.
    #[must_use]
    pub fn alert_text(&self) -> Option<&str> {
        self.data
            .get("message_text")
            .or_else(|| self.data.get("message"))
            .and_then(Value::as_str)
    }

    /// Badge number from `data.badge_count`.
    #[must_use]
    pub fn badge(&self) -> Option<i64> {
        self.data.get("badge_count").and_then(|b| {
            b.as_i64()
                .or_else(|| b.as_f64().map(|f| f as i64))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_format_requires_event_and_data() {
        let err = Message::format(&payload(json!({"data": {}})), 0).unwrap_err();
        assert_eq!(err, FormatError::MissingEvent);

        let err = Message::format(&payload(json!({"event": "x", "data": []})), 0).unwrap_err();
        assert_eq!(err, FormatError::MissingData);

        let err = Message::format(&Map::new(), 0).unwrap_err();
        assert_eq!(err, FormatError::MissingEvent);
    }

    #[test]
    fn test_format_copies_link_and_title() {
        let message = Message::format(
            &payload(json!({
                "event": "comment",
                "title": "New reply",
                "data": {"internal_url": "app://c/1", "id": 1}
            })),
            42,
        )
        .unwrap();

        assert_eq!(message.event, "comment");
        assert_eq!(message.time, 42);
        assert_eq!(message.internal_url.as_deref(), Some("app://c/1"));
        assert_eq!(message.title.as_deref(), Some("New reply"));
    }

    #[test]
    fn test_serialized_shape() {
        let message = Message::format(&payload(json!({"event": "ping", "data": {}})), 7).unwrap();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"event": "ping", "data": {}, "time": 7}));
    }

    #[test]
    fn test_alert_and_badge() {
        let message = Message::format(
            &payload(json!({
                "event": "e",
                "data": {"message": "m", "message_text": "t", "badge_count": 3.0}
            })),
            0,
        )
        .unwrap();
        assert_eq!(message.alert_text(), Some("t"));
        assert_eq!(message.badge(), Some(3));
    }
}
