//! The inbound command envelope.
//!
//! Both directly-connected clients and the shared bus deliver the same shape:
//! a `command` object whose values are all strings, and an optional
//! `message` object carrying the payload.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Keys recognized in the `command` map.
pub mod keys {
    pub const COMMAND: &str = "command";
    pub const USER: &str = "user";
    pub const USERS: &str = "users";
    pub const PAGE: &str = "page";
    pub const GROUPS: &str = "groups";
    pub const DEVICE_TOKEN: &str = "device_token";
    pub const BUILD: &str = "build";
    pub const PUSH_TYPE: &str = "push_type";
    pub const REGISTRATION_IDS: &str = "registration_ids";
}

/// A decoded inbound envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command name and addressing parameters.
    #[serde(default, deserialize_with = "null_as_default")]
    pub command: HashMap<String, String>,

    /// Free-form payload.
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Map::is_empty"
    )]
    pub message: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope for the given command name.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        let mut map = HashMap::new();
        map.insert(keys::COMMAND.to_string(), command.into());
        Self {
            command: map,
            message: Map::new(),
        }
    }

    /// Set a command parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.insert(key.into(), value.into());
        self
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_message(mut self, message: Map<String, Value>) -> Self {
        self.message = message;
        self
    }

    /// The command name, lowercased. `None` if the key is absent.
    #[must_use]
    pub fn command_name(&self) -> Option<String> {
        self.command.get(keys::COMMAND).map(|c| c.to_lowercase())
    }

    /// Look up a command parameter.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.command.get(key).map(String::as_str)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
