//! Parsed commands.
//!
//! [`Command::parse`] turns an [`Envelope`] into a tagged union once, so
//! handlers never probe the raw maps themselves. Anything that cannot be
//! understood becomes [`Command::Malformed`] or [`Command::Unrecognized`].

use crate::envelope::{keys, Envelope};
use serde_json::Value;
use std::collections::HashSet;

/// Who a `message` is addressed to, resolved in priority order:
/// `users` > `user` > `page` > `groups` > everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Several users, each resolved independently.
    Users {
        users: Vec<String>,
        /// Only sockets currently on this page receive the message.
        page: Option<String>,
    },
    /// A single user.
    User {
        user: String,
        /// Only sockets currently on this page receive the message.
        page: Option<String>,
    },
    /// Every socket on a page.
    Page(String),
    /// Every socket in any of the groups.
    Groups(Vec<String>),
    /// Every connected socket.
    All,
}

impl Addressing {
    /// Resolve addressing from the command map.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let page = envelope
            .param(keys::PAGE)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        if let Some(users) = envelope.param(keys::USERS) {
            return Addressing::Users {
                users: split_list(users),
                page,
            };
        }
        if let Some(user) = envelope.param(keys::USER) {
            return Addressing::User {
                user: user.to_string(),
                page,
            };
        }
        if let Some(page) = page {
            return Addressing::Page(page);
        }
        if let Some(groups) = envelope.param(keys::GROUPS) {
            return Addressing::Groups(split_list(groups));
        }
        Addressing::All
    }
}

/// Where to deliver an iOS push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IosTarget {
    pub device_token: String,
    /// Build variant selecting the gateway credentials (store, beta, ...).
    pub build: String,
}

impl IosTarget {
    fn from_envelope(envelope: &Envelope) -> Result<Self, &'static str> {
        let device_token = envelope
            .param(keys::DEVICE_TOKEN)
            .ok_or("device token not provided")?;
        let build = envelope.param(keys::BUILD).ok_or("build not provided")?;
        Ok(Self {
            device_token: device_token.to_string(),
            build: build.to_string(),
        })
    }
}

/// Where to deliver an Android push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidTarget {
    pub registration_ids: Vec<String>,
}

impl AndroidTarget {
    fn from_envelope(envelope: &Envelope) -> Result<Self, &'static str> {
        let ids = envelope
            .param(keys::REGISTRATION_IDS)
            .ok_or("registration ids not provided")?;
        let registration_ids = split_list(ids);
        if registration_ids.is_empty() {
            return Err("registration ids not provided");
        }
        Ok(Self { registration_ids })
    }
}

/// A push target selected by `push_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTarget {
    Ios(IosTarget),
    Android(AndroidTarget),
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Bind an identity to a streaming connection.
    Authenticate { user: String },
    /// Fan a message out.
    Message { addressing: Addressing },
    /// Move the socket to a page.
    SetPage { page: String },
    /// Replace the socket's group memberships.
    SetGroups { groups: Vec<String> },
    /// Mark the socket's user active or inactive.
    SetPresence { active: bool },
    /// Deliver an iOS push.
    PushIos(IosTarget),
    /// Deliver an Android push.
    PushAndroid(AndroidTarget),
    /// Deliver a push selected by `push_type`.
    Push(PushTarget),
    /// Deliver live if `user` is active, else push.
    PushOrMessage {
        user: Option<String>,
        addressing: Addressing,
        ios: Option<IosTarget>,
        android: Option<AndroidTarget>,
    },
    /// A known command with missing or invalid parameters.
    Malformed {
        command: String,
        reason: &'static str,
    },
    /// An unknown command name, or no name at all (empty string).
    Unrecognized(String),
}

impl Command {
    /// Validate an envelope.
    #[must_use]
    pub fn parse(envelope: &Envelope) -> Self {
        let Some(name) = envelope.command_name() else {
            return Command::Unrecognized(String::new());
        };

        let malformed = |reason| Command::Malformed {
            command: name.clone(),
            reason,
        };

        match name.as_str() {
            "authenticate" => match envelope.param(keys::USER) {
                Some(user) if !user.is_empty() => Command::Authenticate {
                    user: user.to_string(),
                },
                _ => malformed("user not provided"),
            },
            "message" => Command::Message {
                addressing: Addressing::from_envelope(envelope),
            },
            "setpage" => match envelope.param(keys::PAGE) {
                Some(page) if !page.is_empty() => Command::SetPage {
                    page: page.to_string(),
                },
                _ => malformed("page not provided"),
            },
            "setgroups" => match envelope.param(keys::GROUPS).map(split_list) {
                Some(groups) if !groups.is_empty() => Command::SetGroups { groups },
                _ => malformed("groups not provided"),
            },
            "setpresence" => match envelope.message.get("presence") {
                Some(Value::Bool(active)) => Command::SetPresence { active: *active },
                Some(_) => malformed("presence is not a boolean"),
                None => malformed("presence not provided"),
            },
            "pushios" => match IosTarget::from_envelope(envelope) {
                Ok(target) => Command::PushIos(target),
                Err(reason) => malformed(reason),
            },
            "pushandroid" => match AndroidTarget::from_envelope(envelope) {
                Ok(target) => Command::PushAndroid(target),
                Err(reason) => malformed(reason),
            },
            "push" => {
                let push_type = envelope
                    .param(keys::PUSH_TYPE)
                    .map(str::to_lowercase)
                    .unwrap_or_default();
                let target = match push_type.as_str() {
                    "ios" => IosTarget::from_envelope(envelope).map(PushTarget::Ios),
                    "android" => AndroidTarget::from_envelope(envelope).map(PushTarget::Android),
                    _ => Err("unknown push type"),
                };
                match target {
                    Ok(target) => Command::Push(target),
                    Err(reason) => malformed(reason),
                }
            }
            "pushormessage" => Command::PushOrMessage {
                user: envelope
                    .param(keys::USER)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string),
                addressing: Addressing::from_envelope(envelope),
                ios: IosTarget::from_envelope(envelope).ok(),
                android: AndroidTarget::from_envelope(envelope).ok(),
            },
            _ => Command::Unrecognized(name),
        }
    }

    /// Whether a directly-connected client may issue this command.
    ///
    /// Pushes are only accepted from the shared bus so that clients cannot
    /// forge them.
    #[must_use]
    pub fn is_client_command(&self) -> bool {
        matches!(
            self,
            Command::Authenticate { .. }
                | Command::Message { .. }
                | Command::SetPage { .. }
                | Command::SetGroups { .. }
                | Command::SetPresence { .. }
        )
    }
}

/// Split a comma separated list, dropping whitespace, empty items and
/// repeats. The first occurrence keeps its position.
#[must_use]
pub fn split_list(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(',')
        .map(|item| item.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Envelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_addressing_priority() {
        let e = envelope(json!({"command": {
            "command": "message", "users": "a, b", "user": "c", "page": "/p", "groups": "g"
        }}));
        assert_eq!(
            Addressing::from_envelope(&e),
            Addressing::Users {
                users: vec!["a".into(), "b".into()],
                page: Some("/p".into())
            }
        );

        let e = envelope(json!({"command": {"command": "message", "user": "c", "groups": "g"}}));
        assert_eq!(
            Addressing::from_envelope(&e),
            Addressing::User {
                user: "c".into(),
                page: None
            }
        );

        let e = envelope(json!({"command": {"command": "message", "page": "/p", "groups": "g"}}));
        assert_eq!(Addressing::from_envelope(&e), Addressing::Page("/p".into()));

        let e = envelope(json!({"command": {"command": "message", "groups": "g1,g2"}}));
        assert_eq!(
            Addressing::from_envelope(&e),
            Addressing::Groups(vec!["g1".into(), "g2".into()])
        );

        let e = envelope(json!({"command": {"command": "message"}}));
        assert_eq!(Addressing::from_envelope(&e), Addressing::All);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let e = envelope(json!({"command": {"command": "SETPAGE", "page": "/home"}}));
        assert_eq!(
            Command::parse(&e),
            Command::SetPage {
                page: "/home".into()
            }
        );
    }

    #[test]
    fn test_parse_set_groups() {
        let e = envelope(json!({"command": {"command": "setgroups", "groups": " a , b,,c "}}));
        assert_eq!(
            Command::parse(&e),
            Command::SetGroups {
                groups: vec!["a".into(), "b".into(), "c".into()]
            }
        );

        let e = envelope(json!({"command": {"command": "setgroups", "groups": "g, g ,h,g"}}));
        assert_eq!(
            Command::parse(&e),
            Command::SetGroups {
                groups: vec!["g".into(), "h".into()]
            }
        );

        let e = envelope(json!({"command": {"command": "setgroups", "groups": " , "}}));
        assert!(matches!(Command::parse(&e), Command::Malformed { .. }));
    }

    #[test]
    fn test_parse_set_presence() {
        let e = envelope(json!({"command": {"command": "setpresence"}, "message": {"presence": true}}));
        assert_eq!(Command::parse(&e), Command::SetPresence { active: true });

        let e = envelope(json!({"command": {"command": "setpresence"}, "message": {"presence": "yes"}}));
        assert!(matches!(Command::parse(&e), Command::Malformed { .. }));

        let e = envelope(json!({"command": {"command": "setpresence"}}));
        assert!(matches!(Command::parse(&e), Command::Malformed { .. }));
    }

    #[test]
    fn test_parse_push_selects_platform() {
        let e = envelope(json!({"command": {
            "command": "push", "push_type": "IOS", "device_token": "tok", "build": "store"
        }}));
        assert_eq!(
            Command::parse(&e),
            Command::Push(PushTarget::Ios(IosTarget {
                device_token: "tok".into(),
                build: "store".into()
            }))
        );

        let e = envelope(json!({"command": {
            "command": "push", "push_type": "android", "registration_ids": "r1,r2"
        }}));
        assert_eq!(
            Command::parse(&e),
            Command::Push(PushTarget::Android(AndroidTarget {
                registration_ids: vec!["r1".into(), "r2".into()]
            }))
        );

        let e = envelope(json!({"command": {"command": "push", "push_type": "pager"}}));
        assert!(matches!(Command::parse(&e), Command::Malformed { .. }));
    }

    #[test]
    fn test_parse_push_ios_requires_build() {
        let e = envelope(json!({"command": {"command": "pushios", "device_token": "tok"}}));
        assert_eq!(
            Command::parse(&e),
            Command::Malformed {
                command: "pushios".into(),
                reason: "build not provided"
            }
        );
    }

    #[test]
    fn test_push_commands_are_not_client_commands() {
        let e = envelope(json!({"command": {"command": "pushandroid", "registration_ids": "r"}}));
        assert!(!Command::parse(&e).is_client_command());

        let e = envelope(json!({"command": {"command": "message"}}));
        assert!(Command::parse(&e).is_client_command());
    }

    #[test]
    fn test_missing_and_unknown_commands() {
        assert_eq!(
            Command::parse(&Envelope::default()),
            Command::Unrecognized(String::new())
        );
        assert_eq!(
            Command::parse(&Envelope::new("Dance")),
            Command::Unrecognized("dance".into())
        );
    }
}
