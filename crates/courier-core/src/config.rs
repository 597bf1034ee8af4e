//! Hub configuration.
//!
//! Plain values with defaults. Loading them from files and the environment
//! is the binary's job; the hub only consumes them.

use std::time::Duration;

/// Top-level hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound mailbox capacity per socket.
    pub mailbox_capacity: usize,
    /// Whether clients may publish `message` commands.
    pub client_broadcasts: bool,
    /// Upper bound on commands being handled concurrently.
    pub max_inflight_commands: usize,
    pub presence: PresenceConfig,
    pub queue: QueueConfig,
    pub bus: BusConfig,
    pub mirror: MirrorConfig,
    pub session: SessionConfig,
    pub killswitch: KillswitchConfig,
    pub push: PushConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            client_broadcasts: true,
            max_inflight_commands: 1024,
            presence: PresenceConfig::default(),
            queue: QueueConfig::default(),
            bus: BusConfig::default(),
            mirror: MirrorConfig::default(),
            session: SessionConfig::default(),
            killswitch: KillswitchConfig::default(),
            push: PushConfig::default(),
        }
    }
}

/// Presence tracking.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long a mark stays valid.
    pub duration: Duration,
    /// Deadline for each presence round trip.
    pub timeout: Duration,
    /// Sorted-set key prefix; the key is `<prefix>:<user>`.
    pub key_prefix: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            key_prefix: "ClientPresence".to_string(),
        }
    }
}

/// Backend command queue and connection pool.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker tasks executing queued commands.
    pub workers: usize,
    /// Maximum live backend connections.
    pub pool_size: usize,
    /// Default deadline for queued commands.
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            pool_size: 8,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Shared bus channels.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pub/sub channel carrying commands between processes.
    pub channel: String,
    /// Durable list polled for commands.
    pub queue: String,
    /// List receiving failed Android deliveries.
    pub android_error_queue: String,
    /// Wait after an empty poll.
    pub poll_interval: Duration,
    /// Wait before resubscribing after a stream error.
    pub resubscribe_backoff: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: "courier".to_string(),
            queue: "courier_queue".to_string(),
            android_error_queue: "courier_android_errors".to_string(),
            poll_interval: Duration::from_millis(100),
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

/// Shared mirror hash keys.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub clients_key: String,
    pub pages_key: String,
    pub groups_key: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            clients_key: "SocketClients".to_string(),
            pages_key: "PageClients".to_string(),
            groups_key: "GroupClients".to_string(),
        }
    }
}

/// Per-connection session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between heartbeat pings on streaming connections.
    pub heartbeat_interval: Duration,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
    /// Deadline for the authenticate handshake.
    pub auth_timeout: Duration,
    /// How long a long-poll request waits for a message.
    pub longpoll_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            longpoll_timeout: Duration::from_secs(30),
        }
    }
}

/// Long-poll kill-switch.
#[derive(Debug, Clone)]
pub struct KillswitchConfig {
    pub key: String,
    pub poll_interval: Duration,
}

impl Default for KillswitchConfig {
    fn default() -> Self {
        Self {
            key: "longpoll_killswitch".to_string(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Push formatting.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Sound attached to iOS alerts.
    pub ios_sound: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            ios_sound: "bingbong.aiff".to_string(),
        }
    }
}
