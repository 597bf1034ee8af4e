//! Server configuration.
//!
//! Configuration is layered:
//! - TOML configuration file (`COURIER_CONFIG`, or the first of the default paths)
//! - Environment variables (`COURIER__SECTION__KEY`, e.g. `COURIER__REDIS__POOL_SIZE`)
//!
//! Every field has a default, so an empty file (or none) is a valid setup.

use anyhow::{bail, Context, Result};
use courier_core::config::{
    BusConfig, HubConfig, KillswitchConfig, MirrorConfig, PresenceConfig, PushConfig,
    QueueConfig, SessionConfig,
};
use courier_transport::websocket::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default search paths, in order.
const CONFIG_PATHS: [&str; 3] = [
    "courier.toml",
    "/etc/courier/courier.toml",
    "~/.config/courier/courier.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether connected clients may publish `message` commands.
    #[serde(default = "default_true")]
    pub client_broadcasts: bool,

    /// Outbound mailbox capacity per connection.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// Upper bound on commands handled concurrently.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_commands: usize,

    #[serde(default)]
    pub websocket: WebSocketSection,

    #[serde(default)]
    pub long_poll: LongPollSection,

    #[serde(default)]
    pub redis: RedisSection,

    #[serde(default)]
    pub presence: PresenceSection,

    #[serde(default)]
    pub push: PushSection,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

/// WebSocket endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSection {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Seconds between heartbeat pings.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Deadline for one outbound write, in seconds.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Deadline for the authenticate handshake, in seconds.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

/// Long-poll endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollSection {
    #[serde(default = "default_lp_path")]
    pub path: String,

    /// Seconds a request waits for a message before answering 204.
    #[serde(default = "default_lp_timeout_secs")]
    pub timeout_secs: u64,
}

/// Shared Redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSection {
    /// Without Redis the process runs standalone: no bus, no mirror, no
    /// kill-switch, and presence is kept in memory.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Workers draining the command queue.
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Maximum live connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for queued commands, in milliseconds.
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Pub/sub channel carrying commands between processes.
    #[serde(default = "default_message_channel")]
    pub message_channel: String,

    /// Durable list polled for commands.
    #[serde(default = "default_message_queue")]
    pub message_queue: String,

    /// List receiving failed Android deliveries.
    #[serde(default = "default_android_error_queue")]
    pub android_error_queue: String,

    /// Wait after an empty queue poll, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wait before resubscribing after a pub/sub error, in milliseconds.
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,

    /// Key whose presence disables long-polling.
    #[serde(default = "default_killswitch_key")]
    pub killswitch_key: String,

    #[serde(default = "default_killswitch_poll_secs")]
    pub killswitch_poll_secs: u64,
}

/// Presence tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSection {
    /// Seconds a presence mark stays valid.
    #[serde(default = "default_presence_duration_secs")]
    pub duration_secs: u64,

    /// Deadline for each presence round trip, in milliseconds.
    #[serde(default = "default_presence_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_presence_prefix")]
    pub key_prefix: String,
}

/// Push gateways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSection {
    #[serde(default)]
    pub apns_enabled: bool,

    #[serde(default)]
    pub gcm_enabled: bool,

    /// Sound attached to iOS alerts.
    #[serde(default = "default_ios_sound")]
    pub ios_sound: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Periodic stats reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Interval of the client count and pending command gauges, in milliseconds.
    #[serde(default = "default_gauge_interval_ms")]
    pub gauge_interval_ms: u64,

    /// Interval of the connected clients log line, in seconds.
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_log_level() -> String {
    "courier=info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_mailbox_capacity() -> usize {
    1000
}

fn default_max_inflight() -> usize {
    1024
}

fn default_ws_path() -> String {
    "/socket".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_secs() -> u64 {
    20
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_lp_path() -> String {
    "/lp".to_string()
}

fn default_lp_timeout_secs() -> u64 {
    30
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_consumers() -> usize {
    4
}

fn default_pool_size() -> usize {
    8
}

fn default_redis_timeout_ms() -> u64 {
    5_000
}

fn default_message_channel() -> String {
    BusConfig::default().channel
}

fn default_message_queue() -> String {
    BusConfig::default().queue
}

fn default_android_error_queue() -> String {
    BusConfig::default().android_error_queue
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_resubscribe_backoff_ms() -> u64 {
    1_000
}

fn default_killswitch_key() -> String {
    KillswitchConfig::default().key
}

fn default_killswitch_poll_secs() -> u64 {
    5
}

fn default_presence_duration_secs() -> u64 {
    60
}

fn default_presence_timeout_ms() -> u64 {
    5_000
}

fn default_presence_prefix() -> String {
    PresenceConfig::default().key_prefix
}

fn default_ios_sound() -> String {
    PushConfig::default().ios_sound
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_gauge_interval_ms() -> u64 {
    1_000
}

fn default_log_interval_secs() -> u64 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            client_broadcasts: true,
            mailbox_capacity: default_mailbox_capacity(),
            max_inflight_commands: default_max_inflight(),
            websocket: WebSocketSection::default(),
            long_poll: LongPollSection::default(),
            redis: RedisSection::default(),
            presence: PresenceSection::default(),
            push: PushSection::default(),
            metrics: MetricsConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            max_message_size: default_max_message_size(),
            heartbeat_secs: default_heartbeat_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

impl Default for LongPollSection {
    fn default() -> Self {
        Self {
            path: default_lp_path(),
            timeout_secs: default_lp_timeout_secs(),
        }
    }
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            consumers: default_consumers(),
            pool_size: default_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            message_channel: default_message_channel(),
            message_queue: default_message_queue(),
            android_error_queue: default_android_error_queue(),
            poll_interval_ms: default_poll_interval_ms(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
            killswitch_key: default_killswitch_key(),
            killswitch_poll_secs: default_killswitch_poll_secs(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            duration_secs: default_presence_duration_secs(),
            timeout_ms: default_presence_timeout_ms(),
            key_prefix: default_presence_prefix(),
        }
    }
}

impl Default for PushSection {
    fn default() -> Self {
        Self {
            apns_enabled: false,
            gcm_enabled: false,
            ios_sound: default_ios_sound(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            gauge_interval_ms: default_gauge_interval_ms(),
            log_interval_secs: default_log_interval_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, layered with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("COURIER_CONFIG").ok().map(PathBuf::from);
        let path = explicit.or_else(|| {
            CONFIG_PATHS
                .iter()
                .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                .find(|path| path.exists())
        });
        Self::load_from(path.as_deref())
    }

    /// Load configuration from `path` (if any) with `COURIER__*` environment
    /// overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("COURIER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let source = match path {
            Some(path) => path.display().to_string(),
            None => "environment".to_string(),
        };
        builder
            .build()
            .and_then(::config::Config::try_deserialize)
            .with_context(|| format!("Failed to load config from {source}"))
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the hub cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.long_poll.timeout_secs == 0 {
            bail!("long_poll.timeout_secs must be greater than 0");
        }
        if self.redis.consumers == 0 {
            bail!("redis.consumers must be greater than 0");
        }
        if self.redis.pool_size == 0 {
            bail!("redis.pool_size must be greater than 0");
        }
        if self.redis.consumers > self.redis.pool_size {
            bail!(
                "redis.consumers ({}) must not exceed redis.pool_size ({})",
                self.redis.consumers,
                self.redis.pool_size
            );
        }
        if self.mailbox_capacity == 0 || self.max_inflight_commands == 0 {
            bail!("mailbox_capacity and max_inflight_commands must be greater than 0");
        }
        if self.websocket.heartbeat_secs == 0 {
            bail!("websocket.heartbeat_secs must be greater than 0");
        }
        if self.redis.killswitch_poll_secs == 0 {
            bail!("redis.killswitch_poll_secs must be greater than 0");
        }
        if self.stats.gauge_interval_ms == 0 || self.stats.log_interval_secs == 0 {
            bail!("stats intervals must be greater than 0");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// WebSocket transport settings.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.websocket.max_message_size,
        }
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            mailbox_capacity: self.mailbox_capacity,
            client_broadcasts: self.client_broadcasts,
            max_inflight_commands: self.max_inflight_commands,
            presence: PresenceConfig {
                duration: Duration::from_secs(self.presence.duration_secs),
                timeout: Duration::from_millis(self.presence.timeout_ms),
                key_prefix: self.presence.key_prefix.clone(),
            },
            queue: QueueConfig {
                workers: self.redis.consumers,
                pool_size: self.redis.pool_size,
                timeout: Duration::from_millis(self.redis.timeout_ms),
            },
            bus: BusConfig {
                channel: self.redis.message_channel.clone(),
                queue: self.redis.message_queue.clone(),
                android_error_queue: self.redis.android_error_queue.clone(),
                poll_interval: Duration::from_millis(self.redis.poll_interval_ms),
                resubscribe_backoff: Duration::from_millis(self.redis.resubscribe_backoff_ms),
            },
            mirror: MirrorConfig::default(),
            session: SessionConfig {
                heartbeat_interval: Duration::from_secs(self.websocket.heartbeat_secs),
                write_timeout: Duration::from_secs(self.websocket.write_timeout_secs),
                auth_timeout: Duration::from_secs(self.websocket.auth_timeout_secs),
                longpoll_timeout: Duration::from_secs(self.long_poll.timeout_secs),
            },
            killswitch: KillswitchConfig {
                key: self.redis.killswitch_key.clone(),
                poll_interval: Duration::from_secs(self.redis.killswitch_poll_secs),
            },
            push: PushConfig {
                ios_sound: self.push.ios_sound.clone(),
            },
        }
    }
}
