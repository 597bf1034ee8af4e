//! # courier-core
//!
//! Connections, routing and backend coordination for the courier fan-out
//! hub.
//!
//! - **Socket** - one connection, its mailbox and lifecycle
//! - **Registry** - local index by user, page and group, mirrored to the
//!   shared backend
//! - **Router** - turns parsed commands into fan-out, presence updates and
//!   pushes
//! - **CommandQueue** / **Pool** - backend work off the hot path with
//!   bounded connections and per-call deadlines
//! - **PresenceTracker** - time-bounded activity marks
//! - **Bus** - commands from other processes
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Session  │──▶│  Router  │──▶│ Registry │──▶│  Socket  │──▶ mailbox
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘
//!                  ▲      │
//!        ┌─────────┘      ▼
//!   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!   │   Bus    │   │ Presence │──▶│  Queue   │──▶│   Pool   │──▶ backend
//!   └──────────┘   └──────────┘   └──────────┘   └──────────┘
//! ```

pub mod backend;
pub mod bus;
pub mod clock;
pub mod config;
pub mod flags;
pub mod hub;
pub mod killswitch;
pub mod pool;
pub mod presence;
pub mod push;
pub mod queue;
pub mod registry;
pub mod router;
pub mod session;
pub mod socket;
pub mod telemetry;

pub use backend::{BackendError, Connector, MemoryBackend, RedisConnector};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::HubConfig;
pub use flags::FeatureFlags;
pub use hub::{BackendRole, Hub, HubBuilder, HubError};
pub use presence::PresenceTracker;
pub use queue::{CommandQueue, QueueError};
pub use registry::{Registry, RegistryError};
pub use router::Router;
pub use session::{serve_long_poll, serve_stream, LongPollOutcome, LongPollRequest};
pub use socket::{Socket, SocketError, SocketId, SocketState};
pub use telemetry::{NoopTelemetry, SharedTelemetry, Telemetry};
