//! Hub assembly.
//!
//! [`HubBuilder`] wires the registry, router, command queue, presence
//! tracker, bus and kill-switch together according to which backend, if
//! any, is available, and starts their background tasks.

use courier_transport::TransportKind;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::Connector;
use crate::bus::Bus;
use crate::clock::{SharedClock, SystemClock};
use crate::config::HubConfig;
use crate::flags::FeatureFlags;
use crate::killswitch::Killswitch;
use crate::pool::Pool;
use crate::presence::PresenceTracker;
use crate::push::{AndroidPush, IosPush};
use crate::queue::CommandQueue;
use crate::registry::{Mirror, Registry};
use crate::router::Router;
use crate::socket::{Mailbox, Socket};
use crate::telemetry::{NoopTelemetry, SharedTelemetry};

/// What a configured backend is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    /// Shared by every process: presence, registry mirror, bus and
    /// kill-switch.
    Shared,
    /// Private to this process: presence only.
    PresenceOnly,
}

/// Errors building a hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("a hub must be built inside a tokio runtime")]
    NoRuntime,
}

/// Builds a [`Hub`].
pub struct HubBuilder {
    config: HubConfig,
    backend: Option<(Arc<dyn Connector>, BackendRole)>,
    telemetry: SharedTelemetry,
    clock: SharedClock,
    ios: Option<Arc<dyn IosPush>>,
    android: Option<Arc<dyn AndroidPush>>,
}

impl HubBuilder {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            backend: None,
            telemetry: Arc::new(NoopTelemetry),
            clock: Arc::new(SystemClock),
            ios: None,
            android: None,
        }
    }

    #[must_use]
    pub fn backend(mut self, connector: Arc<dyn Connector>, role: BackendRole) -> Self {
        self.backend = Some((connector, role));
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: SharedTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn ios(mut self, gateway: Arc<dyn IosPush>) -> Self {
        self.ios = Some(gateway);
        self
    }

    #[must_use]
    pub fn android(mut self, gateway: Arc<dyn AndroidPush>) -> Self {
        self.android = Some(gateway);
        self
    }

    /// Assemble the hub and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NoRuntime`] outside a tokio runtime.
    pub fn build(self) -> Result<Arc<Hub>, HubError> {
        Handle::try_current().map_err(|_| HubError::NoRuntime)?;

        let config = self.config;
        let flags = Arc::new(FeatureFlags::new(config.client_broadcasts));
        let mut tasks = Vec::new();

        let mut queue = None;
        let mut presence = None;
        let mut bus = None;
        let mut killswitch = None;
        let mut registry = Registry::new();

        if let Some((connector, role)) = self.backend {
            let pool = Pool::new(connector, config.queue.pool_size);
            let command_queue = Arc::new(CommandQueue::start(
                pool.clone(),
                config.queue.workers,
                config.queue.timeout,
                Arc::clone(&self.telemetry),
            ));
            presence = Some(Arc::new(PresenceTracker::new(
                Arc::clone(&command_queue),
                config.presence.clone(),
            )));

            if role == BackendRole::Shared {
                registry = Registry::with_mirror(Mirror::new(
                    pool.clone(),
                    config.mirror.clone(),
                    config.queue.timeout,
                ));
                bus = Some(Arc::new(Bus::new(
                    pool,
                    config.bus.clone(),
                    config.queue.timeout,
                    Arc::clone(&self.telemetry),
                )));
                killswitch = Some(Arc::new(Killswitch::new(
                    Arc::clone(&command_queue),
                    &config.killswitch,
                )));
            }
            queue = Some(command_queue);
            info!(?role, "Backend configured");
        } else {
            info!("No backend configured; presence disabled");
        }

        let registry = Arc::new(registry);
        let mut router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&flags),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.clock),
            config.push.clone(),
            config.max_inflight_commands,
        );
        if let Some(presence) = &presence {
            router = router.with_presence(Arc::clone(presence));
        }
        if let Some(bus) = &bus {
            router = router.with_bus(Arc::clone(bus));
        }
        if let Some(ios) = self.ios {
            router = router.with_ios(ios);
        }
        if let Some(android) = self.android {
            router = router.with_android(android);
        }
        let router = Arc::new(router);

        if let Some(bus) = &bus {
            tasks.extend(bus.spawn_listeners(Arc::clone(&router)));
        }
        if let Some(switch) = &killswitch {
            tasks.push(switch.spawn_monitor(Arc::clone(&flags), config.killswitch.poll_interval));
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Hub {
            config,
            registry,
            router,
            presence,
            queue,
            bus,
            killswitch,
            flags,
            telemetry: self.telemetry,
            clock: self.clock,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }
}

/// A running hub.
pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    router: Arc<Router>,
    presence: Option<Arc<PresenceTracker>>,
    queue: Option<Arc<CommandQueue>>,
    bus: Option<Arc<Bus>>,
    killswitch: Option<Arc<Killswitch>>,
    flags: Arc<FeatureFlags>,
    telemetry: SharedTelemetry,
    clock: SharedClock,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Create a socket for a new connection.
    #[must_use]
    pub fn new_socket(&self, kind: TransportKind) -> (Arc<Socket>, Mailbox) {
        Socket::new(
            kind,
            Arc::clone(&self.registry),
            self.presence.clone(),
            Arc::clone(&self.clock),
            self.config.mailbox_capacity,
        )
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub fn presence(&self) -> Option<&Arc<PresenceTracker>> {
        self.presence.as_ref()
    }

    #[must_use]
    pub fn bus(&self) -> Option<&Arc<Bus>> {
        self.bus.as_ref()
    }

    #[must_use]
    pub fn killswitch(&self) -> Option<&Arc<Killswitch>> {
        self.killswitch.as_ref()
    }

    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    #[must_use]
    pub fn telemetry(&self) -> &SharedTelemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Backend commands waiting for a worker.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.queue.as_ref().map_or(0, |queue| queue.pending())
    }

    /// Distinct identities connected, cluster-wide when mirrored.
    pub async fn client_count(&self) -> i64 {
        self.registry.count().await
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives as long as `self`
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Ask every session to close and stop background tasks.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Hub shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        if let Some(queue) = &self.queue {
            queue.shutdown();
        }
        debug!("Background tasks stopped");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
