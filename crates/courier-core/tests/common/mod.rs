#![allow(dead_code)]

use courier_core::backend::MemoryBackend;
use courier_core::config::HubConfig;
use courier_core::{BackendRole, Hub, HubBuilder, ManualClock};
use courier_transport::memory::{self, MemoryClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const START: i64 = 1_700_000_000;

pub struct TestHub {
    pub hub: Arc<Hub>,
    pub backend: MemoryBackend,
    pub clock: Arc<ManualClock>,
}

pub fn config() -> HubConfig {
    let mut config = HubConfig::default();
    config.bus.poll_interval = Duration::from_millis(5);
    config.bus.resubscribe_backoff = Duration::from_millis(5);
    config.session.longpoll_timeout = Duration::from_millis(200);
    config.queue.timeout = Duration::from_secs(1);
    config.presence.timeout = Duration::from_secs(1);
    config
}

pub fn hub_with(config: HubConfig, role: BackendRole) -> TestHub {
    let clock = Arc::new(ManualClock::new(START));
    let backend = MemoryBackend::new(clock.clone());
    let hub = HubBuilder::new(config)
        .backend(Arc::new(backend.clone()), role)
        .clock(clock.clone())
        .build()
        .unwrap();
    TestHub {
        hub,
        backend,
        clock,
    }
}

pub fn shared_hub() -> TestHub {
    hub_with(config(), BackendRole::Shared)
}

/// Connect a streaming client to `hub`; the session runs on its own task.
pub fn connect(hub: &Arc<Hub>) -> MemoryClient {
    let (client, reader, writer) = memory::pair(64);
    tokio::spawn(courier_core::serve_stream(Arc::clone(hub), reader, writer));
    client
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
