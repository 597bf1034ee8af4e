//! Command routing.
//!
//! Every inbound envelope, whether from a connected client or the shared
//! bus, is parsed once by [`Command::parse`] and dispatched here. Clients
//! may only issue `message`, `setpage`, `setgroups` and `setpresence`;
//! pushes are accepted from the bus alone.
//!
//! Fan-out never waits on a recipient: each target gets a non-blocking
//! mailbox push, and a closed or full socket is skipped.

use courier_protocol::{
    Addressing, AndroidTarget, Command, Envelope, IosTarget, Message, PushTarget,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use crate::bus::Bus;
use crate::clock::SharedClock;
use crate::config::PushConfig;
use crate::flags::FeatureFlags;
use crate::presence::PresenceTracker;
use crate::push::{AndroidNotification, AndroidPush, IosNotification, IosPush, Platform};
use crate::registry::Registry;
use crate::socket::{Socket, SocketError};
use crate::telemetry::{CommandSource, DeliveryTarget, SharedTelemetry};

/// Routes parsed commands to the registry, presence tracker, bus and push
/// gateways.
pub struct Router {
    registry: Arc<Registry>,
    presence: Option<Arc<PresenceTracker>>,
    bus: Option<Arc<Bus>>,
    ios: Option<Arc<dyn IosPush>>,
    android: Option<Arc<dyn AndroidPush>>,
    flags: Arc<FeatureFlags>,
    telemetry: SharedTelemetry,
    clock: SharedClock,
    push: PushConfig,
    /// Caps commands being handled concurrently.
    inflight: Arc<Semaphore>,
}

impl Router {
    /// A router with no presence tracker, bus or push gateways.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        flags: Arc<FeatureFlags>,
        telemetry: SharedTelemetry,
        clock: SharedClock,
        push: PushConfig,
        max_inflight: usize,
    ) -> Self {
        Self {
            registry,
            presence: None,
            bus: None,
            ios: None,
            android: None,
            flags,
            telemetry,
            clock,
            push,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
        }
    }

    #[must_use]
    pub fn with_presence(mut self, presence: Arc<PresenceTracker>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Forward client messages to `bus` instead of fanning out locally.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    #[must_use]
    pub fn with_ios(mut self, gateway: Arc<dyn IosPush>) -> Self {
        self.ios = Some(gateway);
        self
    }

    #[must_use]
    pub fn with_android(mut self, gateway: Arc<dyn AndroidPush>) -> Self {
        self.android = Some(gateway);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle a client command on its own task.
    ///
    /// Waits for an in-flight slot first, so a flood of commands applies
    /// backpressure to the caller instead of spawning without bound.
    pub async fn dispatch_client(self: &Arc<Self>, socket: &Arc<Socket>, envelope: Envelope) {
        let Ok(permit) = Arc::clone(&self.inflight).acquire_owned().await else {
            return;
        };
        let router = Arc::clone(self);
        let socket = Arc::clone(socket);
        tokio::spawn(async move {
            router.handle_client(&socket, envelope).await;
            drop(permit);
        });
    }

    /// Handle a bus command on its own task.
    pub async fn dispatch_bus(self: &Arc<Self>, envelope: Envelope) {
        let Ok(permit) = Arc::clone(&self.inflight).acquire_owned().await else {
            return;
        };
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router.handle_bus(envelope).await;
            drop(permit);
        });
    }

    /// Handle a command sent by a connected client.
    pub async fn handle_client(&self, socket: &Arc<Socket>, envelope: Envelope) {
        let Some(name) = envelope.command_name() else {
            debug!(socket = %socket.id(), "Ignoring envelope without a command");
            return;
        };
        self.telemetry.command(CommandSource::Client, &name);
        trace!(socket = %socket.id(), command = %name, "Client command");

        let result = match Command::parse(&envelope) {
            Command::Message { addressing } => {
                if !self.flags.client_broadcasts() {
                    debug!(socket = %socket.id(), "Client broadcasts disabled");
                    return;
                }
                match &self.bus {
                    Some(bus) => {
                        if let Err(e) = bus.publish(&envelope).await {
                            warn!(socket = %socket.id(), error = %e, "Failed to forward message to bus");
                        }
                    }
                    None => {
                        self.fan_out(&addressing, &envelope.message);
                    }
                }
                Ok(())
            }
            Command::SetPage { page } => socket.set_page(page).await,
            Command::SetGroups { groups } => socket.set_groups(groups).await,
            Command::SetPresence { active } => {
                socket.set_presence(active).await;
                Ok(())
            }
            Command::Authenticate { .. } => {
                debug!(socket = %socket.id(), "Ignoring repeated authenticate");
                Ok(())
            }
            Command::Malformed { command, reason } => {
                debug!(socket = %socket.id(), command = %command, reason, "Ignoring malformed command");
                Ok(())
            }
            Command::Unrecognized(command) => {
                debug!(socket = %socket.id(), command = %command, "Ignoring unrecognized command");
                Ok(())
            }
            command => {
                warn!(socket = %socket.id(), ?command, "Client may not issue push commands");
                Ok(())
            }
        };

        if let Err(e) = result {
            match e {
                SocketError::Registry(e) => {
                    warn!(socket = %socket.id(), error = %e, "Registry mirror not updated");
                }
                e => debug!(socket = %socket.id(), error = %e, "Command not applied"),
            }
        }
    }

    /// Handle a command received from the shared bus.
    pub async fn handle_bus(&self, envelope: Envelope) {
        let Some(name) = envelope.command_name() else {
            debug!("Ignoring bus envelope without a command");
            return;
        };
        self.telemetry.command(CommandSource::Bus, &name);
        trace!(command = %name, "Bus command");

        match Command::parse(&envelope) {
            Command::Message { addressing } => {
                self.fan_out(&addressing, &envelope.message);
            }
            Command::PushIos(target) => self.push_ios(&target, &envelope.message).await,
            Command::PushAndroid(target) => self.push_android(&target, &envelope.message).await,
            Command::Push(PushTarget::Ios(target)) => {
                self.push_ios(&target, &envelope.message).await;
            }
            Command::Push(PushTarget::Android(target)) => {
                self.push_android(&target, &envelope.message).await;
            }
            Command::PushOrMessage {
                user,
                addressing,
                ios,
                android,
            } => {
                self.push_or_message(user.as_deref(), &addressing, ios, android, &envelope.message)
                    .await;
            }
            Command::Malformed { command, reason } => {
                warn!(command = %command, reason, "Ignoring malformed bus command");
            }
            command => {
                debug!(?command, "Ignoring bus command");
            }
        }
    }

    /// Deliver `payload` per `addressing`. Returns the number of sockets the
    /// message was queued for.
    ///
    /// The payload is formatted once; if that fails nothing is delivered.
    pub fn fan_out(&self, addressing: &Addressing, payload: &Map<String, Value>) -> usize {
        let message = match Message::format(payload, self.clock.now()) {
            Ok(message) => Arc::new(message),
            Err(e) => {
                self.telemetry.format_failed();
                debug!(error = %e, "Dropping unformattable message");
                return 0;
            }
        };

        match addressing {
            Addressing::Users { users, page } => {
                self.telemetry.delivery(DeliveryTarget::User);
                users
                    .iter()
                    .map(|user| self.deliver_to_user(user, page.as_deref(), &message))
                    .sum()
            }
            Addressing::User { user, page } => {
                self.telemetry.delivery(DeliveryTarget::User);
                self.deliver_to_user(user, page.as_deref(), &message)
            }
            Addressing::Page(page) => {
                self.telemetry.delivery(DeliveryTarget::Page);
                match self.registry.lookup_page(page) {
                    Ok(sockets) => self.deliver_all(&sockets, &message),
                    Err(e) => {
                        trace!(error = %e, "No sockets on page");
                        0
                    }
                }
            }
            Addressing::Groups(groups) => {
                self.telemetry.delivery(DeliveryTarget::Groups);
                let sockets = self.registry.lookup_groups(groups);
                self.deliver_all(&sockets, &message)
            }
            Addressing::All => {
                self.telemetry.delivery(DeliveryTarget::Broadcast);
                let sockets = self.registry.all_sockets();
                self.deliver_all(&sockets, &message)
            }
        }
    }

    fn deliver_to_user(&self, user: &str, page: Option<&str>, message: &Arc<Message>) -> usize {
        let sockets = match self.registry.lookup_by_user(user) {
            Ok(sockets) => sockets,
            Err(e) => {
                trace!(user = %user, error = %e, "Skipping user");
                return 0;
            }
        };

        let targets: Vec<_> = match page {
            Some(page) => sockets
                .into_iter()
                .filter(|socket| socket.page().as_deref() == Some(page))
                .collect(),
            None => sockets,
        };
        self.deliver_all(&targets, message)
    }

    fn deliver_all(&self, sockets: &[Arc<Socket>], message: &Arc<Message>) -> usize {
        let mut delivered = 0;
        for socket in sockets {
            match socket.deliver(Arc::clone(message)) {
                Ok(()) => delivered += 1,
                Err(SocketError::MailboxFull) => {
                    self.telemetry.mailbox_full();
                    warn!(socket = %socket.id(), "Mailbox full, dropping message");
                }
                Err(_) => trace!(socket = %socket.id(), "Skipping closed socket"),
            }
        }
        delivered
    }

    async fn push_ios(&self, target: &IosTarget, payload: &Map<String, Value>) {
        let Some(gateway) = &self.ios else {
            debug!("iOS push disabled");
            return;
        };
        let message = match Message::format(payload, self.clock.now()) {
            Ok(message) => message,
            Err(e) => {
                self.telemetry.format_failed();
                warn!(error = %e, "Could not format iOS push");
                return;
            }
        };

        let notification = IosNotification::from_message(
            target.device_token.as_str(),
            target.build.as_str(),
            self.push.ios_sound.as_str(),
            message,
        );
        self.telemetry.push_sent(Platform::Ios);
        if let Err(e) = gateway.send(notification).await {
            self.telemetry.push_error(Platform::Ios);
            warn!(build = %target.build, error = %e, "iOS push failed");
        }
    }

    async fn push_android(&self, target: &AndroidTarget, payload: &Map<String, Value>) {
        let Some(gateway) = &self.android else {
            debug!("Android push disabled");
            return;
        };
        let message = match Message::format(payload, self.clock.now()) {
            Ok(message) => message,
            Err(e) => {
                self.telemetry.format_failed();
                warn!(error = %e, "Could not format Android push");
                return;
            }
        };

        let notification =
            AndroidNotification::from_message(target.registration_ids.clone(), &message);
        self.telemetry.push_sent(Platform::Android);
        let report = match gateway.send(notification).await {
            Ok(report) => report,
            Err(e) => {
                self.telemetry.push_error(Platform::Android);
                warn!(error = %e, "Android push failed");
                return;
            }
        };

        if report.failure == 0 {
            return;
        }
        self.telemetry.push_failure(Platform::Android);
        match &self.bus {
            Some(bus) => {
                if let Err(e) = bus
                    .push_android_failure(&target.registration_ids, &report.results)
                    .await
                {
                    warn!(error = %e, "Could not record Android failures");
                }
            }
            None => warn!(
                failures = report.failure,
                "Android push had failures and no bus is configured to record them"
            ),
        }
    }

    /// Deliver live if `user` is active, otherwise push.
    ///
    /// An unknown presence answer (timeout, backend down, no tracker) is
    /// treated as inactive.
    async fn push_or_message(
        &self,
        user: Option<&str>,
        addressing: &Addressing,
        ios: Option<IosTarget>,
        android: Option<AndroidTarget>,
        payload: &Map<String, Value>,
    ) {
        let active = match (user, &self.presence) {
            (Some(user), Some(presence)) => {
                match presence.is_active(user, self.clock.now()).await {
                    Ok(active) => active,
                    Err(e) => {
                        debug!(user = %user, error = %e, "Presence unknown, pushing");
                        false
                    }
                }
            }
            _ => false,
        };

        if active {
            match payload.get("websocket").and_then(Value::as_object) {
                Some(live) => {
                    self.fan_out(addressing, live);
                }
                None => debug!("pushormessage without a websocket payload"),
            }
            return;
        }

        let Some(push) = payload.get("push").and_then(Value::as_object) else {
            debug!("pushormessage without a push payload");
            return;
        };
        if let (Some(target), Some(ios_payload)) =
            (ios, push.get("ios").and_then(Value::as_object))
        {
            self.push_ios(&target, ios_payload).await;
        }
        if let (Some(target), Some(android_payload)) =
            (android, push.get("android").and_then(Value::as_object))
        {
            self.push_android(&target, android_payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::push::{AndroidReport, PushError};
    use crate::socket::Mailbox;
    use crate::telemetry::NoopTelemetry;
    use async_trait::async_trait;
    use courier_transport::TransportKind;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingIos {
        sent: Mutex<Vec<IosNotification>>,
    }

    #[async_trait]
    impl IosPush for RecordingIos {
        async fn send(&self, notification: IosNotification) -> Result<(), PushError> {
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }

    struct Fixture {
        router: Router,
        registry: Arc<Registry>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let router = Router::new(
            Arc::clone(&registry),
            Arc::new(FeatureFlags::default()),
            Arc::new(NoopTelemetry),
            clock.clone(),
            PushConfig::default(),
            16,
        );
        Fixture {
            router,
            registry,
            clock,
        }
    }

    async fn connect(f: &Fixture, user: &str) -> (Arc<Socket>, Mailbox) {
        let (socket, mailbox) = Socket::new(
            TransportKind::Stream,
            Arc::clone(&f.registry),
            None,
            f.clock.clone(),
            8,
        );
        socket.authenticate_direct(user).await.unwrap();
        (socket, mailbox)
    }

    fn payload() -> Map<String, Value> {
        json!({"event": "ping", "data": {}}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_users_fan_out_skips_missing() {
        let f = fixture();
        let (_a, mut ma) = connect(&f, "a").await;
        let (_c, mut mc) = connect(&f, "c").await;

        let addressing = Addressing::Users {
            users: vec!["a".into(), "b".into(), "c".into()],
            page: None,
        };
        assert_eq!(f.router.fan_out(&addressing, &payload()), 2);
        assert_eq!(ma.try_recv().unwrap().event, "ping");
        assert_eq!(mc.try_recv().unwrap().event, "ping");
    }

    #[tokio::test]
    async fn test_page_filter_on_user() {
        let f = fixture();
        let (a1, mut m1) = connect(&f, "a").await;
        let (_a2, mut m2) = connect(&f, "a").await;
        a1.set_page("/inbox".into()).await.unwrap();

        let addressing = Addressing::User {
            user: "a".into(),
            page: Some("/inbox".into()),
        };
        assert_eq!(f.router.fan_out(&addressing, &payload()), 1);
        assert!(m1.try_recv().is_some());
        assert!(m2.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unformattable_payload_delivers_nothing() {
        let f = fixture();
        let (_a, mut ma) = connect(&f, "a").await;

        let bad = json!({"event": "ping"}).as_object().cloned().unwrap();
        assert_eq!(f.router.fan_out(&Addressing::All, &bad), 0);
        assert!(ma.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_sockets() {
        let f = fixture();
        let (a, _ma) = connect(&f, "a").await;
        let (_b, mut mb) = connect(&f, "b").await;
        // Closed but still referenced by the caller
        a.close().await;

        assert_eq!(f.router.fan_out(&Addressing::All, &payload()), 1);
        assert!(mb.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_client_message_respects_broadcast_flag() {
        let f = fixture();
        let (a, mut ma) = connect(&f, "a").await;

        let envelope = Envelope::new("message")
            .with_param("user", "a")
            .with_message(payload());
        f.router.flags.set_client_broadcasts(false);
        f.router.handle_client(&a, envelope.clone()).await;
        assert!(ma.try_recv().is_none());

        f.router.flags.set_client_broadcasts(true);
        f.router.handle_client(&a, envelope).await;
        assert!(ma.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_client_cannot_push() {
        let ios = Arc::new(RecordingIos::default());
        let mut f = fixture();
        f.router = f.router.with_ios(ios.clone());
        let (a, _ma) = connect(&f, "a").await;

        let envelope = Envelope::new("pushios")
            .with_param("device_token", "tok")
            .with_param("build", "store")
            .with_message(payload());
        f.router.handle_client(&a, envelope.clone()).await;
        assert!(ios.sent.lock().unwrap().is_empty());

        f.router.handle_bus(envelope).await;
        let sent = ios.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_token, "tok");
        assert_eq!(sent[0].sound, "bingbong.aiff");
    }

    #[tokio::test]
    async fn test_push_or_message_without_presence_pushes() {
        let ios = Arc::new(RecordingIos::default());
        let mut f = fixture();
        f.router = f.router.with_ios(ios.clone());
        let (_a, mut ma) = connect(&f, "a").await;

        let message = json!({
            "websocket": {"event": "live", "data": {}},
            "push": {"ios": {"event": "push", "data": {"message": "hi"}}}
        });
        let envelope = Envelope::new("pushormessage")
            .with_param("user", "a")
            .with_param("device_token", "tok")
            .with_param("build", "store")
            .with_message(message.as_object().cloned().unwrap());
        f.router.handle_bus(envelope).await;

        assert!(ma.try_recv().is_none());
        let sent = ios.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].alert.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_android_failures_without_bus_are_logged() {
        struct FailingAndroid;

        #[async_trait]
        impl AndroidPush for FailingAndroid {
            async fn send(
                &self,
                notification: AndroidNotification,
            ) -> Result<AndroidReport, PushError> {
                Ok(AndroidReport {
                    success: 0,
                    failure: notification.registration_ids.len() as u32,
                    results: vec![json!({"error": "NotRegistered"})],
                })
            }
        }

        let mut f = fixture();
        f.router = f.router.with_android(Arc::new(FailingAndroid));
        let envelope = Envelope::new("push")
            .with_param("push_type", "Android")
            .with_param("registration_ids", "r1")
            .with_message(payload());
        // Completes without a bus to record the failure on
        f.router.handle_bus(envelope).await;
    }
}
