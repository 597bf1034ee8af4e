//! The transport-agnostic connection.
//!
//! A [`Socket`] is created per connection attempt and owned by its session.
//! The registry only keeps weak references for lookup. Routing pushes
//! messages into the socket's bounded mailbox; the session's writer drains
//! it in order.
//!
//! ```text
//! Connecting ──▶ Authenticating ──▶ Active ──▶ Closed
//!                      │                          ▲
//!                      └──────────────────────────┘
//! ```

use courier_protocol::{Command, Message};
use courier_transport::{EnvelopeReader, TransportError, TransportKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::presence::PresenceTracker;
use crate::registry::{Registry, RegistryError};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically assigned socket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    fn next() -> Self {
        Self(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

/// Socket errors.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The authenticate handshake was missing or invalid.
    #[error("Protocol error: {0}")]
    Protocol(&'static str),

    /// The transport failed during the handshake.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The socket is closed.
    #[error("Socket closed")]
    Closed,

    /// The socket has not finished authenticating.
    #[error("Socket is not active")]
    NotActive,

    /// The mailbox is full; the message was dropped.
    #[error("Mailbox full")]
    MailboxFull,

    /// The registry could not be updated.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Receiving end of a socket's outbound mailbox.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::Receiver<Arc<Message>>,
}

impl Mailbox {
    /// Next queued message, in enqueue order.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }

    /// A message that is already queued, if any.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }
}

/// One client connection.
pub struct Socket {
    id: SocketId,
    kind: TransportKind,
    identity: OnceLock<String>,
    page: RwLock<Option<String>>,
    groups: RwLock<Vec<String>>,
    /// Serializes lifecycle transitions and index updates.
    state: Mutex<SocketState>,
    closed: AtomicBool,
    mailbox: mpsc::Sender<Arc<Message>>,
    done: watch::Sender<bool>,
    registry: Arc<Registry>,
    presence: Option<Arc<PresenceTracker>>,
    clock: SharedClock,
}

impl Socket {
    /// Create a socket and its mailbox.
    #[must_use]
    pub fn new(
        kind: TransportKind,
        registry: Arc<Registry>,
        presence: Option<Arc<PresenceTracker>>,
        clock: SharedClock,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, Mailbox) {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let (done, _) = watch::channel(false);
        let socket = Arc::new(Self {
            id: SocketId::next(),
            kind,
            identity: OnceLock::new(),
            page: RwLock::new(None),
            groups: RwLock::new(Vec::new()),
            state: Mutex::new(SocketState::Connecting),
            closed: AtomicBool::new(false),
            mailbox: tx,
            done,
            registry,
            presence,
            clock,
        });
        (socket, Mailbox { rx })
    }

    #[must_use]
    pub fn id(&self) -> SocketId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The bound user id, once authenticated.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    #[must_use]
    pub fn page(&self) -> Option<String> {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn state(&self) -> SocketState {
        *self.state.lock().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the first envelope from a streaming transport and bind the
    /// identity it carries.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Protocol`] if the first envelope is not an
    /// `authenticate` command with a user, or the peer hung up first.
    pub async fn authenticate_stream(
        self: &Arc<Self>,
        reader: &mut (dyn EnvelopeReader + '_),
    ) -> Result<(), SocketError> {
        self.begin_authentication().await?;

        let envelope = reader
            .recv()
            .await?
            .ok_or(SocketError::Protocol("connection closed before authenticate"))?;

        match Command::parse(&envelope) {
            Command::Authenticate { user } => self.bind(user).await,
            Command::Malformed { command, .. } if command == "authenticate" => {
                Err(SocketError::Protocol("authenticate without a user"))
            }
            _ => Err(SocketError::Protocol("authenticate expected")),
        }
    }

    /// Bind an identity supplied by the caller (request/response transports).
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Protocol`] if `user` is empty.
    pub async fn authenticate_direct(self: &Arc<Self>, user: &str) -> Result<(), SocketError> {
        self.begin_authentication().await?;
        if user.is_empty() {
            return Err(SocketError::Protocol("user not provided"));
        }
        self.bind(user.to_string()).await
    }

    async fn begin_authentication(&self) -> Result<(), SocketError> {
        let mut state = self.state.lock().await;
        match *state {
            SocketState::Connecting => {
                *state = SocketState::Authenticating;
                Ok(())
            }
            SocketState::Closed => Err(SocketError::Closed),
            _ => Err(SocketError::Protocol("already authenticated")),
        }
    }

    async fn bind(self: &Arc<Self>, user: String) -> Result<(), SocketError> {
        let mut state = self.state.lock().await;
        if *state != SocketState::Authenticating {
            return Err(SocketError::Closed);
        }
        if self.identity.set(user).is_err() {
            return Err(SocketError::Protocol("already authenticated"));
        }

        if let Err(e) = self.registry.save(self).await {
            // Routing reads the local index, which is already updated
            warn!(socket = %self.id, error = %e, "Registry mirror not updated on save");
        }
        *state = SocketState::Active;

        debug!(socket = %self.id, user = ?self.identity(), transport = %self.kind, "Authenticated");
        Ok(())
    }

    /// Move to `page`, leaving the previous page if any.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotActive`] unless the socket is active.
    pub async fn set_page(self: &Arc<Self>, page: String) -> Result<(), SocketError> {
        let state = self.state.lock().await;
        if *state != SocketState::Active {
            return Err(SocketError::NotActive);
        }

        let previous = self
            .page
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(page.clone());

        let mut result = Ok(());
        if let Some(previous) = previous {
            result = self.registry.unset_page(self, &previous).await;
        }
        let set = self.registry.set_page(self, &page).await;
        drop(state);

        debug!(socket = %self.id, page = %page, "Page set");
        result.and(set).map_err(SocketError::from)
    }

    /// Replace group memberships. Repeated names are kept once.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::NotActive`] unless the socket is active.
    pub async fn set_groups(self: &Arc<Self>, mut groups: Vec<String>) -> Result<(), SocketError> {
        let mut seen = HashSet::new();
        groups.retain(|group| seen.insert(group.clone()));

        let state = self.state.lock().await;
        if *state != SocketState::Active {
            return Err(SocketError::NotActive);
        }

        let previous = std::mem::replace(
            &mut *self.groups.write().unwrap_or_else(PoisonError::into_inner),
            groups.clone(),
        );

        let mut result = Ok(());
        if !previous.is_empty() {
            result = self.registry.unset_groups(self, &previous).await;
        }
        let set = self.registry.set_groups(self, &groups).await;
        drop(state);

        debug!(socket = %self.id, groups = ?groups, "Groups set");
        result.and(set).map_err(SocketError::from)
    }

    /// Queue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::Closed`] if the socket is closed and
    /// [`SocketError::MailboxFull`] if the writer is too far behind.
    pub fn deliver(&self, message: Arc<Message>) -> Result<(), SocketError> {
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        self.mailbox.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SocketError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => SocketError::Closed,
        })
    }

    /// Mark this socket's user active or inactive.
    ///
    /// Does nothing before authentication or without a presence tracker.
    pub async fn set_presence(&self, active: bool) {
        let (Some(user), Some(presence)) = (self.identity(), &self.presence) else {
            return;
        };
        let id = self.id.to_string();
        let result = if active {
            presence.mark_active(user, &id, self.clock.now()).await
        } else {
            presence.mark_inactive(user, &id).await
        };
        if let Err(e) = result {
            warn!(socket = %self.id, user = %user, active, error = %e, "Presence update failed");
        }
    }

    /// Close the socket. Safe to call any number of times from any task;
    /// only the first call deregisters and fires the done signal.
    ///
    /// Returns whether this call performed the close.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        if *state == SocketState::Closed {
            return false;
        }
        let was_active = *state == SocketState::Active;
        *state = SocketState::Closed;
        self.closed.store(true, Ordering::Release);

        // A handshake cancelled mid-save may have indexed the identity
        // without reaching Active; removal is a no-op if it did not.
        if self.identity().is_some() {
            // Reverse of registration: groups, page, identity
            let groups =
                std::mem::take(&mut *self.groups.write().unwrap_or_else(PoisonError::into_inner));
            if !groups.is_empty() {
                if let Err(e) = self.registry.unset_groups(self, &groups).await {
                    warn!(socket = %self.id, error = %e, "Registry mirror not updated on close");
                }
            }

            let page = self.page.write().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(page) = page {
                if let Err(e) = self.registry.unset_page(self, &page).await {
                    warn!(socket = %self.id, error = %e, "Registry mirror not updated on close");
                }
            }

            if let Err(e) = self.registry.remove(self).await {
                warn!(socket = %self.id, error = %e, "Registry mirror not updated on close");
            }
        }

        self.done.send_replace(true);
        drop(state);

        if was_active {
            self.set_presence(false).await;
        }

        debug!(socket = %self.id, "Closed");
        true
    }

    /// Resolves once the socket is closed.
    pub async fn closed(&self) {
        let mut done = self.done.subscribe();
        // The sender lives as long as `self`
        let _ = done.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("identity", &self.identity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, Connection, Connector, MemoryBackend};
    use crate::clock::SystemClock;
    use crate::config::MirrorConfig;
    use crate::pool::Pool;
    use crate::registry::Mirror;
    use async_trait::async_trait;
    use courier_protocol::Envelope;
    use futures_util::stream::BoxStream;
    use std::time::Duration;
    use courier_transport::memory;
    use serde_json::Map;

    fn socket(registry: &Arc<Registry>) -> (Arc<Socket>, Mailbox) {
        Socket::new(
            TransportKind::Stream,
            Arc::clone(registry),
            None,
            Arc::new(SystemClock),
            4,
        )
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_stream_authentication() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        let (client, mut reader, _writer) = memory::pair(4);

        client
            .send(Envelope::new("Authenticate").with_param("user", "u1"))
            .await
            .unwrap();
        sock.authenticate_stream(&mut reader).await.unwrap();

        assert_eq!(sock.identity(), Some("u1"));
        assert_eq!(sock.state().await, SocketState::Active);
        assert_eq!(registry.lookup_by_user("u1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_authentication_rejects_other_commands() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        let (client, mut reader, _writer) = memory::pair(4);

        client
            .send(Envelope::new("setpage").with_param("page", "/"))
            .await
            .unwrap();
        let err = sock.authenticate_stream(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocketError::Protocol(_)));
        assert!(sock.close().await);
        assert_eq!(registry.local_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_authentication_requires_user() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        let (client, mut reader, _writer) = memory::pair(4);

        client.send(Envelope::new("authenticate")).await.unwrap();
        let err = sock.authenticate_stream(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocketError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_direct_authentication_requires_user() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        assert!(matches!(
            sock.authenticate_direct("").await,
            Err(SocketError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_preserves_order_and_reports_full() {
        let registry = Arc::new(Registry::new());
        let (sock, mut mailbox) = socket(&registry);

        for i in 0..4 {
            sock.deliver(Arc::new(Message::new(i.to_string(), Map::new(), 0)))
                .unwrap();
        }
        let overflow = sock.deliver(Arc::new(Message::new("x", Map::new(), 0)));
        assert!(matches!(overflow, Err(SocketError::MailboxFull)));

        for i in 0..4 {
            assert_eq!(mailbox.recv().await.unwrap().event, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_close_deregisters_everything_once() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        sock.authenticate_direct("u1").await.unwrap();
        sock.set_page("/a".into()).await.unwrap();
        sock.set_groups(vec!["g1".into(), "g2".into()]).await.unwrap();

        assert!(sock.close().await);
        assert!(!sock.close().await);

        assert!(sock.is_closed());
        assert_eq!(registry.local_count(), 0);
        assert!(registry.page_len("/a").is_none());
        assert!(registry.group_len("g1").is_none());
        assert!(sock.deliver(Arc::new(Message::new("x", Map::new(), 0))).is_err());

        // Resolves immediately once closed
        sock.closed().await;
    }

    struct StalledConnector;

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self) -> BackendResult<Connection> {
            std::future::pending().await
        }

        async fn subscribe(&self, _channel: &str) -> BackendResult<BoxStream<'static, Vec<u8>>> {
            std::future::pending().await
        }
    }

    fn mirrored(connector: Arc<dyn Connector>, timeout: Duration) -> Arc<Registry> {
        let mirror = Mirror::new(Pool::new(connector, 2), MirrorConfig::default(), timeout);
        Arc::new(Registry::with_mirror(mirror))
    }

    #[tokio::test]
    async fn test_cancelled_handshake_is_deregistered() {
        let registry = mirrored(Arc::new(StalledConnector), Duration::from_millis(200));
        let (sock, _mailbox) = socket(&registry);

        let handshake =
            tokio::time::timeout(Duration::from_millis(50), sock.authenticate_direct("u1")).await;
        assert!(handshake.is_err());
        assert_eq!(sock.state().await, SocketState::Authenticating);
        assert_eq!(registry.local_count(), 1);

        assert!(sock.close().await);
        assert_eq!(registry.local_count(), 0);
        assert!(registry.lookup_by_user("u1").is_err());
    }

    #[tokio::test]
    async fn test_repeated_groups_leave_no_mirror_count() {
        let backend = MemoryBackend::new(Arc::new(SystemClock));
        let registry = mirrored(Arc::new(backend.clone()), Duration::from_secs(1));
        let (sock, _mailbox) = socket(&registry);
        sock.authenticate_direct("u1").await.unwrap();

        sock.set_groups(vec!["g".into(), "g".into()]).await.unwrap();
        assert_eq!(sock.groups(), vec!["g".to_string()]);
        assert_eq!(backend.hash("GroupClients").get("g"), Some(&1));

        assert!(sock.close().await);
        assert!(backend.hash("GroupClients").is_empty());
        assert!(backend.hash("SocketClients").is_empty());
        assert_eq!(registry.group_len("g"), None);
    }

    #[tokio::test]
    async fn test_set_page_moves_between_buckets() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        sock.authenticate_direct("u1").await.unwrap();

        sock.set_page("/a".into()).await.unwrap();
        sock.set_page("/b".into()).await.unwrap();

        assert!(registry.page_len("/a").is_none());
        assert_eq!(registry.page_len("/b"), Some(1));
        assert_eq!(sock.page().as_deref(), Some("/b"));
    }

    #[tokio::test]
    async fn test_set_page_requires_active() {
        let registry = Arc::new(Registry::new());
        let (sock, _mailbox) = socket(&registry);
        assert!(matches!(
            sock.set_page("/a".into()).await,
            Err(SocketError::NotActive)
        ));
    }
}
