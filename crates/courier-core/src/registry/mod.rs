//! Connection registry.
//!
//! Three local indexes (user, page, group) map a key to the sockets under
//! it. They are authoritative for routing on this process and hold only weak
//! references; the socket is owned by its session. When a [`Mirror`] is
//! configured every change is also written to the shared backend so other
//! processes can see cluster-wide counts. Local state is always updated
//! first; a mirror failure is reported but never undoes it.

pub mod mirror;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::socket::{Socket, SocketId};

pub use mirror::{Mirror, MirrorIndex};

type Bucket = HashMap<SocketId, Weak<Socket>>;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Nothing is registered under the key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The socket has no identity yet.
    #[error("Socket {0} is not authenticated")]
    Unauthenticated(SocketId),

    /// The shared mirror could not be updated.
    #[error("Mirror update failed: {0}")]
    Mirror(#[from] BackendError),
}

/// Indexes live sockets by user, page and group.
#[derive(Default)]
pub struct Registry {
    users: DashMap<String, Bucket>,
    pages: DashMap<String, Bucket>,
    groups: DashMap<String, Bucket>,
    /// Distinct identities with at least one local socket.
    live: AtomicI64,
    mirror: Option<Mirror>,
}

impl Registry {
    /// A registry with local indexes only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that also mirrors every change to the shared backend.
    #[must_use]
    pub fn with_mirror(mirror: Mirror) -> Self {
        Self {
            mirror: Some(mirror),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    fn index(&self, index: MirrorIndex) -> &DashMap<String, Bucket> {
        match index {
            MirrorIndex::Clients => &self.users,
            MirrorIndex::Pages => &self.pages,
            MirrorIndex::Groups => &self.groups,
        }
    }

    /// Insert into a bucket. Returns `(inserted, created)`: whether the
    /// socket was not already there, and whether the bucket was new.
    fn attach(&self, index: MirrorIndex, key: &str, socket: &Arc<Socket>) -> (bool, bool) {
        match self.index(index).entry(key.to_string()) {
            Entry::Occupied(mut bucket) => {
                let inserted = bucket
                    .get_mut()
                    .insert(socket.id(), Arc::downgrade(socket))
                    .is_none();
                (inserted, false)
            }
            Entry::Vacant(slot) => {
                let mut bucket = Bucket::new();
                bucket.insert(socket.id(), Arc::downgrade(socket));
                slot.insert(bucket);
                (true, true)
            }
        }
    }

    /// Remove from a bucket, dropping it once empty. Returns
    /// `(removed, emptied)`.
    fn detach(&self, index: MirrorIndex, key: &str, id: SocketId) -> (bool, bool) {
        let mut removed = false;
        let emptied = self
            .index(index)
            .remove_if_mut(key, |_, bucket| {
                removed = bucket.remove(&id).is_some();
                bucket.is_empty()
            })
            .is_some();
        (removed, emptied)
    }

    fn collect(&self, index: MirrorIndex, key: &str) -> Option<Vec<Arc<Socket>>> {
        self.index(index)
            .get(key)
            .map(|bucket| bucket.values().filter_map(Weak::upgrade).collect())
    }

    async fn mirror_incr(&self, index: MirrorIndex, field: &str) -> Result<(), RegistryError> {
        match &self.mirror {
            Some(mirror) => {
                let mirror = mirror.clone();
                let field = field.to_string();
                detached(async move { mirror.incr(index, &field).await }).await
            }
            None => Ok(()),
        }
    }

    async fn mirror_decr(&self, index: MirrorIndex, field: &str) -> Result<(), RegistryError> {
        match &self.mirror {
            Some(mirror) => {
                let mirror = mirror.clone();
                let field = field.to_string();
                detached(async move { mirror.decr(index, &field).await }).await
            }
            None => Ok(()),
        }
    }

    /// Index an authenticated socket under its identity.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unauthenticated`] if the socket has no
    /// identity, or [`RegistryError::Mirror`] if only the local index was
    /// updated.
    pub async fn save(&self, socket: &Arc<Socket>) -> Result<(), RegistryError> {
        let user = socket
            .identity()
            .ok_or(RegistryError::Unauthenticated(socket.id()))?;

        let (inserted, created) = self.attach(MirrorIndex::Clients, user, socket);
        if created {
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        if !inserted {
            return Ok(());
        }
        debug!(socket = %socket.id(), user = %user, "Saved");

        self.mirror_incr(MirrorIndex::Clients, user).await
    }

    /// Remove a socket from the user index.
    ///
    /// Returns whether the socket was registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if only the local index was updated.
    pub async fn remove(&self, socket: &Socket) -> Result<bool, RegistryError> {
        let Some(user) = socket.identity() else {
            return Ok(false);
        };

        let (removed, emptied) = self.detach(MirrorIndex::Clients, user, socket.id());
        if emptied {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        if !removed {
            return Ok(false);
        }
        debug!(socket = %socket.id(), user = %user, "Removed");

        self.mirror_decr(MirrorIndex::Clients, user).await?;
        Ok(true)
    }

    /// Every live socket of `user` on this process.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if the user has no sockets here.
    pub fn lookup_by_user(&self, user: &str) -> Result<Vec<Arc<Socket>>, RegistryError> {
        self.collect(MirrorIndex::Clients, user)
            .filter(|sockets| !sockets.is_empty())
            .ok_or_else(|| RegistryError::NotFound(user.to_string()))
    }

    /// Every live authenticated socket on this process.
    #[must_use]
    pub fn all_sockets(&self) -> Vec<Arc<Socket>> {
        self.users
            .iter()
            .flat_map(|bucket| {
                bucket
                    .values()
                    .filter_map(Weak::upgrade)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Index a socket under `page`. Indexing it twice counts once.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if only the local index was updated.
    pub async fn set_page(&self, socket: &Arc<Socket>, page: &str) -> Result<(), RegistryError> {
        let (inserted, _) = self.attach(MirrorIndex::Pages, page, socket);
        if !inserted {
            return Ok(());
        }
        self.mirror_incr(MirrorIndex::Pages, page).await
    }

    /// Remove a socket from `page`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if only the local index was updated.
    pub async fn unset_page(&self, socket: &Socket, page: &str) -> Result<(), RegistryError> {
        let (removed, _) = self.detach(MirrorIndex::Pages, page, socket.id());
        if removed {
            self.mirror_decr(MirrorIndex::Pages, page).await?;
        }
        Ok(())
    }

    /// Index a socket under each of `groups`. Repeated names and groups the
    /// socket is already in count once.
    ///
    /// Every group is indexed locally even if a mirror update fails; the
    /// first mirror error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if only the local index was updated.
    pub async fn set_groups(
        &self,
        socket: &Arc<Socket>,
        groups: &[String],
    ) -> Result<(), RegistryError> {
        let mut result = Ok(());
        for group in groups {
            let (inserted, _) = self.attach(MirrorIndex::Groups, group, socket);
            if !inserted {
                continue;
            }
            if let Err(e) = self.mirror_incr(MirrorIndex::Groups, group).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Remove a socket from each of `groups`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if only the local index was updated.
    pub async fn unset_groups(&self, socket: &Socket, groups: &[String]) -> Result<(), RegistryError> {
        let mut result = Ok(());
        for group in groups {
            let (removed, _) = self.detach(MirrorIndex::Groups, group, socket.id());
            if !removed {
                continue;
            }
            if let Err(e) = self.mirror_decr(MirrorIndex::Groups, group).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Every live socket on `page`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if nobody is on the page.
    pub fn lookup_page(&self, page: &str) -> Result<Vec<Arc<Socket>>, RegistryError> {
        self.collect(MirrorIndex::Pages, page)
            .filter(|sockets| !sockets.is_empty())
            .ok_or_else(|| RegistryError::NotFound(page.to_string()))
    }

    /// Every live socket in any of `groups`, each at most once.
    #[must_use]
    pub fn lookup_groups(&self, groups: &[String]) -> Vec<Arc<Socket>> {
        let mut seen = HashSet::new();
        groups
            .iter()
            .filter_map(|group| self.collect(MirrorIndex::Groups, group))
            .flatten()
            .filter(|socket| seen.insert(socket.id()))
            .collect()
    }

    /// Sockets on `page`, or `None` if the bucket does not exist.
    #[must_use]
    pub fn page_len(&self, page: &str) -> Option<usize> {
        self.pages.get(page).map(|bucket| bucket.len())
    }

    /// Sockets in `group`, or `None` if the bucket does not exist.
    #[must_use]
    pub fn group_len(&self, group: &str) -> Option<usize> {
        self.groups.get(group).map(|bucket| bucket.len())
    }

    /// Distinct identities connected to this process.
    #[must_use]
    pub fn local_count(&self) -> i64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Distinct identities connected anywhere.
    ///
    /// Falls back to the local count when the mirror is absent or
    /// unreachable.
    pub async fn count(&self) -> i64 {
        if let Some(mirror) = &self.mirror {
            match mirror.count().await {
                Ok(count) => return count,
                Err(e) => warn!(error = %e, "Mirror count failed, using local count"),
            }
        }
        self.local_count()
    }

    /// Identities connected anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Mirror`] if the mirror could not be read.
    pub async fn client_list(&self) -> Result<Vec<String>, RegistryError> {
        match &self.mirror {
            Some(mirror) => Ok(mirror.clients().await?),
            None => Ok(self.users.iter().map(|e| e.key().clone()).collect()),
        }
    }
}

/// Run a mirror write on its own task so it completes even if the caller
/// is cancelled after the local index changed.
async fn detached<F>(write: F) -> Result<(), RegistryError>
where
    F: Future<Output = Result<(), BackendError>> + Send + 'static,
{
    match tokio::spawn(write).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(BackendError::Unavailable(format!("mirror write aborted: {e}")).into()),
    }
}
