//! In-process backend.
//!
//! Implements the same command surface as Redis on top of plain maps, with
//! expiry driven by the injected [`Clock`](crate::clock::Clock). Used for
//! presence when no shared backend is configured, and by tests, which can
//! also take it offline to simulate an outage.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use super::{BackendConnection, BackendError, BackendResult, Connection, Connector};
use crate::clock::SharedClock;

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, i64>>,
    sorted: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    strings: HashMap<String, String>,
    /// Absolute expiry (unix seconds) per key.
    expiry: HashMap<String, i64>,
}

impl State {
    /// Drop every key whose expiry has passed.
    fn purge_expired(&mut self, now: i64) {
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let hash = self.hashes.remove(key).is_some();
        let sorted = self.sorted.remove(key).is_some();
        let list = self.lists.remove(key).is_some();
        let string = self.strings.remove(key).is_some();
        hash || sorted || list || string
    }

    fn exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
            || self.sorted.contains_key(key)
            || self.lists.contains_key(key)
            || self.strings.contains_key(key)
    }
}

struct Inner {
    state: Mutex<State>,
    bus: broadcast::Sender<(String, Vec<u8>)>,
    available: AtomicBool,
    connects: AtomicUsize,
    clock: SharedClock,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory backend offline".into()))
        }
    }

    /// Lock the state after dropping every expired key, so keys nobody
    /// touches again still go away.
    fn fresh(&self) -> BackendResult<MutexGuard<'_, State>> {
        self.check()?;
        let now = self.clock.now();
        let mut state = self.lock();
        state.purge_expired(now);
        Ok(state)
    }
}

/// A shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// Create an empty backend reading time from `clock`.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                bus,
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                clock,
            }),
        }
    }

    /// Take the backend online or offline.
    ///
    /// While offline every command and every dial fails with
    /// [`BackendError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of connections dialed so far.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Snapshot of a hash.
    #[must_use]
    pub fn hash(&self, key: &str) -> HashMap<String, i64> {
        self.inner.lock().hashes.get(key).cloned().unwrap_or_default()
    }

    /// Snapshot of a list.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> BackendResult<Connection> {
        self.inner.check()?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn subscribe(&self, channel: &str) -> BackendResult<BoxStream<'static, Vec<u8>>> {
        self.inner.check()?;
        let rx = self.inner.bus.subscribe();
        let channel = channel.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((ch, payload)) if ch == channel => return Some((payload, rx)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// A connection to a [`MemoryBackend`].
pub struct MemoryConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl BackendConnection for MemoryConnection {
    async fn ping(&mut self) -> BackendResult<()> {
        self.inner.check()
    }

    async fn hash_incr(&mut self, key: &str, field: &str, delta: i64) -> BackendResult<i64> {
        let mut state = self.inner.fresh()?;
        let value = state
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn hash_del(&mut self, key: &str, field: &str) -> BackendResult<()> {
        let mut state = self.inner.fresh()?;
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                state.remove(key);
            }
        }
        Ok(())
    }

    async fn hash_len(&mut self, key: &str) -> BackendResult<i64> {
        let state = self.inner.fresh()?;
        Ok(state.hashes.get(key).map_or(0, |h| h.len() as i64))
    }

    async fn hash_keys(&mut self, key: &str) -> BackendResult<Vec<String>> {
        let state = self.inner.fresh()?;
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn presence_add(
        &mut self,
        key: &str,
        member: &str,
        score: i64,
        expire_at: i64,
    ) -> BackendResult<()> {
        let mut state = self.inner.fresh()?;
        state
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        state.expiry.insert(key.to_string(), expire_at);
        Ok(())
    }

    async fn sorted_remove(&mut self, key: &str, member: &str) -> BackendResult<()> {
        let mut state = self.inner.fresh()?;
        if let Some(set) = state.sorted.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                state.remove(key);
            }
        }
        Ok(())
    }

    async fn sorted_range_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
    ) -> BackendResult<Vec<String>> {
        let state = self.inner.fresh()?;
        let mut members: Vec<(i64, String)> = state
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| (min..=max).contains(*score))
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn publish(&mut self, channel: &str, payload: &[u8]) -> BackendResult<()> {
        self.inner.check()?;
        // No subscribers is not an error
        let _ = self.inner.bus.send((channel.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn list_push(&mut self, key: &str, payload: &[u8]) -> BackendResult<()> {
        let mut state = self.inner.fresh()?;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn list_pop(&mut self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let mut state = self.inner.fresh()?;
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(None);
        };
        let payload = list.pop_front();
        if list.is_empty() {
            state.remove(key);
        }
        Ok(payload)
    }

    async fn ttl(&mut self, key: &str) -> BackendResult<i64> {
        let now = self.inner.clock.now();
        let state = self.inner.fresh()?;
        if !state.exists(key) {
            return Ok(-2);
        }
        Ok(state.expiry.get(key).map_or(-1, |at| at - now))
    }

    async fn set_with_expiry(
        &mut self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> BackendResult<()> {
        let now = self.inner.clock.now();
        let mut state = self.inner.fresh()?;
        state.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        state.expiry.insert(key.to_string(), now + seconds as i64);
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> BackendResult<()> {
        let mut state = self.inner.fresh()?;
        state.remove(key);
        Ok(())
    }
}
