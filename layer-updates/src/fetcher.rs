//! Difference fetching with per-key deduplication.
//!
//! Many triggers can ask for the same difference at once: a pushed
//! `updatesTooLong`, a gap noticed by a handler, a reconnect.  Only the first
//! one reaches the server.  Everyone else joins the outstanding fetch and
//! observes the same result (or the same error).
//!
//! A settled fetch stays registered for [`EngineConfig::cleanup_delay`];
//! the first trigger after that starts a fresh one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::client::{CallOptions, UpdatesClient};
use crate::config::EngineConfig;
use crate::errors::{DispatchError, InvocationError};
use crate::state::{ChannelState, ProtocolState};
use crate::state_store::{ChatStore, StateStore};
use crate::stats::Counters;
use crate::types::{ChannelDifference, Difference, GetChannelDifference, GetDifference};
use crate::watchdog::Watchdog;

// ─── RequestKey ──────────────────────────────────────────────────────────────

/// Identifies one deduplicated fetch.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum RequestKey {
    /// `updates.getState` bootstrap.
    State,
    /// Account-wide `updates.getDifference`.
    Difference,
    /// `updates.getChannelDifference` for one channel.
    Channel(i64),
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State       => f.write_str("state"),
            Self::Difference  => f.write_str("difference"),
            Self::Channel(id) => write!(f, "channel:{id}"),
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, DispatchError>>>;

struct InFlight<T> {
    future:     SharedFetch<T>,
    /// Callers that joined after the first one.
    reentries:  u32,
    generation: u64,
}

/// In-flight fetches of one result type, keyed by [`RequestKey`].
pub(crate) struct Registry<T> {
    entries:         Mutex<HashMap<RequestKey, InFlight<T>>>,
    next_generation: AtomicU64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()), next_generation: AtomicU64::new(0) }
    }
}

impl<T: Clone + Send + Sync + 'static> Registry<T> {
    /// Join the outstanding fetch for `key`, or start one with `start`.
    ///
    /// A started fetch is driven to completion even if every caller drops
    /// its handle, and is unregistered `cooldown` after it settles.  Once
    /// `shutdown` is cancelled nothing new starts; callers get
    /// [`DispatchError::Stopped`].
    fn join_or_start<F>(
        self: &Arc<Self>,
        key:      RequestKey,
        cooldown: Duration,
        shutdown: &CancellationToken,
        counters: &Counters,
        start:    F,
    ) -> SharedFetch<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, DispatchError>>,
    {
        if shutdown.is_cancelled() {
            return future::ready(Err(DispatchError::Stopped)).boxed().shared();
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.reentries += 1;
            Counters::bump(&counters.reentrant_triggers);
            if entry.reentries > 1 {
                tracing::debug!(
                    "[layer-updates] {key} re-triggered while in flight, depth: {}",
                    entry.reentries
                );
            }
            return entry.future.clone();
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let future = start().shared();
        entries.insert(key.clone(), InFlight { future: future.clone(), reentries: 0, generation });
        drop(entries);

        self.schedule_cleanup(key, generation, future.clone(), cooldown, shutdown.clone());
        future
    }

    fn schedule_cleanup(
        self: &Arc<Self>,
        key:        RequestKey,
        generation: u64,
        settled:    SharedFetch<T>,
        cooldown:   Duration,
        shutdown:   CancellationToken,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    let _ = settled.await;
                    tokio::time::sleep(cooldown).await;
                } => {}
                _ = shutdown.cancelled() => {}
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(&key, generation);
            }
        });
    }

    fn remove(&self, key: &RequestKey, generation: u64) {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(|e| e.generation == generation) {
            entries.remove(key);
            tracing::debug!("[layer-updates] {key} cleared");
        }
    }

    pub(crate) fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }
}

// ─── DifferenceFetcher ───────────────────────────────────────────────────────

fn fetch_err(e: InvocationError) -> DispatchError {
    DispatchError::Fetch(Arc::new(e))
}

/// Issues `getState` / `getDifference` / `getChannelDifference` and commits
/// the resulting positions.  Cheap to clone.
#[derive(Clone)]
pub(crate) struct DifferenceFetcher {
    client:      Arc<dyn UpdatesClient>,
    store:       Arc<dyn StateStore>,
    chats:       Arc<dyn ChatStore>,
    config:      EngineConfig,
    shutdown:    CancellationToken,
    counters:    Arc<Counters>,
    state:       Arc<Registry<ProtocolState>>,
    difference:  Arc<Registry<Difference>>,
    channels:    Arc<Registry<ChannelDifference>>,
}

impl DifferenceFetcher {
    pub(crate) fn new(
        client:   Arc<dyn UpdatesClient>,
        store:    Arc<dyn StateStore>,
        chats:    Arc<dyn ChatStore>,
        config:   EngineConfig,
        shutdown: CancellationToken,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            client,
            store,
            chats,
            config,
            shutdown,
            counters,
            state:      Arc::default(),
            difference: Arc::default(),
            channels:   Arc::default(),
        }
    }

    /// The baseline state: from the store if known, otherwise fetched from the
    /// server once and persisted.
    pub(crate) async fn get_state(&self) -> Result<ProtocolState, DispatchError> {
        let current = self.store.get().await.map_err(fetch_err)?;
        if current.is_known() {
            return Ok(current);
        }

        let this = self.clone();
        // The store is the source of truth once populated, so no cooldown.
        let fetch = self.state.join_or_start(
            RequestKey::State,
            Duration::ZERO,
            &self.shutdown,
            &self.counters,
            move || async move {
                Counters::bump(&this.counters.fetches_issued);
                let fetched = this.client.get_state().await.map_err(fetch_err)?;
                let current = this.store.get().await.map_err(fetch_err)?;
                let next = current.merge(&fetched);
                this.store.set(next).await.map_err(fetch_err)?;
                tracing::info!(
                    "[layer-updates] state synced via {}: pts={}, qts={}, seq={}",
                    this.store.name(), next.pts, next.qts, next.seq
                );
                Ok(next)
            }.boxed(),
        );
        fetch.await
    }

    /// Shared handle to the account-wide difference fetch.
    pub(crate) fn difference(&self) -> SharedFetch<Difference> {
        let this = self.clone();
        self.difference.join_or_start(
            RequestKey::Difference,
            self.config.cleanup_delay,
            &self.shutdown,
            &self.counters,
            move || async move {
                let from = this.get_state().await?;
                tracing::info!(
                    "[layer-updates] getDifference (pts={}, qts={}, date={}) …",
                    from.pts, from.qts, from.date
                );
                Counters::bump(&this.counters.fetches_issued);
                let diff = this.client
                    .get_difference(GetDifference::from_state(&from), CallOptions::unbounded())
                    .await
                    .map_err(fetch_err)?;
                this.commit_difference(&diff).await?;
                Ok(diff)
            }.boxed(),
        )
    }

    /// Shared handle to the difference fetch of one channel.
    pub(crate) fn channel_difference(&self, channel_id: i64) -> SharedFetch<ChannelDifference> {
        let this = self.clone();
        self.channels.join_or_start(
            RequestKey::Channel(channel_id),
            self.config.cleanup_delay,
            &self.shutdown,
            &self.counters,
            move || async move {
                let channel = this.lookup_channel(channel_id).await?;
                tracing::info!(
                    "[layer-updates] getChannelDifference (channel={channel_id}, pts={}) …",
                    channel.pts
                );
                Counters::bump(&this.counters.fetches_issued);
                let diff = this.client
                    .get_channel_difference(GetChannelDifference::from_channel(&channel), CallOptions::unbounded())
                    .await
                    .map_err(fetch_err)?;

                let mut next = channel;
                if !next.advance(diff.pts()) && diff.pts() < channel.pts {
                    tracing::debug!(
                        "[layer-updates] channel {channel_id}: keeping pts {} over older {}",
                        channel.pts, diff.pts()
                    );
                }
                this.chats.set(next).await.map_err(fetch_err)?;
                Ok(diff)
            }.boxed(),
        )
    }

    /// Resolve the channel descriptor.  The lookup may take arbitrarily long;
    /// a watchdog reports it if it exceeds the configured threshold.
    async fn lookup_channel(&self, channel_id: i64) -> Result<ChannelState, DispatchError> {
        let counters = self.counters.clone();
        let _watchdog = Watchdog::start_with(
            self.config.watchdog_threshold,
            self.shutdown.clone(),
            move || format!("channel {channel_id} descriptor lookup still pending"),
            move || Counters::bump(&counters.watchdog_warnings),
        );
        self.chats.get(channel_id).await.map_err(fetch_err)
    }

    async fn commit_difference(&self, diff: &Difference) -> Result<(), DispatchError> {
        let current = self.store.get().await.map_err(fetch_err)?;
        let next = diff.committed_state(&current);
        if next == current {
            return Ok(());
        }
        if let Difference::TooLong { pts } = diff {
            tracing::warn!("[layer-updates] getDifference: TooLong (pts={pts})");
        }
        self.store.set(next).await.map_err(fetch_err)?;
        tracing::debug!(
            "[layer-updates] {} committed: pts {} → {}",
            diff.kind(), current.pts, next.pts
        );
        Ok(())
    }

    pub(crate) fn is_in_flight(&self, key: &RequestKey) -> bool {
        match key {
            RequestKey::State       => self.state.is_in_flight(key),
            RequestKey::Difference  => self.difference.is_in_flight(key),
            RequestKey::Channel(_)  => self.channels.is_in_flight(key),
        }
    }
}
