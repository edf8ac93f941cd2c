//! The update dispatch engine.
//!
//! [`UpdateEngine`] owns the difference fetcher, the processing queue and the
//! downstream middleware chain.  Install [`UpdateEngine::middleware`] into
//! the transport's event chain; register consumers of handled updates with
//! [`UpdateEngine::use_handler`].
//!
//! ```text
//! transport ─▶ dispatch middleware ─▶ UpdateQueue ─▶ UpdateHandler
//!                                                        │ Completion
//!                        downstream chain ◀──────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::client::UpdatesClient;
use crate::config::EngineConfig;
use crate::errors::DispatchError;
use crate::fetcher::{DifferenceFetcher, RequestKey};
use crate::handler::{Completion, PassThrough, UpdateHandlerFactory};
use crate::middleware::{Chain, Context, Middleware, Next, optional};
use crate::queue::{PendingTask, UpdateQueue};
use crate::state::ProtocolState;
use crate::state_store::{ChatStore, InMemoryStateStore, StateStore};
use crate::stats::{Counters, EngineStats};
use crate::types::{ChannelDifference, Difference, RootUpdate};
use crate::watchdog::Watchdog;

/// How many times a synthetic update may lead to another one before the
/// engine refuses to emit.
pub const MAX_EMIT_DEPTH: usize = 8;

// ─── EngineInner ─────────────────────────────────────────────────────────────

struct EngineInner {
    config:          EngineConfig,
    client:          Arc<dyn UpdatesClient>,
    fetcher:         DifferenceFetcher,
    queue:           UpdateQueue,
    factory:         Arc<dyn UpdateHandlerFactory>,
    downstream:      RwLock<Chain>,
    counters:        Arc<Counters>,
    shutdown:        CancellationToken,
    next_handler_id: AtomicU64,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ─── EngineBuilder ───────────────────────────────────────────────────────────

/// Builder for [`UpdateEngine`].
///
/// Both stores default to one shared [`InMemoryStateStore`]; the handler
/// factory defaults to [`PassThrough`].
pub struct EngineBuilder {
    client:  Arc<dyn UpdatesClient>,
    config:  EngineConfig,
    store:   Option<Arc<dyn StateStore>>,
    chats:   Option<Arc<dyn ChatStore>>,
    factory: Arc<dyn UpdateHandlerFactory>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config; self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store); self
    }

    pub fn chat_store(mut self, chats: Arc<dyn ChatStore>) -> Self {
        self.chats = Some(chats); self
    }

    pub fn handler_factory(mut self, factory: impl UpdateHandlerFactory + 'static) -> Self {
        self.factory = Arc::new(factory); self
    }

    pub fn build(self) -> UpdateEngine {
        let (store, chats): (Arc<dyn StateStore>, Arc<dyn ChatStore>) = match (self.store, self.chats) {
            (Some(s), Some(c)) => (s, c),
            (store, chats) => {
                let mem = Arc::new(InMemoryStateStore::new());
                let fallback: Arc<dyn StateStore> = mem.clone();
                (store.unwrap_or(fallback), chats.unwrap_or(mem))
            }
        };

        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();
        let fetcher  = DifferenceFetcher::new(
            self.client.clone(),
            store,
            chats,
            self.config.clone(),
            shutdown.clone(),
            counters.clone(),
        );

        UpdateEngine {
            inner: Arc::new(EngineInner {
                config:          self.config,
                client:          self.client,
                fetcher,
                queue:           UpdateQueue::with_counters(counters.clone()),
                factory:         self.factory,
                downstream:      RwLock::new(Chain::new()),
                counters,
                shutdown,
                next_handler_id: AtomicU64::new(0),
            }),
        }
    }
}

// ─── UpdateEngine ────────────────────────────────────────────────────────────

/// The update dispatch engine.  Cheap to clone (internally Arc-wrapped).
#[derive(Clone)]
pub struct UpdateEngine {
    inner: Arc<EngineInner>,
}

/// Non-owning handle to an [`UpdateEngine`].
#[derive(Clone)]
pub struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    pub fn upgrade(&self) -> Option<UpdateEngine> {
        self.0.upgrade().map(|inner| UpdateEngine { inner })
    }
}

impl UpdateEngine {
    pub fn builder(client: Arc<dyn UpdatesClient>) -> EngineBuilder {
        EngineBuilder {
            client,
            config:  EngineConfig::default(),
            store:   None,
            chats:   None,
            factory: Arc::new(PassThrough),
        }
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &Arc<dyn UpdatesClient> {
        &self.inner.client
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    /// Update batches queued or executing.
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// `true` while a fetch for `key` is outstanding or cooling down.
    pub fn is_in_flight(&self, key: &RequestKey) -> bool {
        self.inner.fetcher.is_in_flight(key)
    }

    // ── Fetching ───────────────────────────────────────────────────────────

    /// The baseline update state.  Served from the store once known;
    /// otherwise fetched from the server once and persisted.
    pub async fn get_state(&self) -> Result<ProtocolState, DispatchError> {
        self.inner.fetcher.get_state().await
    }

    /// Fetch the account-wide difference since the stored state.
    ///
    /// Concurrent callers share one request and one result.
    pub async fn get_difference(&self) -> Result<Difference, DispatchError> {
        self.inner.fetcher.difference().await
    }

    /// Fetch the difference of one channel since its stored position.
    ///
    /// Concurrent callers for the same channel share one request.
    pub async fn get_channel_difference(&self, channel_id: i64) -> Result<ChannelDifference, DispatchError> {
        self.inner.fetcher.channel_difference(channel_id).await
    }

    // ── Chains ─────────────────────────────────────────────────────────────

    /// Register a consumer of handled updates.  Middlewares run in
    /// registration order for every synthetic update event.
    pub fn use_handler(&self, middleware: impl Middleware + 'static) -> &Self {
        self.inner.downstream.write().unwrap().push(Arc::new(middleware));
        self
    }

    /// Whether the dispatch middleware owns `ctx`: pre-classified updates,
    /// or a request to one of the difference methods.
    pub fn middleware_filter(ctx: &Context) -> bool {
        ctx.updates.is_some() || ctx.request.as_ref().is_some_and(|r| r.is_difference())
    }

    /// The dispatch middleware, to be installed in the transport's chain.
    ///
    /// Every call returns a middleware with its own handler id for logs.
    /// The middleware does not keep the engine alive; once the engine is
    /// gone it fails matching events with [`DispatchError::Stopped`].
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        let handler_id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(optional(
            Self::middleware_filter,
            DispatchMiddleware { engine: self.downgrade(), handler_id },
        ))
    }

    /// Run `ctx` through the dispatch middleware alone, as if it were the
    /// last link of the transport's chain.
    pub async fn dispatch(&self, ctx: &mut Context) -> Result<(), DispatchError> {
        self.middleware().call(ctx, Next::end()).await
    }

    /// Emit a synthetic update event down the downstream chain.
    pub(crate) async fn emit(
        &self,
        client: Arc<dyn UpdatesClient>,
        update: RootUpdate,
        depth:  usize,
    ) -> Result<(), DispatchError> {
        if depth > MAX_EMIT_DEPTH {
            tracing::warn!(
                "[layer-updates] refusing to emit {:?}: depth {depth} over {MAX_EMIT_DEPTH}",
                update.kind()
            );
            return Err(DispatchError::EmitDepthExceeded { depth });
        }
        let chain = self.inner.downstream.read().unwrap().clone();
        let mut ctx = Context::synthetic(client, update, depth);
        chain.dispatch(&mut ctx).await
    }

    // ── Queue ──────────────────────────────────────────────────────────────

    /// The unit of work for one payload: baseline state, watchdog-guarded
    /// handler, fallback emission, error routing.
    fn handle_task(&self, handler_id: u64, ctx: Context, root: RootUpdate) -> PendingTask {
        let engine = self.clone();
        async move {
            let ctx = Arc::new(ctx);
            if let Err(error) = engine.run_handler(handler_id, &ctx, root).await {
                engine.route_error(&error, &ctx).await;
            }
        }.boxed()
    }

    async fn run_handler(&self, handler_id: u64, ctx: &Arc<Context>, root: RootUpdate) -> Result<(), DispatchError> {
        self.get_state().await?;

        let complete = Completion::new(self.downgrade(), ctx.client.clone(), ctx.depth + 1);
        let time     = Instant::now();
        let handled  = {
            let described = ctx.clone();
            let counters  = self.inner.counters.clone();
            let _watchdog = Watchdog::start_with(
                self.inner.config.watchdog_threshold,
                self.inner.shutdown.clone(),
                move || format!("[{handler_id}] handle too long {described:?}"),
                move || Counters::bump(&counters.watchdog_warnings),
            );
            let mut handler = self.inner.factory.create(self, ctx, complete.clone());
            handler.handle(&root).await?
        };
        tracing::trace!(
            "[layer-updates] [{handler_id}] handled {:?} in {:.3}s",
            ctx.kind, time.elapsed().as_secs_f64()
        );

        if !handled {
            complete.complete(root).await?;
        }
        Ok(())
    }

    async fn route_error(&self, error: &DispatchError, ctx: &Context) {
        Counters::bump(&self.inner.counters.handler_failures);
        if let Err(e) = ctx.client.handle_error(error, ctx).await {
            tracing::warn!("[layer-updates] error handler failed on {error}: {e}");
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Start the transport's polling loop, then reconcile whatever was
    /// missed before it started.
    pub async fn start_polling(&self) -> Result<Difference, DispatchError> {
        self.inner.client
            .start_polling()
            .await
            .map_err(|e| DispatchError::Transport(Arc::new(e)))?;
        tracing::info!("[layer-updates] polling started");
        self.get_difference().await
    }

    /// Stop the transport.  Queued tasks keep running to completion.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        self.inner.client
            .stop()
            .await
            .map_err(|e| DispatchError::Transport(Arc::new(e)))?;
        tracing::info!("[layer-updates] polling stopped");
        Ok(())
    }

    /// Cancel every cooldown and watchdog timer owned by this engine.
    ///
    /// Also happens automatically when the last handle is dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

// ─── DispatchMiddleware ──────────────────────────────────────────────────────

struct DispatchMiddleware {
    engine:     WeakEngine,
    handler_id: u64,
}

#[async_trait]
impl Middleware for DispatchMiddleware {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        let engine = self.engine.upgrade().ok_or(DispatchError::Stopped)?;

        if let Some(request) = &ctx.request {
            let method = request.method.clone();
            next.run(ctx).await?;
            if ctx.response.is_none() {
                return Err(DispatchError::ContractViolation { method });
            }
        }

        let Some(root) = ctx.root_update().cloned() else {
            return Ok(());
        };

        let task = engine.handle_task(self.handler_id, ctx.clone(), root);
        if let Some(run) = engine.inner.queue.enqueue(task) {
            run.await;
        }
        Ok(())
    }
}
