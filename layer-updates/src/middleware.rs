//! Minimal middleware composition.
//!
//! Every inbound event (a pushed update container, or a request on its way
//! to / back from the server) travels down a [`Chain`] as a mutable
//! [`Context`].  Each [`Middleware`] may short-circuit by returning without
//! calling [`Next::run`], or call onward and inspect the context afterwards.
//!
//! ```rust
//! use async_trait::async_trait;
//! use layer_updates::{Context, DispatchError, Middleware, Next};
//!
//! struct Tag;
//!
//! #[async_trait]
//! impl Middleware for Tag {
//!     async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
//!         ctx.state.insert("seen-by".into(), "tag".into());
//!         next.run(ctx).await
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::UpdatesClient;
use crate::errors::DispatchError;
use crate::types::{Request, RootUpdate};

// ─── Context ─────────────────────────────────────────────────────────────────

/// Per-dispatch record handed down the chain.
#[derive(Clone)]
pub struct Context {
    /// Event kind: a TL constructor or method name.
    pub kind:     String,
    /// The client the event belongs to.
    pub client:   Arc<dyn UpdatesClient>,
    /// Set for request-shaped events.
    pub request:  Option<Request>,
    /// Response to [`Context::request`], filled in by whichever middleware
    /// performs the call.
    pub response: Option<RootUpdate>,
    /// Set when the transport already classified the event as pushed updates.
    pub updates:  Option<RootUpdate>,
    /// Payload of a synthetic update event emitted by the engine.
    pub update:   Option<RootUpdate>,
    /// Scratch space for middlewares further down the chain.
    pub state:    HashMap<String, String>,
    /// How many synthetic emissions led to this context.
    pub depth:    usize,
}

impl Context {
    /// A pushed update container.
    pub fn updates(client: Arc<dyn UpdatesClient>, updates: impl Into<RootUpdate>) -> Self {
        let updates = updates.into();
        Self {
            kind:     updates.kind().to_string(),
            updates:  Some(updates),
            ..Self::empty(client)
        }
    }

    /// An outgoing request.
    pub fn request(client: Arc<dyn UpdatesClient>, request: Request) -> Self {
        Self {
            kind:    request.method.clone(),
            request: Some(request),
            ..Self::empty(client)
        }
    }

    /// The synthetic update event the engine emits once a payload has been
    /// handled.
    pub(crate) fn synthetic(client: Arc<dyn UpdatesClient>, update: RootUpdate, depth: usize) -> Self {
        Self {
            kind:   update.kind().to_string(),
            update: Some(update),
            depth,
            ..Self::empty(client)
        }
    }

    fn empty(client: Arc<dyn UpdatesClient>) -> Self {
        Self {
            kind:     String::new(),
            client,
            request:  None,
            response: None,
            updates:  None,
            update:   None,
            state:    HashMap::new(),
            depth:    0,
        }
    }

    /// A pushed-updates context that continues this one's emission lineage.
    ///
    /// Use it when a downstream middleware feeds updates back into the
    /// engine, so the depth guard can stop runaway loops.
    pub fn follow_up(&self, updates: impl Into<RootUpdate>) -> Self {
        Self { depth: self.depth, ..Self::updates(self.client.clone(), updates) }
    }

    /// The payload the update engine should queue: the pushed updates if
    /// present, otherwise the response.
    pub fn root_update(&self) -> Option<&RootUpdate> {
        self.updates.as_ref().or(self.response.as_ref())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.kind)
            .field("request", &self.request)
            .field("response", &self.response.as_ref().map(RootUpdate::kind))
            .field("updates", &self.updates.as_ref().map(RootUpdate::kind))
            .field("update", &self.update.as_ref().map(RootUpdate::kind))
            .field("state", &self.state)
            .field("depth", &self.depth)
            .finish()
    }
}

// ─── Middleware / Next ───────────────────────────────────────────────────────

/// One link of a [`Chain`].
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError>;
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    /// Run the remaining middlewares.  Reaching the end is a no-op.
    pub async fn run(self, ctx: &mut Context) -> Result<(), DispatchError> {
        match self.rest.split_first() {
            Some((head, tail)) => head.call(ctx, Next { rest: tail }).await,
            None               => Ok(()),
        }
    }

    /// A `Next` that does nothing (the end of a chain).
    pub fn end() -> Next<'static> {
        Next { rest: &[] }
    }
}

// ─── Chain ───────────────────────────────────────────────────────────────────

/// An ordered list of middlewares.  Cheap to clone.
#[derive(Clone, Default)]
pub struct Chain {
    handlers: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.handlers.push(middleware);
        self
    }

    /// Builder form of [`Chain::push`].
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.handlers.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `ctx` through every middleware.
    pub async fn dispatch(&self, ctx: &mut Context) -> Result<(), DispatchError> {
        Next { rest: &self.handlers }.run(ctx).await
    }
}

/// A nested chain runs its own middlewares, then continues with the outer one.
#[async_trait]
impl Middleware for Chain {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        self.dispatch(ctx).await?;
        next.run(ctx).await
    }
}

// ─── Optional ────────────────────────────────────────────────────────────────

/// Runs `inner` only for contexts matching `predicate`; everything else is
/// passed straight to the rest of the chain.
pub struct Optional<P, M> {
    predicate: P,
    inner:     M,
}

/// Wrap `inner` so it only sees contexts for which `predicate` holds.
pub fn optional<P, M>(predicate: P, inner: M) -> Optional<P, M>
where
    P: Fn(&Context) -> bool + Send + Sync,
    M: Middleware,
{
    Optional { predicate, inner }
}

#[async_trait]
impl<P, M> Middleware for Optional<P, M>
where
    P: Fn(&Context) -> bool + Send + Sync,
    M: Middleware,
{
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        if (self.predicate)(ctx) {
            self.inner.call(ctx, next).await
        } else {
            next.run(ctx).await
        }
    }
}
