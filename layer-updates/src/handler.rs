//! The update-handler seam.
//!
//! The engine does not interpret payloads.  For every queued batch it asks
//! an [`UpdateHandlerFactory`] for a fresh [`UpdateHandler`], hands it the
//! payload, and gives it a [`Completion`] through which handled updates are
//! re-emitted to the downstream chain.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::UpdatesClient;
use crate::engine::{UpdateEngine, WeakEngine};
use crate::errors::DispatchError;
use crate::middleware::Context;
use crate::types::RootUpdate;

// ─── UpdateHandler ───────────────────────────────────────────────────────────

/// Applies one payload.
#[async_trait]
pub trait UpdateHandler: Send {
    /// Apply `payload`.
    ///
    /// Return `Ok(true)` if the handler took care of emitting whatever the
    /// downstream chain should see (through its [`Completion`]); `Ok(false)`
    /// makes the engine emit `payload` unchanged.
    ///
    /// RPC failures convert into [`DispatchError::Handler`] with `?`.
    async fn handle(&mut self, payload: &RootUpdate) -> Result<bool, DispatchError>;
}

/// Builds one [`UpdateHandler`] per dispatched payload.
pub trait UpdateHandlerFactory: Send + Sync {
    fn create(&self, engine: &UpdateEngine, ctx: &Context, complete: Completion) -> Box<dyn UpdateHandler>;
}

impl<F> UpdateHandlerFactory for F
where
    F: Fn(&UpdateEngine, &Context, Completion) -> Box<dyn UpdateHandler> + Send + Sync,
{
    fn create(&self, engine: &UpdateEngine, ctx: &Context, complete: Completion) -> Box<dyn UpdateHandler> {
        self(engine, ctx, complete)
    }
}

// ─── PassThrough ─────────────────────────────────────────────────────────────

/// A factory whose handlers decline every payload, so each one reaches the
/// downstream chain as-is.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

struct Decline;

#[async_trait]
impl UpdateHandler for Decline {
    async fn handle(&mut self, _payload: &RootUpdate) -> Result<bool, DispatchError> {
        Ok(false)
    }
}

impl UpdateHandlerFactory for PassThrough {
    fn create(&self, _: &UpdateEngine, _: &Context, _: Completion) -> Box<dyn UpdateHandler> {
        Box::new(Decline)
    }
}

// ─── Completion ──────────────────────────────────────────────────────────────

/// Re-emits a handled update to the engine's downstream chain as a synthetic
/// update event.  Cheap to clone.
#[derive(Clone)]
pub struct Completion {
    engine: WeakEngine,
    client: Arc<dyn UpdatesClient>,
    depth:  usize,
}

impl Completion {
    pub(crate) fn new(engine: WeakEngine, client: Arc<dyn UpdatesClient>, depth: usize) -> Self {
        Self { engine, client, depth }
    }

    /// Emission depth the synthetic events will carry.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Emit `update` downstream and wait for the chain to finish with it.
    pub async fn complete(&self, update: RootUpdate) -> Result<(), DispatchError> {
        let engine = self.engine.upgrade().ok_or(DispatchError::Stopped)?;
        engine.emit(self.client.clone(), update, self.depth).await
    }
}
