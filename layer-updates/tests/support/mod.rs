//! In-memory fakes for the engine's collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use layer_updates::types::{GetChannelDifference, GetDifference};
use layer_updates::{
    CallOptions, ChannelDifference, ChannelState, ChatStore, Context, Difference, DispatchError,
    InMemoryStateStore, InvocationError, Middleware, Next, ProtocolState, RootUpdate, RpcError,
    UpdatesClient,
};

// ── FakeServer ────────────────────────────────────────────────────────────────

pub struct FakeServer {
    pub server_state:         ProtocolState,
    pub delay:                Duration,
    pub differences:          Mutex<VecDeque<Result<Difference, InvocationError>>>,
    pub channel_differences:  Mutex<VecDeque<Result<ChannelDifference, InvocationError>>>,
    pub difference_calls:     AtomicUsize,
    pub channel_calls:        AtomicUsize,
    pub state_calls:          AtomicUsize,
    pub last_difference:      Mutex<Option<GetDifference>>,
    pub last_channel_request: Mutex<Option<GetChannelDifference>>,
    pub last_options:         Mutex<Option<CallOptions>>,
    pub reported_errors:      Mutex<Vec<String>>,
    pub fail_error_handler:   AtomicBool,
    pub polling:              AtomicBool,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            server_state:         ProtocolState { pts: 500, qts: 3, seq: 40, date: 1_700_000_000 },
            delay:                Duration::from_millis(100),
            differences:          Mutex::default(),
            channel_differences:  Mutex::default(),
            difference_calls:     AtomicUsize::new(0),
            channel_calls:        AtomicUsize::new(0),
            state_calls:          AtomicUsize::new(0),
            last_difference:      Mutex::default(),
            last_channel_request: Mutex::default(),
            last_options:         Mutex::default(),
            reported_errors:      Mutex::default(),
            fail_error_handler:   AtomicBool::new(false),
            polling:              AtomicBool::new(false),
        }
    }

    pub fn push_difference(&self, d: Result<Difference, InvocationError>) -> &Self {
        self.differences.lock().unwrap().push_back(d);
        self
    }

    pub fn push_channel_difference(&self, d: Result<ChannelDifference, InvocationError>) -> &Self {
        self.channel_differences.lock().unwrap().push_back(d);
        self
    }

    pub fn difference_calls(&self) -> usize {
        self.difference_calls.load(Ordering::SeqCst)
    }

    pub fn channel_calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
    }

    pub fn state_calls(&self) -> usize {
        self.state_calls.load(Ordering::SeqCst)
    }

    pub fn reported_errors(&self) -> Vec<String> {
        self.reported_errors.lock().unwrap().clone()
    }
}

pub fn rpc(code: i32, name: &str) -> InvocationError {
    InvocationError::Rpc(RpcError::from_telegram(code, name))
}

#[async_trait]
impl UpdatesClient for FakeServer {
    async fn get_difference(
        &self,
        params:  GetDifference,
        options: CallOptions,
    ) -> Result<Difference, InvocationError> {
        self.difference_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_difference.lock().unwrap() = Some(params);
        *self.last_options.lock().unwrap() = Some(options);
        tokio::time::sleep(self.delay).await;
        let scripted = self.differences.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(Difference::Empty { date: self.server_state.date, seq: self.server_state.seq }))
    }

    async fn get_channel_difference(
        &self,
        params:  GetChannelDifference,
        options: CallOptions,
    ) -> Result<ChannelDifference, InvocationError> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        let pts = params.pts;
        *self.last_channel_request.lock().unwrap() = Some(params);
        *self.last_options.lock().unwrap() = Some(options);
        tokio::time::sleep(self.delay).await;
        let scripted = self.channel_differences.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(ChannelDifference::Empty { is_final: true, pts, timeout: None }))
    }

    async fn get_state(&self) -> Result<ProtocolState, InvocationError> {
        self.state_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.server_state)
    }

    async fn start_polling(&self) -> Result<(), InvocationError> {
        self.polling.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), InvocationError> {
        self.polling.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_error(&self, error: &DispatchError, ctx: &Context) -> Result<(), InvocationError> {
        self.reported_errors.lock().unwrap().push(format!("{}: {error}", ctx.kind));
        if self.fail_error_handler.load(Ordering::SeqCst) {
            return Err(InvocationError::Dropped);
        }
        Ok(())
    }
}

// ── SlowChats ─────────────────────────────────────────────────────────────────

/// Channel descriptor lookup that takes `delay` (or fails when `fail` is set).
pub struct SlowChats {
    pub inner:   InMemoryStateStore,
    pub delay:   Duration,
    pub fail:    bool,
    pub lookups: AtomicUsize,
    /// Lookups that ran to the end instead of being dropped midway.
    pub finished: AtomicUsize,
}

impl SlowChats {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner:    InMemoryStateStore::new(),
            delay,
            fail:     false,
            lookups:  AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn failing(delay: Duration) -> Self {
        Self { fail: true, ..Self::new(delay) }
    }
}

#[async_trait]
impl ChatStore for SlowChats {
    async fn get(&self, channel_id: i64) -> Result<ChannelState, InvocationError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(rpc(400, "CHANNEL_PRIVATE"));
        }
        ChatStore::get(&self.inner, channel_id).await
    }

    async fn set(&self, state: ChannelState) -> Result<(), InvocationError> {
        ChatStore::set(&self.inner, state).await
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

/// Downstream middleware that records every synthetic update it sees.
#[derive(Clone, Default)]
pub struct Recorder {
    pub seen: Arc<Mutex<Vec<(String, usize)>>>,
}

impl Recorder {
    pub fn kinds(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn depths(&self) -> Vec<usize> {
        self.seen.lock().unwrap().iter().map(|(_, d)| *d).collect()
    }
}

#[async_trait]
impl Middleware for Recorder {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        assert!(ctx.update.is_some(), "synthetic events always carry an update");
        assert!(ctx.state.is_empty(), "synthetic events start with empty state");
        self.seen.lock().unwrap().push((ctx.kind.clone(), ctx.depth));
        next.run(ctx).await
    }
}

/// Middleware that answers difference requests like a transport would.
pub struct Responder(pub RootUpdate);

#[async_trait]
impl Middleware for Responder {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        ctx.response = Some(self.0.clone());
        next.run(ctx).await
    }
}
