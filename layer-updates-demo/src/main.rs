//! layer-updates-demo: the update engine driven by a simulated server.
//!
//! The server pushes a few update batches, silently skips some positions to
//! force a gap, and answers `getDifference` / `getChannelDifference` through
//! the same middleware chain a real transport would use.
//!
//! `cargo run -p layer-updates-demo`

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use layer_updates::types::{
    GetChannelDifference, GetDifference, METHOD_GET_CHANNEL_DIFFERENCE, METHOD_GET_DIFFERENCE,
    RawUpdate,
};
use layer_updates::{
    CallOptions, Chain, ChannelDifference, ChannelState, ChatStore, Completion, Context,
    Difference, DispatchError, EngineConfig, InMemoryStateStore, InvocationError, Middleware,
    Next, PositionCheck, ProtocolState, Request, RootUpdate, StateStore, UpdateEngine,
    UpdateHandler, UpdateHandlerFactory, Updates, UpdatesClient,
};

const ID_UPDATE_NEW_MESSAGE:         u32 = 0x1f2b0afd;
const ID_UPDATE_NEW_CHANNEL_MESSAGE: u32 = 0x62ba04d9;
const DEMO_CHANNEL: i64 = 1_001_234;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("layer_updates=debug,layer_updates_demo=info"),
    ).init();
    if let Err(e) = run().await {
        eprintln!("✗ {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let server = SimServer::new(ProtocolState { pts: 100, qts: 0, seq: 1, date: now() });
    server.set_channel_pts(DEMO_CHANNEL, 10);

    let store = Arc::new(InMemoryStateStore::new());
    store.insert_channel(ChannelState::new(DEMO_CHANNEL, 0x5eed, 10));

    let engine = UpdateEngine::builder(server.clone())
        .config(EngineConfig::from_env())
        .state_store(store.clone())
        .chat_store(store.clone())
        .handler_factory(GapAwareFactory { store: store.clone() })
        .build();
    engine.use_handler(Printer);

    // The transport's chain: difference requests pass through the engine's
    // middleware before the server answers them.
    let mut transport = Chain::new();
    transport.push(engine.middleware());
    server.install(transport);

    println!("🔌 Starting polling…");
    engine.start_polling().await?;

    // A settled difference is reused until its cooldown is over.
    println!("⏳ Waiting out the fetch cooldown…");
    tokio::time::sleep(engine.config().cleanup_delay + Duration::from_millis(50)).await;

    println!("\n📬 In-order pushes");
    push(&engine, &server, server.advance(1)).await?;
    push(&engine, &server, server.advance(2)).await?;

    println!("\n🕳  Server skips two positions, then pushes");
    let _missed = server.advance(2);
    push(&engine, &server, server.advance(1)).await?;

    println!("\n📡 Channel update with a gap");
    let channel_update = RawUpdate::new(ID_UPDATE_NEW_CHANNEL_MESSAGE)
        .with_pts(13, 1)
        .in_channel(DEMO_CHANNEL);
    server.set_channel_pts(DEMO_CHANNEL, 13);
    push(&engine, &server, vec![channel_update]).await?;

    engine.stop().await?;

    let stats = engine.stats();
    let local = store.snapshot();
    println!("\n📊 pts={} channel pts={}", local.pts, store.channel(DEMO_CHANNEL).map_or(0, |c| c.pts));
    println!(
        "   fetches={} reentrant={} tasks={} failures={} watchdog={}",
        stats.fetches_issued, stats.reentrant_triggers, stats.tasks_completed,
        stats.handler_failures, stats.watchdog_warnings,
    );
    Ok(())
}

fn now() -> i64 {
    Local::now().timestamp()
}

async fn push(engine: &UpdateEngine, server: &Arc<SimServer>, updates: Vec<RawUpdate>) -> Result<(), DispatchError> {
    let state = server.state();
    let mut ctx = Context::updates(server.clone(), Updates::Updates { updates, date: state.date, seq: state.seq });
    engine.dispatch(&mut ctx).await
}

// ─── Simulated server ─────────────────────────────────────────────────────────

struct SimServer {
    me:        Weak<SimServer>,
    transport: OnceLock<Chain>,
    state:     Mutex<ProtocolState>,
    channels:  Mutex<HashMap<i64, i64>>,
}

impl SimServer {
    fn new(state: ProtocolState) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me:        me.clone(),
            transport: OnceLock::new(),
            state:     Mutex::new(state),
            channels:  Mutex::new(HashMap::new()),
        })
    }

    fn install(&self, transport: Chain) {
        let _ = self.transport.set(transport);
    }

    fn state(&self) -> ProtocolState {
        *self.state.lock().unwrap()
    }

    fn set_channel_pts(&self, channel_id: i64, pts: i64) {
        self.channels.lock().unwrap().insert(channel_id, pts);
    }

    /// Produce `n` new account-wide updates.
    fn advance(&self, n: i64) -> Vec<RawUpdate> {
        let mut state = self.state.lock().unwrap();
        let first = state.pts + 1;
        state.pts += n;
        state.seq += 1;
        state.date = now();
        (first..=state.pts).map(|pts| RawUpdate::new(ID_UPDATE_NEW_MESSAGE).with_pts(pts, 1)).collect()
    }

    /// Run the answer through the transport chain, as the real client does
    /// for every request.
    async fn answer(&self, method: &str, response: RootUpdate) -> Result<(), InvocationError> {
        let (Some(me), Some(transport)) = (self.me.upgrade(), self.transport.get()) else {
            return Ok(());
        };
        let mut chain = transport.clone();
        chain.push(Arc::new(Reply(response)));
        let mut ctx = Context::request(me, Request::new(method));
        chain.dispatch(&mut ctx).await.map_err(|e| InvocationError::Io(io::Error::other(e)))
    }
}

#[async_trait]
impl UpdatesClient for SimServer {
    async fn get_difference(&self, params: GetDifference, _: CallOptions) -> Result<Difference, InvocationError> {
        let state = self.state();
        let diff = if params.pts >= state.pts {
            Difference::Empty { date: state.date, seq: state.seq }
        } else {
            Difference::Difference {
                new_updates: (params.pts + 1..=state.pts)
                    .map(|pts| RawUpdate::new(ID_UPDATE_NEW_MESSAGE).with_pts(pts, 1))
                    .collect(),
                state,
            }
        };
        self.answer(METHOD_GET_DIFFERENCE, diff.clone().into()).await?;
        Ok(diff)
    }

    async fn get_channel_difference(
        &self,
        params: GetChannelDifference,
        _:      CallOptions,
    ) -> Result<ChannelDifference, InvocationError> {
        let channel_id = params.channel.channel_id;
        let pts = self.channels.lock().unwrap().get(&channel_id).copied().unwrap_or(1);
        let diff = if params.pts >= pts {
            ChannelDifference::Empty { is_final: true, pts, timeout: None }
        } else {
            ChannelDifference::Difference {
                is_final:    true,
                pts,
                timeout:     None,
                new_updates: (params.pts + 1..=pts)
                    .map(|p| RawUpdate::new(ID_UPDATE_NEW_CHANNEL_MESSAGE).with_pts(p, 1).in_channel(channel_id))
                    .collect(),
            }
        };
        self.answer(METHOD_GET_CHANNEL_DIFFERENCE, diff.clone().into()).await?;
        Ok(diff)
    }

    async fn get_state(&self) -> Result<ProtocolState, InvocationError> {
        Ok(self.state())
    }

    async fn start_polling(&self) -> Result<(), InvocationError> {
        println!("✅ Transport polling");
        Ok(())
    }

    async fn stop(&self) -> Result<(), InvocationError> {
        println!("\n👋 Transport stopped");
        Ok(())
    }

    async fn handle_error(&self, error: &DispatchError, ctx: &Context) -> Result<(), InvocationError> {
        eprintln!("✗ {} failed: {error}", ctx.kind);
        Ok(())
    }
}

/// Terminal middleware that fills in the server's response.
struct Reply(RootUpdate);

#[async_trait]
impl Middleware for Reply {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        ctx.response = Some(self.0.clone());
        next.run(ctx).await
    }
}

// ─── Gap-aware handler ────────────────────────────────────────────────────────

struct GapAwareFactory {
    store: Arc<InMemoryStateStore>,
}

impl UpdateHandlerFactory for GapAwareFactory {
    fn create(&self, engine: &UpdateEngine, _: &Context, _: Completion) -> Box<dyn UpdateHandler> {
        Box::new(GapAware { engine: engine.clone(), store: self.store.clone() })
    }
}

/// Applies pushed updates in order; on a gap it fetches the difference and
/// drops the pushed batch, which the difference already covers.
struct GapAware {
    engine: UpdateEngine,
    store:  Arc<InMemoryStateStore>,
}

#[async_trait]
impl UpdateHandler for GapAware {
    async fn handle(&mut self, payload: &RootUpdate) -> Result<bool, DispatchError> {
        // Differences were committed by the fetcher already.
        let RootUpdate::Updates(updates) = payload else { return Ok(false) };

        for update in updates.updates() {
            let Some(pts) = update.pts else { continue };
            match update.channel_id {
                Some(channel_id) => {
                    let mut channel = ChatStore::get(&*self.store, channel_id).await?;
                    match channel.check_position(pts, update.pts_count) {
                        PositionCheck::InOrder => {
                            channel.advance(pts);
                            ChatStore::set(&*self.store, channel).await?;
                        }
                        PositionCheck::Gap { expected, got } => {
                            println!("   channel {channel_id}: expected pts {expected}, got {got}");
                            self.engine.get_channel_difference(channel_id).await?;
                            return Ok(true);
                        }
                        PositionCheck::Duplicate => return Ok(true),
                    }
                }
                None => {
                    let state = StateStore::get(&*self.store).await?;
                    match state.check_position(pts, update.pts_count) {
                        PositionCheck::InOrder => {
                            StateStore::set(&*self.store, ProtocolState { pts, ..state }).await?;
                        }
                        PositionCheck::Gap { expected, got } => {
                            println!("   expected pts {expected}, got {got}");
                            self.engine.get_difference().await?;
                            return Ok(true);
                        }
                        PositionCheck::Duplicate => return Ok(true),
                    }
                }
            }
        }
        Ok(false)
    }
}

// ─── Downstream consumer ──────────────────────────────────────────────────────

struct Printer;

#[async_trait]
impl Middleware for Printer {
    async fn call(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), DispatchError> {
        if let Some(update) = &ctx.update {
            let positions: Vec<String> = update
                .updates()
                .iter()
                .filter_map(|u| u.pts)
                .map(|p| p.to_string())
                .collect();
            println!(
                "{} 📨 {:<32} depth={} pts=[{}]",
                Local::now().format("%H:%M:%S%.3f"),
                ctx.kind,
                ctx.depth,
                positions.join(","),
            );
        }
        next.run(ctx).await
    }
}
