//! # layer-updates
//!
//! Update dispatch engine for sequenced update streams (MTProto `pts` /
//! `qts` / `seq`).
//!
//! ## Features
//! - `getState` / `getDifference` / `getChannelDifference` with per-key
//!   deduplication: any number of concurrent triggers, one network call
//! - Cooldown window before a settled fetch may be re-issued
//! - Strictly ordered, single-concurrency processing of update batches
//! - Diagnostic watchdog for slow handlers (warns, never cancels)
//! - Middleware-based dispatch: handled updates are re-emitted as uniform
//!   synthetic update events to a downstream chain
//! - Pluggable state stores: in-memory, binary file, SQLite (`sqlite-state`)
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use layer_updates::{EngineConfig, UpdateEngine, UpdatesClient};
//!
//! async fn run(client: Arc<dyn UpdatesClient>) -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = UpdateEngine::builder(client.clone())
//!         .config(EngineConfig::from_env())
//!         .build();
//!
//!     // Reconcile anything missed while offline, then keep going.
//!     engine.start_polling().await?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

mod errors;
mod stats;
pub mod client;
pub mod config;
pub mod engine;
pub mod fetcher;
pub mod handler;
pub mod middleware;
pub mod queue;
pub mod state;
pub mod state_store;
pub mod types;
pub mod watchdog;

pub use client::{CallOptions, UpdatesClient};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, MAX_EMIT_DEPTH, UpdateEngine, WeakEngine};
pub use errors::{DispatchError, InvocationError, RpcError};
pub use fetcher::RequestKey;
pub use handler::{Completion, PassThrough, UpdateHandler, UpdateHandlerFactory};
pub use middleware::{Chain, Context, Middleware, Next, Optional, optional};
pub use queue::{PendingTask, QueueRun, UpdateQueue};
pub use state::{ChannelState, PositionCheck, ProtocolState};
pub use state_store::{BinaryFileStateStore, ChatStore, InMemoryStateStore, StateStore};
#[cfg(feature = "sqlite-state")]
pub use state_store::SqliteStateStore;
pub use stats::EngineStats;
pub use types::{ChannelDifference, Difference, RawUpdate, Request, RootUpdate, Updates};
pub use watchdog::Watchdog;
