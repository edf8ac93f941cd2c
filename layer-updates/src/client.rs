//! The transport-side collaborator the engine drives.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{DispatchError, InvocationError};
use crate::middleware::Context;
use crate::state::ProtocolState;
use crate::types::{ChannelDifference, Difference, GetChannelDifference, GetDifference};

/// Per-call options passed alongside a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// How long the transport may wait for the response.
    pub timeout: Duration,
}

impl CallOptions {
    /// Largest timeout the protocol layer accepts (`0x7fffffff` ms).
    pub const MAX_TIMEOUT: Duration = Duration::from_millis(0x7fff_ffff);

    /// Wait as long as the server allows; difference calls may long-poll.
    pub fn unbounded() -> Self {
        Self { timeout: Self::MAX_TIMEOUT }
    }
}

/// The subset of the RPC surface and lifecycle the engine needs.
///
/// Implemented by the real MTProto client; tests implement it with fakes.
#[async_trait]
pub trait UpdatesClient: Send + Sync {
    /// `updates.getDifference`
    async fn get_difference(
        &self,
        params:  GetDifference,
        options: CallOptions,
    ) -> Result<Difference, InvocationError>;

    /// `updates.getChannelDifference`
    async fn get_channel_difference(
        &self,
        params:  GetChannelDifference,
        options: CallOptions,
    ) -> Result<ChannelDifference, InvocationError>;

    /// `updates.getState`
    async fn get_state(&self) -> Result<ProtocolState, InvocationError>;

    /// Start receiving pushed updates.
    async fn start_polling(&self) -> Result<(), InvocationError>;

    /// Shut the transport down.
    async fn stop(&self) -> Result<(), InvocationError>;

    /// Report a failure that happened while handling `ctx`.
    ///
    /// May fail itself; the engine discards such failures.
    async fn handle_error(&self, error: &DispatchError, ctx: &Context) -> Result<(), InvocationError>;
}
