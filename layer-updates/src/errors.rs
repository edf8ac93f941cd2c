//! Error types for layer-updates.
//!
//! [`InvocationError`] is what collaborators (transport, state stores, chat
//! lookup, update handlers) hand back.  [`DispatchError`] is what the engine
//! itself surfaces to callers.

use std::{fmt, io, sync::Arc};

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server error message like `"PERSISTENT_TIMESTAMP_EMPTY"` or
    /// `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v) };
                }
            }
        }
        Self { code, name: message.to_string(), value: None }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("CHANNEL_PRIVATE")`: exact match
    /// - `err.is("PERSISTENT_TIMESTAMP_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned by every collaborator the engine calls into.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// Network / storage I/O failure.
    Io(io::Error),
    /// A response or persisted record could not be decoded.
    Deserialize(String),
    /// The request was dropped (e.g. the transport shut down).
    Dropped,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)          => write!(f, "{e}"),
            Self::Io(e)           => write!(f, "I/O error: {e}"),
            Self::Deserialize(s)  => write!(f, "deserialize error: {s}"),
            Self::Dropped         => write!(f, "request dropped"),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            Self::Io(e)  => Some(e),
            _            => None,
        }
    }
}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }
}

// ─── DispatchError ────────────────────────────────────────────────────────────

/// Errors surfaced by [`crate::UpdateEngine`] and the dispatch middleware.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// A request-shaped event went through the whole chain and no handler
    /// produced a response.
    ContractViolation {
        /// RPC method name of the offending request.
        method: String,
    },
    /// The external update handler failed.
    Handler(Arc<InvocationError>),
    /// A difference/state fetch failed.  Every caller that shared the fetch
    /// receives the same error.
    Fetch(Arc<InvocationError>),
    /// A synthetic update event was re-emitted too many times in a row.
    EmitDepthExceeded {
        depth: usize,
    },
    /// The transport failed to start or stop.
    Transport(Arc<InvocationError>),
    /// The engine was shut down while the operation was pending.
    Stopped,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractViolation { method } => write!(
                f,
                "handled request {method:?} produced no response; \
                 some middleware in the chain must resolve one"
            ),
            Self::Handler(e)                   => write!(f, "update handler failed: {e}"),
            Self::Fetch(e)                     => write!(f, "difference fetch failed: {e}"),
            Self::EmitDepthExceeded { depth }  => write!(f, "update emission depth {depth} exceeded"),
            Self::Transport(e)                 => write!(f, "transport error: {e}"),
            Self::Stopped                      => write!(f, "update engine stopped"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Handler(e)
            | Self::Fetch(e)
            | Self::Transport(e) => Some(e.as_ref()),
            _                    => None,
        }
    }
}

impl From<InvocationError> for DispatchError {
    fn from(e: InvocationError) -> Self { Self::Handler(Arc::new(e)) }
}

impl DispatchError {
    /// Returns `true` if this is a fetch failure carrying the named RPC error.
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Fetch(e)
            | Self::Handler(e)
            | Self::Transport(e) => e.is(pattern),
            _                    => false,
        }
    }
}
