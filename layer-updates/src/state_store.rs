//! Pluggable update-state storage.
//!
//! [`StateStore`] persists the account-wide [`ProtocolState`]; [`ChatStore`]
//! resolves and persists per-channel [`ChannelState`] descriptors.  The engine
//! only ever reads and writes through these traits and never caches a state
//! beyond a single in-flight operation.
//!
//! Built-in backends:
//! * [`InMemoryStateStore`]: ephemeral, for tests and bots that start fresh.
//! * [`BinaryFileStateStore`]: compact binary file.
//! * [`SqliteStateStore`]: SQLite (requires the `sqlite-state` Cargo feature).
//!
//! Every `set` is atomic from the engine's point of view: a reader observes
//! either the previous state or the new one, never a mix.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::InvocationError;
use crate::state::{ChannelState, ProtocolState};

// ─── Traits ───────────────────────────────────────────────────────────────────

/// Where the account-wide update state lives.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the current state.  An empty store returns `ProtocolState::default()`.
    async fn get(&self) -> Result<ProtocolState, InvocationError>;

    /// Replace the stored state.
    async fn set(&self, state: ProtocolState) -> Result<(), InvocationError>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

/// Channel descriptor lookup (`chat.get()`) plus persistence of its position.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Resolve the access hash and position of a channel.
    ///
    /// Unknown channels resolve to `ChannelState { access_hash: 0, pts: 0, .. }`;
    /// the request builder substitutes protocol defaults for both.
    async fn get(&self, channel_id: i64) -> Result<ChannelState, InvocationError>;

    /// Persist a channel descriptor.
    async fn set(&self, state: ChannelState) -> Result<(), InvocationError>;
}

// ─── InMemoryStateStore ───────────────────────────────────────────────────────

/// An ephemeral store that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    state:    Mutex<ProtocolState>,
    channels: Mutex<HashMap<i64, ChannelState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-known state.
    pub fn with_state(state: ProtocolState) -> Self {
        Self { state: Mutex::new(state), channels: Mutex::default() }
    }

    /// Register a channel descriptor (e.g. after resolving the channel).
    pub fn insert_channel(&self, channel: ChannelState) {
        self.channels.lock().unwrap().insert(channel.channel_id, channel);
    }

    /// Current state without going through the async trait.
    pub fn snapshot(&self) -> ProtocolState {
        *self.state.lock().unwrap()
    }

    /// Current descriptor of a channel, if one was stored.
    pub fn channel(&self, channel_id: i64) -> Option<ChannelState> {
        self.channels.lock().unwrap().get(&channel_id).copied()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self) -> Result<ProtocolState, InvocationError> {
        Ok(self.snapshot())
    }

    async fn set(&self, state: ProtocolState) -> Result<(), InvocationError> {
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

#[async_trait]
impl ChatStore for InMemoryStateStore {
    async fn get(&self, channel_id: i64) -> Result<ChannelState, InvocationError> {
        Ok(self.channel(channel_id).unwrap_or(ChannelState::new(channel_id, 0, 0)))
    }

    async fn set(&self, state: ChannelState) -> Result<(), InvocationError> {
        self.insert_channel(state);
        Ok(())
    }
}

// ─── BinaryFileStateStore ─────────────────────────────────────────────────────

/// Stores the state in a compact little-endian binary file:
///
/// ```text
/// pts:i64 qts:i64 seq:i64 date:i64 count:u32 (channel_id:i64 access_hash:i64 pts:i64)*
/// ```
///
/// Writes go to a sibling temporary file which is then renamed over the
/// original.
pub struct BinaryFileStateStore {
    path:  PathBuf,
    cache: Mutex<Option<PersistedState>>,
}

#[derive(Clone, Default, Debug, PartialEq)]
struct PersistedState {
    state:    ProtocolState,
    channels: HashMap<i64, ChannelState>,
}

impl PersistedState {
    fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(36 + self.channels.len() * 24);
        b.extend_from_slice(&self.state.pts.to_le_bytes());
        b.extend_from_slice(&self.state.qts.to_le_bytes());
        b.extend_from_slice(&self.state.seq.to_le_bytes());
        b.extend_from_slice(&self.state.date.to_le_bytes());
        b.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
        let mut ids: Vec<_> = self.channels.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let c = &self.channels[&id];
            b.extend_from_slice(&c.channel_id.to_le_bytes());
            b.extend_from_slice(&c.access_hash.to_le_bytes());
            b.extend_from_slice(&c.pts.to_le_bytes());
        }
        b
    }

    fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated update state"));
                }
                let s = &buf[p..p + $n];
                p += $n;
                s
            }};
        }
        macro_rules! i64_le {
            () => {{
                let mut raw = [0u8; 8];
                raw.copy_from_slice(r!(8));
                i64::from_le_bytes(raw)
            }};
        }

        let state = ProtocolState {
            pts:  i64_le!(),
            qts:  i64_le!(),
            seq:  i64_le!(),
            date: i64_le!(),
        };
        let mut raw = [0u8; 4];
        raw.copy_from_slice(r!(4));
        let count = u32::from_le_bytes(raw) as usize;

        let mut channels = HashMap::with_capacity(count.min(4096));
        for _ in 0..count {
            let channel_id  = i64_le!();
            let access_hash = i64_le!();
            let pts         = i64_le!();
            channels.insert(channel_id, ChannelState { channel_id, access_hash, pts });
        }
        Ok(Self { state, channels })
    }
}

impl BinaryFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cache: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the stored state (e.g. on sign-out).
    pub fn delete(&self) -> io::Result<()> {
        *self.cache.lock().unwrap() = None;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn load(&self) -> io::Result<PersistedState> {
        let mut cache = self.cache.lock().unwrap();
        Self::load_into(&self.path, &mut cache)
    }

    fn load_into(path: &Path, cache: &mut Option<PersistedState>) -> io::Result<PersistedState> {
        if let Some(c) = cache.as_ref() {
            return Ok(c.clone());
        }
        let loaded = if path.exists() {
            PersistedState::decode(&std::fs::read(path)?)?
        } else {
            PersistedState::default()
        };
        *cache = Some(loaded.clone());
        Ok(loaded)
    }

    /// Read-modify-write under the cache lock so concurrent writers serialize.
    fn update(&self, apply: impl FnOnce(&mut PersistedState)) -> io::Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let mut next = Self::load_into(&self.path, &mut cache)?;
        apply(&mut next);

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, next.encode())?;
        std::fs::rename(&tmp, &self.path)?;

        *cache = Some(next);
        Ok(())
    }
}

#[async_trait]
impl StateStore for BinaryFileStateStore {
    async fn get(&self) -> Result<ProtocolState, InvocationError> {
        Ok(self.load()?.state)
    }

    async fn set(&self, state: ProtocolState) -> Result<(), InvocationError> {
        Ok(self.update(|p| p.state = state)?)
    }

    fn name(&self) -> &str { "binary-file" }
}

#[async_trait]
impl ChatStore for BinaryFileStateStore {
    async fn get(&self, channel_id: i64) -> Result<ChannelState, InvocationError> {
        Ok(self.load()?
            .channels
            .get(&channel_id)
            .copied()
            .unwrap_or(ChannelState::new(channel_id, 0, 0)))
    }

    async fn set(&self, state: ChannelState) -> Result<(), InvocationError> {
        Ok(self.update(|p| { p.channels.insert(state.channel_id, state); })?)
    }
}

// ─── SqliteStateStore ─────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-state")]
pub use sqlite_store::SqliteStateStore;

#[cfg(feature = "sqlite-state")]
mod sqlite_store {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    fn sql_err(e: rusqlite::Error) -> InvocationError {
        InvocationError::Io(io::Error::new(io::ErrorKind::Other, e))
    }

    /// SQLite-backed update-state store.
    ///
    /// Creates two tables (`update_state` and `channel_state`) if they do not
    /// exist.  Enable with the `sqlite-state` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// layer-updates = { version = "*", features = ["sqlite-state"] }
    /// ```
    pub struct SqliteStateStore {
        path: PathBuf,
    }

    impl SqliteStateStore {
        pub fn new(path: impl Into<PathBuf>) -> Result<Self, InvocationError> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(sql_err)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS update_state (
                    id   INTEGER PRIMARY KEY CHECK (id = 0),
                    pts  INTEGER NOT NULL,
                    qts  INTEGER NOT NULL,
                    seq  INTEGER NOT NULL,
                    date INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS channel_state (
                    channel_id  INTEGER PRIMARY KEY,
                    access_hash INTEGER NOT NULL,
                    pts         INTEGER NOT NULL
                );",
            ).map_err(sql_err)?;
            Ok(Self { path })
        }

        fn open(&self) -> Result<Connection, InvocationError> {
            Connection::open(&self.path).map_err(sql_err)
        }
    }

    #[async_trait]
    impl StateStore for SqliteStateStore {
        async fn get(&self) -> Result<ProtocolState, InvocationError> {
            let conn = self.open()?;
            let state = conn
                .query_row(
                    "SELECT pts, qts, seq, date FROM update_state WHERE id = 0",
                    [],
                    |row| Ok(ProtocolState {
                        pts:  row.get(0)?,
                        qts:  row.get(1)?,
                        seq:  row.get(2)?,
                        date: row.get(3)?,
                    }),
                )
                .optional()
                .map_err(sql_err)?;
            Ok(state.unwrap_or_default())
        }

        async fn set(&self, state: ProtocolState) -> Result<(), InvocationError> {
            let conn = self.open()?;
            conn.execute(
                "INSERT OR REPLACE INTO update_state (id, pts, qts, seq, date)
                 VALUES (0, ?1, ?2, ?3, ?4)",
                params![state.pts, state.qts, state.seq, state.date],
            ).map_err(sql_err)?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }

    #[async_trait]
    impl ChatStore for SqliteStateStore {
        async fn get(&self, channel_id: i64) -> Result<ChannelState, InvocationError> {
            let conn = self.open()?;
            let state = conn
                .query_row(
                    "SELECT access_hash, pts FROM channel_state WHERE channel_id = ?1",
                    params![channel_id],
                    |row| Ok(ChannelState::new(channel_id, row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql_err)?;
            Ok(state.unwrap_or(ChannelState::new(channel_id, 0, 0)))
        }

        async fn set(&self, state: ChannelState) -> Result<(), InvocationError> {
            let conn = self.open()?;
            conn.execute(
                "INSERT OR REPLACE INTO channel_state (channel_id, access_hash, pts)
                 VALUES (?1, ?2, ?3)",
                params![state.channel_id, state.access_hash, state.pts],
            ).map_err(sql_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_layout_decodes_what_it_encodes() {
        let mut channels = HashMap::new();
        channels.insert(7, ChannelState::new(7, -42, 1_000));
        let persisted = PersistedState {
            state: ProtocolState { pts: 10, qts: 2, seq: 3, date: 1_700_000_000 },
            channels,
        };
        let bytes = persisted.encode();
        assert_eq!(bytes.len(), 32 + 4 + 24);
        assert_eq!(PersistedState::decode(&bytes).unwrap(), persisted);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let bytes = PersistedState::default().encode();
        let err = PersistedState::decode(&bytes[..20]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(feature = "sqlite-state")]
    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("layer-updates-sqlite-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let store = SqliteStateStore::new(&path).unwrap();
        assert_eq!(StateStore::get(&store).await.unwrap(), ProtocolState::default());
        assert_eq!(ChatStore::get(&store, 9).await.unwrap(), ChannelState::new(9, 0, 0));

        let state = ProtocolState { pts: 77, qts: 5, seq: 12, date: 1_700_000_500 };
        StateStore::set(&store, state).await.unwrap();
        ChatStore::set(&store, ChannelState::new(9, -1234, 40)).await.unwrap();
        ChatStore::set(&store, ChannelState::new(9, -1234, 41)).await.unwrap();

        let reopened = SqliteStateStore::new(&path).unwrap();
        assert_eq!(StateStore::get(&reopened).await.unwrap(), state);
        assert_eq!(ChatStore::get(&reopened, 9).await.unwrap(), ChannelState::new(9, -1234, 41));

        std::fs::remove_file(&path).unwrap();
    }
}
