//! Payload and request types exchanged with the transport.
//!
//! The engine never interprets update contents (that is the job of the
//! [`crate::UpdateHandler`]), so the model only carries what routing,
//! position bookkeeping and logging need.  Each type reports its TL
//! constructor name via `kind()`, which is what the synthetic downstream
//! event is keyed by.

use crate::state::ProtocolState;

// ─── Method names ─────────────────────────────────────────────────────────────

pub const METHOD_GET_STATE:              &str = "updates.getState";
pub const METHOD_GET_DIFFERENCE:         &str = "updates.getDifference";
pub const METHOD_GET_CHANNEL_DIFFERENCE: &str = "updates.getChannelDifference";

/// Upper bound of messages requested per `updates.getChannelDifference`.
pub const CHANNEL_DIFFERENCE_LIMIT: i32 = 30;

// ─── Constructor IDs ─────────────────────────────────────────────────────────

pub const ID_UPDATES_TOO_LONG:      u32 = 0xe317af7e;
pub const ID_UPDATE_SHORT:          u32 = 0x78d4dec1;
pub const ID_UPDATES:               u32 = 0x74ae4240;
pub const ID_UPDATES_COMBINED:      u32 = 0x725b04c3;

// ─── RawUpdate ────────────────────────────────────────────────────────────────

/// A single update as delivered by the server, still serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUpdate {
    /// Constructor ID of the inner update.
    pub constructor_id: u32,
    /// New position after this update, for pts-carrying updates.
    pub pts:            Option<i64>,
    /// How many events this update accounts for.
    pub pts_count:      i64,
    /// Set for updates that belong to a channel's own stream.
    pub channel_id:     Option<i64>,
    /// Serialized TL body.
    pub body:           Vec<u8>,
}

impl RawUpdate {
    pub fn new(constructor_id: u32) -> Self {
        Self { constructor_id, pts: None, pts_count: 0, channel_id: None, body: Vec::new() }
    }

    /// Mark the update as advancing the position to `pts` by `pts_count`.
    pub fn with_pts(mut self, pts: i64, pts_count: i64) -> Self {
        self.pts = Some(pts);
        self.pts_count = pts_count;
        self
    }

    /// Attach the update to a channel.
    pub fn in_channel(mut self, channel_id: i64) -> Self {
        self.channel_id = Some(channel_id); self
    }
}

// ─── Updates (push) ──────────────────────────────────────────────────────────

/// An update container pushed by the server outside of any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Updates {
    /// Too many updates were pending; the client must fetch the difference.
    TooLong,
    /// A single update without sequence information.
    Short { update: RawUpdate, date: i64 },
    /// A batch of updates with a single sequence number.
    Updates { updates: Vec<RawUpdate>, date: i64, seq: i64 },
    /// A batch covering the sequence range `seq_start..=seq`.
    Combined { updates: Vec<RawUpdate>, date: i64, seq_start: i64, seq: i64 },
}

impl Updates {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TooLong         => "updatesTooLong",
            Self::Short { .. }    => "updateShort",
            Self::Updates { .. }  => "updates",
            Self::Combined { .. } => "updatesCombined",
        }
    }

    pub fn constructor_id(&self) -> u32 {
        match self {
            Self::TooLong         => ID_UPDATES_TOO_LONG,
            Self::Short { .. }    => ID_UPDATE_SHORT,
            Self::Updates { .. }  => ID_UPDATES,
            Self::Combined { .. } => ID_UPDATES_COMBINED,
        }
    }

    /// The contained updates, in delivery order.
    pub fn updates(&self) -> &[RawUpdate] {
        match self {
            Self::TooLong                    => &[],
            Self::Short { update, .. }       => std::slice::from_ref(update),
            Self::Updates { updates, .. }
            | Self::Combined { updates, .. } => updates.as_slice(),
        }
    }
}

// ─── Difference ──────────────────────────────────────────────────────────────

/// Response to `updates.getDifference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    /// Nothing happened since the given state.
    Empty { date: i64, seq: i64 },
    /// Complete list of missed updates.
    Difference { new_updates: Vec<RawUpdate>, state: ProtocolState },
    /// Partial list; another `getDifference` from `intermediate_state` is needed.
    Slice { new_updates: Vec<RawUpdate>, intermediate_state: ProtocolState },
    /// The gap is too large; the client should refetch from scratch at `pts`.
    TooLong { pts: i64 },
}

impl Difference {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty { .. }      => "updates.differenceEmpty",
            Self::Difference { .. } => "updates.difference",
            Self::Slice { .. }      => "updates.differenceSlice",
            Self::TooLong { .. }    => "updates.differenceTooLong",
        }
    }

    pub fn updates(&self) -> &[RawUpdate] {
        match self {
            Self::Difference { new_updates, .. }
            | Self::Slice { new_updates, .. } => new_updates.as_slice(),
            _                                  => &[],
        }
    }

    /// The state to commit after this difference has been received, given
    /// the state it was requested from.
    pub fn committed_state(&self, from: &ProtocolState) -> ProtocolState {
        match self {
            Self::Empty { date, seq } => ProtocolState { seq: *seq, date: *date, ..*from },
            Self::Difference { state, .. } => from.merge(state),
            Self::Slice { intermediate_state, .. } => from.merge(intermediate_state),
            Self::TooLong { pts } => ProtocolState { pts: from.pts.max(*pts), ..*from },
        }
    }
}

// ─── ChannelDifference ───────────────────────────────────────────────────────

/// Response to `updates.getChannelDifference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDifference {
    /// No new updates in the channel.
    Empty { is_final: bool, pts: i64, timeout: Option<i32> },
    /// The channel gap is too large; the client must reload the channel history.
    TooLong { is_final: bool, pts: i64, timeout: Option<i32> },
    /// Missed channel updates.
    Difference { is_final: bool, pts: i64, timeout: Option<i32>, new_updates: Vec<RawUpdate> },
}

impl ChannelDifference {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty { .. }      => "updates.channelDifferenceEmpty",
            Self::TooLong { .. }    => "updates.channelDifferenceTooLong",
            Self::Difference { .. } => "updates.channelDifference",
        }
    }

    /// Channel position after this difference.
    pub fn pts(&self) -> i64 {
        match self {
            Self::Empty { pts, .. }
            | Self::TooLong { pts, .. }
            | Self::Difference { pts, .. } => *pts,
        }
    }

    /// `false` if more differences are pending and another call is needed.
    pub fn is_final(&self) -> bool {
        match self {
            Self::Empty { is_final, .. }
            | Self::TooLong { is_final, .. }
            | Self::Difference { is_final, .. } => *is_final,
        }
    }

    pub fn updates(&self) -> &[RawUpdate] {
        match self {
            Self::Difference { new_updates, .. } => new_updates.as_slice(),
            _                                    => &[],
        }
    }
}

// ─── RootUpdate ──────────────────────────────────────────────────────────────

/// The payload the engine queues for handling: a pushed container or a
/// pulled difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootUpdate {
    Updates(Updates),
    Difference(Difference),
    ChannelDifference(ChannelDifference),
}

impl RootUpdate {
    /// TL constructor name, used as the kind of the synthetic update event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Updates(u)           => u.kind(),
            Self::Difference(d)        => d.kind(),
            Self::ChannelDifference(d) => d.kind(),
        }
    }

    /// Every contained update, in delivery order.
    pub fn updates(&self) -> &[RawUpdate] {
        match self {
            Self::Updates(u)           => u.updates(),
            Self::Difference(d)        => d.updates(),
            Self::ChannelDifference(d) => d.updates(),
        }
    }
}

impl From<Updates> for RootUpdate {
    fn from(u: Updates) -> Self { Self::Updates(u) }
}

impl From<Difference> for RootUpdate {
    fn from(d: Difference) -> Self { Self::Difference(d) }
}

impl From<ChannelDifference> for RootUpdate {
    fn from(d: ChannelDifference) -> Self { Self::ChannelDifference(d) }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// Parameters of `updates.getDifference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDifference {
    pub pts:             i64,
    pub pts_total_limit: Option<i32>,
    pub date:            i64,
    pub qts:             i64,
}

impl GetDifference {
    /// Build the request from a stored state.  An unknown qts is sent as `-1`.
    pub fn from_state(state: &ProtocolState) -> Self {
        Self {
            pts:             state.pts,
            pts_total_limit: None,
            date:            state.date,
            qts:             if state.qts != 0 { state.qts } else { -1 },
        }
    }
}

/// `InputChannel`: a channel reference carrying its access hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputChannel {
    pub channel_id:  i64,
    pub access_hash: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelMessagesFilter {
    #[default]
    Empty,
}

/// Parameters of `updates.getChannelDifference`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChannelDifference {
    pub force:   bool,
    pub channel: InputChannel,
    pub filter:  ChannelMessagesFilter,
    pub pts:     i64,
    pub limit:   i32,
}

impl GetChannelDifference {
    /// Build the request from a channel descriptor.  An unknown pts is sent
    /// as `1`, an unknown access hash as `0`.
    pub fn from_channel(channel: &crate::state::ChannelState) -> Self {
        Self {
            force:   false,
            channel: InputChannel {
                channel_id:  channel.channel_id,
                access_hash: channel.access_hash,
            },
            filter:  ChannelMessagesFilter::Empty,
            pts:     if channel.pts != 0 { channel.pts } else { 1 },
            limit:   CHANNEL_DIFFERENCE_LIMIT,
        }
    }
}

/// An outgoing RPC as seen by the middleware chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Fully-qualified TL method name, e.g. `updates.getDifference`.
    pub method: String,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into() }
    }

    /// `true` for the two difference-fetching methods.
    pub fn is_difference(&self) -> bool {
        self.method == METHOD_GET_DIFFERENCE || self.method == METHOD_GET_CHANNEL_DIFFERENCE
    }
}
