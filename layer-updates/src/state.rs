//! Update-stream positions.
//!
//! The server assigns a monotonically-increasing counter called **pts** (the
//! *position*) to each update on the account-wide stream, a second one called
//! **qts** (the *qualified position*) for secret-chat events, and **seq** for
//! the combined updates container.  Every channel has its own independent pts.
//!
//! A client that misses updates sees the position jump forward and must ask
//! the server for the difference since the last position it committed.

// ─── ProtocolState ────────────────────────────────────────────────────────────

/// Account-wide update state, as persisted by a [`crate::StateStore`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolState {
    /// Main sequence counter (messages, channels list).
    pub pts:  i64,
    /// Secondary counter for secret chats.
    pub qts:  i64,
    /// Combined updates sequence.
    pub seq:  i64,
    /// Date of the last known update (Unix timestamp).
    pub date: i64,
}

impl ProtocolState {
    /// `true` once a position has been fetched or committed.
    pub fn is_known(&self) -> bool {
        self.pts != 0
    }

    /// Combine a freshly fetched state into this one.
    ///
    /// `date`, `seq` and `qts` follow the server; `pts` never moves backwards.
    pub fn merge(&self, fetched: &ProtocolState) -> ProtocolState {
        ProtocolState {
            pts:  self.pts.max(fetched.pts),
            qts:  self.qts.max(fetched.qts),
            seq:  fetched.seq,
            date: fetched.date,
        }
    }

    /// Check an incoming update against the current position.
    ///
    /// `pts_count` is how many events the update accounts for.
    pub fn check_position(&self, new_pts: i64, pts_count: i64) -> PositionCheck {
        check_position(self.pts, new_pts, pts_count)
    }
}

// ─── ChannelState ─────────────────────────────────────────────────────────────

/// Per-channel update state: access credential plus the channel's own pts.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelState {
    pub channel_id:  i64,
    pub access_hash: i64,
    pub pts:         i64,
}

impl ChannelState {
    pub fn new(channel_id: i64, access_hash: i64, pts: i64) -> Self {
        Self { channel_id, access_hash, pts }
    }

    /// Apply a confirmed pts advance.  Lower values are ignored.
    pub fn advance(&mut self, new_pts: i64) -> bool {
        if new_pts > self.pts {
            self.pts = new_pts;
            true
        } else {
            false
        }
    }

    /// Check an incoming channel update against the channel position.
    pub fn check_position(&self, new_pts: i64, pts_count: i64) -> PositionCheck {
        check_position(self.pts, new_pts, pts_count)
    }
}

// ─── PositionCheck ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionCheck {
    /// The update follows the current position exactly; apply it.
    InOrder,
    /// The position jumped forward; fetch the difference first.
    Gap { expected: i64, got: i64 },
    /// The update was already applied; discard it.
    Duplicate,
}

fn check_position(current: i64, new_pts: i64, pts_count: i64) -> PositionCheck {
    // No baseline yet: anything is acceptable, the caller will bootstrap.
    if current == 0 {
        return PositionCheck::InOrder;
    }
    let expected = current + pts_count;
    if new_pts == expected {
        PositionCheck::InOrder
    } else if new_pts > expected {
        PositionCheck::Gap { expected, got: new_pts }
    } else {
        PositionCheck::Duplicate
    }
}
