//! Per-region replica state machine.
//!
//! One [`ReplicaState`] hosts one copy of one region on one node. It plays
//! every role the protocol needs for that copy:
//!
//! - **Backfiller**: serves `BackfillRequest`s from peers that are behind
//! - **Receiver**: requests and applies a backfill from a peer
//! - **Synchronize target**: acks readers once a range has caught up
//! - **Live writer / follower**: stamps and replicates local writes, or
//!   applies replicated ones
//!
//! # Architecture
//!
//! The state machine follows the FCIS pattern:
//! - Takes events (messages, local requests) as input
//! - Produces new state, outgoing messages and session outcomes as output
//! - No clocks, no randomness, no transport
//!
//! Storage is reached through the [`Storage`](crate::storage::Storage)
//! trait so that a chunk is durably applied before the version map moves.
//!
//! # Mailboxes
//!
//! Each message is addressed to a mailbox. Four are fixed and published in
//! the replica's business card; the rest are allocated per session and
//! released when the session ends, so stray messages for a finished session
//! find no mailbox and are dropped.

mod backfiller;
mod live;
mod receiver;
mod session;
mod state;
mod synchronize;

pub use session::SessionState;
pub use state::*;

use ebb_types::{Address, KeyRange, SessionId};

use crate::business_card::BackfillerBusinessCard;
use crate::history::Version;
use crate::message::{FailureReason, Message, MessagePayload};
use crate::order_token::OrderToken;
use crate::storage::KvEntry;

// ============================================================================
// Replica Output
// ============================================================================

/// Output produced by the replica state machine.
///
/// The caller (runtime) is responsible for:
/// 1. Delivering the outgoing messages in order per destination
/// 2. Resolving whoever waits on the reported session outcomes
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// Messages to send.
    pub messages: Vec<Message>,

    /// Sessions that reached a terminal state.
    pub outcomes: Vec<SessionOutcome>,

    /// If Some, a local write was applied at this version.
    pub written: Option<Version>,

    /// Inbound live-write streams that stopped at a write this replica
    /// could not apply.
    pub stalled: Vec<StalledStream>,
}

impl ReplicaOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if there is nothing to act on.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.outcomes.is_empty()
            && self.written.is_none()
            && self.stalled.is_empty()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.messages.extend(other.messages);
        self.outcomes.extend(other.outcomes);
        if other.written.is_some() {
            self.written = other.written;
        }
        self.stalled.extend(other.stalled);
    }

    pub(crate) fn send(&mut self, from: Address, to: Address, payload: MessagePayload) {
        self.messages.push(Message::new(from, to, payload));
    }

    pub(crate) fn outcome(&mut self, session_id: SessionId, role: SessionRole, end: SessionEnd) {
        self.outcomes.push(SessionOutcome {
            session_id,
            role,
            end,
        });
    }

    pub(crate) fn stall(&mut self, writer: Address, token: OrderToken, reason: FailureReason) {
        self.stalled.push(StalledStream {
            writer,
            token,
            reason,
        });
    }
}

/// A live write that was dropped. Later writes in the same token domain
/// are dropped too until the writer resubscribes this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalledStream {
    pub writer: Address,
    pub token: OrderToken,
    pub reason: FailureReason,
}

// ============================================================================
// Session Outcomes
// ============================================================================

/// Which end of a session this node was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Backfiller,
    Receiver,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEnd {
    Completed,
    Cancelled,
    Failed(FailureReason),
}

/// A session that reached a terminal state.
///
/// Each end reports at most one outcome per session. A backfiller that
/// rejects a request at negotiation reports `Failed` for it even though the
/// session never held a mailbox or token domain there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub role: SessionRole,
    pub end: SessionEnd,
}

// ============================================================================
// Replica Event
// ============================================================================

/// Events that can trigger replica state transitions.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A message arrived for one of this replica's mailboxes.
    Message(Message),

    /// Start catching up `region` from the backfiller named by `backfiller`.
    StartBackfill {
        session_id: SessionId,
        region: KeyRange,
        backfiller: BackfillerBusinessCard,
    },

    /// Cancel a session this replica takes part in.
    CancelBackfill { session_id: SessionId },

    /// Apply a local write to `scope` (authoritative replica only).
    LocalWrite { scope: KeyRange, entries: Vec<KvEntry> },

    /// Replicate future local writes to the replica at `live_write_addr`.
    Subscribe { live_write_addr: Address },
}
