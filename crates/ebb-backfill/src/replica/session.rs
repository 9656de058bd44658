//! Backfill session bookkeeping.
//!
//! A session exists on both ends of one backfill: the backfiller keeps a
//! [`BackfillerSession`] and the receiver a [`ReceiverSession`]. Both walk
//! the same [`SessionState`] machine:
//!
//! ```text
//! Requested ──► Negotiating ──► Streaming ──► Completing ──► Done
//!                   │               │              │
//!                   └──► Cancelled ◄┴──────────────┘
//!
//! any non-terminal state ──► Failed
//! ```
//!
//! The receiver starts in `Requested` and moves straight to `Streaming` when
//! the negotiation reply arrives; the backfiller starts in `Negotiating`.
//! Sessions are dropped from the replica as soon as they reach a terminal
//! state, which releases their mailboxes and token domain.

use std::collections::VecDeque;
use std::fmt::Display;

use ebb_types::{Address, Key, KeyRange, MailboxId, SessionId};

use crate::business_card::BackfillerBusinessCard;
use crate::history::Version;
use crate::order_token::{TokenDomainId, TokenValidator};
use crate::storage::{KvEntry, Storage, StorageError};
use crate::version_map::VersionMap;

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of one backfill session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Receiver: request sent, waiting for the negotiation reply.
    Requested,
    /// Backfiller: merging histories and planning the stream.
    Negotiating,
    /// Chunks are flowing.
    Streaming,
    /// Backfiller: every chunk sent, waiting for the last ack.
    /// Receiver: last chunk applied, waiting for the completion notice.
    Completing,
    Done,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Returns true if a session may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{
            Cancelled, Completing, Done, Failed, Negotiating, Requested, Streaming,
        };
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Requested, Negotiating | Streaming | Cancelled)
            | (Negotiating, Streaming | Completing | Cancelled)
            | (Streaming, Completing | Cancelled)
            | (Completing, Done | Cancelled) => true,
            _ => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Requested => write!(f, "requested"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Completing => write!(f, "completing"),
            SessionState::Done => write!(f, "done"),
            SessionState::Cancelled => write!(f, "cancelled"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Chunk Plan
// ============================================================================

/// A range the receiver is behind on, and the version it catches up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedPiece {
    pub range: KeyRange,
    pub version: Version,
}

/// One chunk read from storage, about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedChunk {
    pub range: KeyRange,
    pub version: Version,
    pub entries: Vec<KvEntry>,
}

/// Number of chunks a piece holding `entries` keys splits into. An empty
/// piece still takes one chunk so the receiver learns it is empty.
pub(crate) fn chunk_count(entries: usize, max_entries: usize) -> u64 {
    debug_assert!(max_entries > 0, "chunk size must be positive");
    entries.div_ceil(max_entries).max(1) as u64
}

// ============================================================================
// Backfiller Side
// ============================================================================

/// Backfiller-side record of one session it serves.
///
/// Only ranges and versions are planned up front. Data is read from
/// storage one chunk at a time, when allowance lets the chunk go out.
#[derive(Debug, Clone)]
pub(crate) struct BackfillerSession {
    pub state: SessionState,
    pub region: KeyRange,

    /// The receiver's per-session mailbox.
    pub peer: Address,

    /// Accepts chunk acks.
    pub chunk_mailbox: MailboxId,

    /// Accepts allowance grants.
    pub allowance_mailbox: MailboxId,

    pub domain: TokenDomainId,

    /// The backfiller's map for the region at negotiation. Once every
    /// chunk is applied the receiver's map dominates it.
    pub negotiated: VersionMap,

    /// Pieces not yet fully sent, in key order.
    pub plan: VecDeque<PlannedPiece>,

    /// Start of the unsent part of the front piece.
    pub cursor: Option<Key>,

    /// Chunk count estimated from key counts at negotiation.
    pub total_chunks: u64,
    pub sent: u64,

    /// Chunks that may still be sent under the current grant.
    pub allowance: u32,

    /// Validates that acks arrive in stream order.
    pub acks: TokenValidator,
}

impl BackfillerSession {
    /// Reads the next chunk of the plan, holding at most `max_entries`
    /// entries. Chunk ranges partition each piece; a boundary is the first
    /// key of the following chunk.
    pub fn next_chunk<S: Storage>(
        &mut self,
        storage: &S,
        max_entries: usize,
    ) -> Result<Option<PlannedChunk>, StorageError> {
        let Some(piece) = self.plan.front() else {
            return Ok(None);
        };
        let start = self
            .cursor
            .take()
            .unwrap_or_else(|| piece.range.start().clone());
        let remaining = KeyRange::new(start.clone(), piece.range.end().cloned());
        let version = piece.version;

        let mut entries = storage.read_batch(&remaining, max_entries + 1)?;
        if entries.len() > max_entries {
            let next = entries.split_off(max_entries);
            let boundary = next[0].key.clone();
            self.cursor = Some(boundary.clone());
            return Ok(Some(PlannedChunk {
                range: KeyRange::new(start, Some(boundary)),
                version,
                entries,
            }));
        }

        self.plan.pop_front();
        Ok(Some(PlannedChunk {
            range: remaining,
            version,
            entries,
        }))
    }

    /// True once every planned chunk has been read.
    pub fn is_drained(&self) -> bool {
        self.plan.is_empty()
    }

    /// Progress fraction after `sent` chunks: exactly `1.0` once the plan
    /// is drained, and strictly below it before.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.is_drained() {
            1.0
        } else {
            let estimate = self.total_chunks.max(self.sent + 1);
            (self.sent as f64 / estimate as f64).min(BELOW_ONE)
        }
    }

    pub fn all_acked(&self) -> bool {
        self.acks.last_seen() >= self.sent
    }
}

/// Largest progress a chunk that is not the last may report.
const BELOW_ONE: f64 = 1.0 - f64::EPSILON;

// ============================================================================
// Receiver Side
// ============================================================================

/// Receiver-side record of one session it requested.
#[derive(Debug, Clone)]
pub(crate) struct ReceiverSession {
    pub state: SessionState,
    pub region: KeyRange,

    /// Where chunks, the reply and the completion notice arrive.
    pub reply_mailbox: MailboxId,

    pub backfiller: BackfillerBusinessCard,

    /// Learned from the negotiation reply.
    pub chunk_addr: Option<Address>,
    pub allowance_addr: Option<Address>,
    pub validator: Option<TokenValidator>,

    /// Chunks the backfiller may still send before the next grant.
    pub outstanding: u32,
    pub applied_since_grant: u32,
    pub last_progress: f64,
}

impl ReceiverSession {
    pub fn new(
        region: KeyRange,
        reply_mailbox: MailboxId,
        backfiller: BackfillerBusinessCard,
        initial_allowance: u32,
    ) -> Self {
        Self {
            state: SessionState::Requested,
            region,
            reply_mailbox,
            backfiller,
            chunk_addr: None,
            allowance_addr: None,
            validator: None,
            outstanding: initial_allowance,
            applied_since_grant: 0,
            last_progress: 0.0,
        }
    }
}

/// Moves a session to `next`, asserting the transition is legal.
pub(crate) fn transition(session_id: SessionId, state: &mut SessionState, next: SessionState) {
    debug_assert!(
        state.can_transition_to(next),
        "session {session_id}: illegal transition {state} -> {next}"
    );
    *state = next;
}
