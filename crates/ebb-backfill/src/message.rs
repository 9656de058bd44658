//! Backfill protocol messages.
//!
//! Every message is one-way and addressed to a mailbox named in a business
//! card or handed out inside an earlier message.
//!
//! ## Backfill Session
//! - [`BackfillRequest`] - Receiver → Backfiller: catch me up on this region
//! - [`BackfillNegotiationReply`] - Backfiller → Receiver: my view, and where to ack
//! - [`BackfillChunk`] - Backfiller → Receiver: one slice of data
//! - [`BackfillChunkAck`] - Receiver → Backfiller: chunk applied
//! - [`AllowanceGrant`] - Receiver → Backfiller: you may send more chunks
//! - [`BackfillComplete`] - Backfiller → Receiver: stream finished
//! - [`CancelBackfill`] - Either side: stop this session
//! - [`BackfillFailed`] - Either side: this session died, and why
//!
//! ## Synchronize
//! - [`Synchronize`] - Reader → Replica: tell me when you have seen this
//! - [`SynchronizeAck`] - Replica → Reader: you may proceed
//!
//! ## Live Replication
//! - [`ReplicateWrite`] - Writer → Replica: apply this write

use std::fmt::Display;

use ebb_types::{Address, KeyRange, SessionId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::history::{BranchHistory, Version};
use crate::order_token::{OrderToken, TokenDomainId};
use crate::storage::{KvEntry, ScopedRecord};
use crate::version_map::VersionMap;

// ============================================================================
// Message Envelope
// ============================================================================

/// A protocol message with routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The mailbox that sent this message.
    pub from: Address,

    /// The mailbox this message is delivered to.
    pub to: Address,

    /// The message payload.
    pub payload: MessagePayload,
}

impl Message {
    pub fn new(from: Address, to: Address, payload: MessagePayload) -> Self {
        Self { from, to, payload }
    }
}

// ============================================================================
// Message Payload
// ============================================================================

/// The payload of a protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    // === Backfill Session ===
    BackfillRequest(BackfillRequest),
    BackfillNegotiationReply(BackfillNegotiationReply),
    BackfillChunk(BackfillChunk),
    BackfillChunkAck(BackfillChunkAck),
    AllowanceGrant(AllowanceGrant),
    BackfillComplete(BackfillComplete),
    CancelBackfill(CancelBackfill),
    BackfillFailed(BackfillFailed),

    // === Synchronize ===
    Synchronize(Synchronize),
    SynchronizeAck(SynchronizeAck),

    // === Live Replication ===
    ReplicateWrite(ReplicateWrite),
}

impl MessagePayload {
    /// Returns the backfill session this message belongs to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            MessagePayload::BackfillRequest(m) => Some(m.session_id),
            MessagePayload::BackfillNegotiationReply(m) => Some(m.session_id),
            MessagePayload::BackfillChunk(m) => Some(m.session_id),
            MessagePayload::BackfillChunkAck(m) => Some(m.session_id),
            MessagePayload::AllowanceGrant(m) => Some(m.session_id),
            MessagePayload::BackfillComplete(m) => Some(m.session_id),
            MessagePayload::CancelBackfill(m) => Some(m.session_id),
            MessagePayload::BackfillFailed(m) => Some(m.session_id),
            MessagePayload::Synchronize(_)
            | MessagePayload::SynchronizeAck(_)
            | MessagePayload::ReplicateWrite(_) => None,
        }
    }

    /// Returns a human-readable name for the message type.
    pub fn name(&self) -> &'static str {
        match self {
            MessagePayload::BackfillRequest(_) => "BackfillRequest",
            MessagePayload::BackfillNegotiationReply(_) => "BackfillNegotiationReply",
            MessagePayload::BackfillChunk(_) => "BackfillChunk",
            MessagePayload::BackfillChunkAck(_) => "BackfillChunkAck",
            MessagePayload::AllowanceGrant(_) => "AllowanceGrant",
            MessagePayload::BackfillComplete(_) => "BackfillComplete",
            MessagePayload::CancelBackfill(_) => "CancelBackfill",
            MessagePayload::BackfillFailed(_) => "BackfillFailed",
            MessagePayload::Synchronize(_) => "Synchronize",
            MessagePayload::SynchronizeAck(_) => "SynchronizeAck",
            MessagePayload::ReplicateWrite(_) => "ReplicateWrite",
        }
    }
}

// ============================================================================
// Backfill Session Messages
// ============================================================================

/// Receiver → Backfiller: catch me up on `region`.
///
/// Sent to the backfiller card's `backfill_addr`. The receiver has already
/// allocated `reply_addr`; every later message of the session that is
/// addressed to the receiver arrives there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub session_id: SessionId,

    /// The region to catch up.
    pub region: KeyRange,

    /// The receiver's version map restricted to `region`.
    pub version_map: VersionMap,

    /// The receiver's branch history.
    pub history: BranchHistory,

    /// Receiver mailbox for the rest of the session.
    pub reply_addr: Address,

    /// Chunks the backfiller may send before the first grant.
    pub initial_allowance: u32,
}

/// Backfiller → Receiver: negotiation accepted.
///
/// Carries the backfiller's own view of the region so the receiver learns
/// new history before any chunk arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillNegotiationReply {
    pub session_id: SessionId,

    /// The backfiller's version map restricted to the region.
    pub version_map: VersionMap,

    /// The backfiller's branch history.
    pub history: BranchHistory,

    /// Backfiller mailbox for this session's chunk stream; chunk acks go
    /// here.
    pub chunk_addr: Address,

    /// Backfiller mailbox accepting [`AllowanceGrant`]s.
    pub allowance_addr: Address,

    /// Token domain the chunks of this session are stamped from.
    pub domain: TokenDomainId,

    /// Estimated number of chunks, from key counts at negotiation. Zero
    /// means there is nothing to stream; otherwise the last chunk is the one
    /// whose progress reaches `1.0`.
    pub total_chunks: u64,
}

/// Backfiller → Receiver: one slice of catch-up data.
///
/// Applying the chunk makes `range` hold exactly `entries` at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillChunk {
    pub session_id: SessionId,

    /// The key range this chunk replaces.
    pub range: KeyRange,

    /// The version of the data in `range`.
    pub version: Version,

    /// The data in `range`, in key order.
    pub entries: Vec<KvEntry>,

    /// Fraction of the session streamed so far, including this chunk.
    ///
    /// Non-decreasing across the session and exactly `1.0` on the last
    /// chunk.
    pub progress: f64,

    /// Position in the session's token domain.
    pub token: OrderToken,
}

impl BackfillChunk {
    /// Returns the chunk as a storage record for `range`.
    pub fn to_record(&self) -> ScopedRecord {
        ScopedRecord::new(vec![self.range.clone()], self.version, self.entries.clone())
    }

    /// Returns true if this is the final chunk of its session.
    pub fn is_last(&self) -> bool {
        self.progress >= 1.0
    }
}

/// Receiver → Backfiller: the chunk with `token` has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillChunkAck {
    pub session_id: SessionId,
    pub token: OrderToken,
}

/// Receiver → Backfiller: `chunks` more chunks may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceGrant {
    pub session_id: SessionId,
    pub chunks: u32,
}

/// Backfiller → Receiver: every chunk has been acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillComplete {
    pub session_id: SessionId,

    /// The map the stream brought the receiver up to: the backfiller's
    /// map for the region at negotiation. Local writes the backfiller took
    /// since then reach the receiver through the live write stream.
    pub version_map: VersionMap,

    /// The backfiller's branch history at completion.
    pub history: BranchHistory,
}

/// Either side: stop the session. Applied chunks stay applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelBackfill {
    pub session_id: SessionId,
}

/// Either side: the session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillFailed {
    pub session_id: SessionId,
    pub reason: FailureReason,
}

/// Reason code for a session-fatal error, shared with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The two histories disagree about a branch.
    HistoryConflict,

    /// Versions compared concurrent where an order was required.
    CausalConcurrency,

    /// An order token arrived out of sequence.
    OutOfOrder,

    /// The storage engine failed to apply a chunk.
    StorageApplyFailed,

    /// The backfiller sent more chunks than it was granted.
    AllowanceExceeded,

    /// A message was invalid for the session's current state.
    ProtocolViolation,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::HistoryConflict => write!(f, "history_conflict"),
            FailureReason::CausalConcurrency => write!(f, "causal_concurrency"),
            FailureReason::OutOfOrder => write!(f, "out_of_order"),
            FailureReason::StorageApplyFailed => write!(f, "storage_apply_failed"),
            FailureReason::AllowanceExceeded => write!(f, "allowance_exceeded"),
            FailureReason::ProtocolViolation => write!(f, "protocol_violation"),
        }
    }
}

// ============================================================================
// Synchronize Messages
// ============================================================================

/// Reader → Replica: reply once `range` has caught up to `target`.
///
/// The target is a timestamp on the replica's own branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synchronize {
    pub range: KeyRange,
    pub target: Timestamp,
    pub ack_addr: Address,
}

/// Replica → Reader: the synchronize condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SynchronizeAck;

// ============================================================================
// Live Replication Messages
// ============================================================================

/// Writer → Replica: apply one live write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateWrite {
    pub record: ScopedRecord,

    /// Position in the writer's live-write domain.
    pub token: OrderToken,
}
