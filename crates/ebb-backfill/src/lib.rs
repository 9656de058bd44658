//! # ebb-backfill: Replica catch-up for `ebb`
//!
//! This crate implements the backfill protocol: how a replica that is
//! arbitrarily far behind, or has never held a region, converges to a
//! causally consistent copy of it while live writes keep flowing.
//!
//! ## Architecture
//!
//! ```text
//!  Receiver                                   Backfiller
//!  ────────                                   ──────────
//!  BackfillRequest(map, history) ───────────►
//!                                             merge history, diff maps
//!        ◄────────── BackfillNegotiationReply(map, history, chunk_addr)
//!        ◄────────── BackfillChunk(token 1, progress 0.5)
//!  apply, BackfillChunkAck ─────────────────►
//!        ◄────────── BackfillChunk(token 2, progress 1.0)
//!  apply, BackfillChunkAck ─────────────────►
//!        ◄────────── BackfillComplete(map, history)
//! ```
//!
//! ## Key Components
//!
//! - [`history`]: Causal history store (branch DAG, causal compare, merge)
//! - [`version_map`]: Per-sub-range version tags with diff and apply
//! - [`order_token`]: Per-stream sequence tokens
//! - [`message`]: Protocol messages
//! - [`business_card`]: Capability descriptors published to the directory
//! - [`storage`]: Storage engine boundary and in-memory engine
//! - [`replica`]: The pure per-region state machine
//!
//! ## Design Principles
//!
//! 1. **Functional Core / Imperative Shell (FCIS)**: [`ReplicaState`] is a
//!    deterministic state machine; transport and scheduling live in
//!    `ebb-runtime`.
//!
//! 2. **Apply if causally newer**: chunks and live writes only replace data
//!    whose version is causally before theirs, so replay is harmless.
//!
//! 3. **Explicit backpressure**: the backfiller never exceeds the chunk
//!    allowance granted by the receiver.

pub mod business_card;
pub mod config;
pub mod history;
pub mod message;
pub mod order_token;
pub mod replica;
pub mod storage;
pub mod version_map;

#[cfg(test)]
mod simulation;

pub use business_card::{BackfillerBusinessCard, ReplicaBusinessCard};
pub use config::{BackfillConfig, ConfigError};
pub use history::{BranchHistory, BranchRecord, CausalOrder, HistoryError, ParentLink, Version};
pub use message::{
    AllowanceGrant, BackfillChunk, BackfillChunkAck, BackfillComplete, BackfillFailed,
    BackfillNegotiationReply, BackfillRequest, CancelBackfill, FailureReason, Message,
    MessagePayload, ReplicateWrite, Synchronize, SynchronizeAck,
};
pub use order_token::{
    OrderToken, OrderTokenSequencer, OutOfOrder, TokenDomainId, TokenValidator, validate,
};
pub use replica::{
    ReplicaEvent, ReplicaOutput, ReplicaState, SessionEnd, SessionOutcome, SessionRole,
    SessionState, StalledStream,
};
pub use storage::{KvEntry, MemoryStorage, ScopedRecord, Storage, StorageError};
pub use version_map::{DiffKind, VersionEntry, VersionMap, VersionMapError};

use ebb_types::{KeyRange, SessionId};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during backfill operations.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// Two histories disagree about a branch.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// Two versions for the same keys are concurrent.
    #[error("causal concurrency over {range}: {mine} vs {theirs}")]
    CausalConcurrency {
        range: KeyRange,
        mine: Version,
        theirs: Version,
    },

    /// A version map operation was rejected.
    #[error(transparent)]
    VersionMap(VersionMapError),

    /// An order token arrived out of sequence.
    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrder),

    /// The storage engine failed.
    #[error("storage apply failed: {0}")]
    Storage(#[from] StorageError),

    /// The backfiller sent a chunk without allowance.
    #[error("allowance exceeded for session {session_id}")]
    AllowanceExceeded { session_id: SessionId },

    /// A message named a session this node has no record of.
    #[error("unknown session {session_id}")]
    UnknownSession { session_id: SessionId },

    /// A message arrived that the session's current state does not accept.
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        message: &'static str,
        state: SessionState,
    },

    /// A request or message was malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: &'static str },

    /// The configuration cannot make progress.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<VersionMapError> for BackfillError {
    fn from(err: VersionMapError) -> Self {
        match err {
            VersionMapError::Concurrent {
                range,
                mine,
                theirs,
            } => BackfillError::CausalConcurrency {
                range,
                mine,
                theirs,
            },
            other => BackfillError::VersionMap(other),
        }
    }
}

impl BackfillError {
    /// Returns the reason code sent to the peer when this error ends a
    /// session, or `None` if the error is recovered locally.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            BackfillError::History(_) => Some(FailureReason::HistoryConflict),
            BackfillError::CausalConcurrency { .. } => Some(FailureReason::CausalConcurrency),
            BackfillError::OutOfOrder(_) => Some(FailureReason::OutOfOrder),
            BackfillError::Storage(_) => Some(FailureReason::StorageApplyFailed),
            BackfillError::AllowanceExceeded { .. } => Some(FailureReason::AllowanceExceeded),
            BackfillError::VersionMap(_)
            | BackfillError::UnexpectedMessage { .. }
            | BackfillError::InvalidRequest { .. } => Some(FailureReason::ProtocolViolation),
            BackfillError::UnknownSession { .. } | BackfillError::Config(_) => None,
        }
    }
}

/// Result type for backfill operations.
pub type BackfillResult<T> = Result<T, BackfillError>;
