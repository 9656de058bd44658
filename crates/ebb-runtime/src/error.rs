//! Runtime error types.

use ebb_backfill::{BackfillError, ConfigError, FailureReason};
use ebb_types::{NodeId, SessionId, ShardId};

/// Errors that can occur during runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Error from the directory (e.g., no peer hosts the region).
    #[error(transparent)]
    DirectoryError(#[from] ebb_directory::DirectoryError),

    /// The configuration cannot make progress.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The replica state machine rejected an operation.
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    #[error("mailbox_capacity must be positive")]
    ZeroMailboxCapacity,

    /// Replicas may not run on the shard reserved for client replies.
    #[error("shard {shard} is reserved for client replies")]
    ReservedShard { shard: ShardId },

    /// A replica for this node and shard is already running.
    #[error("replica {node}/{shard} is already running")]
    AlreadyRunning { node: NodeId, shard: ShardId },

    /// The backfill session failed on either end.
    #[error("backfill {session_id} failed: {reason}")]
    BackfillFailed {
        session_id: SessionId,
        reason: FailureReason,
    },

    /// The backfill session was cancelled by either end.
    #[error("backfill {session_id} was cancelled")]
    Cancelled { session_id: SessionId },

    /// The replica refused a local write.
    #[error("write rejected by replica {node}/{shard}")]
    WriteRejected { node: NodeId, shard: ShardId },

    /// The replica task has stopped.
    #[error("replica has shut down")]
    Shutdown,
}
