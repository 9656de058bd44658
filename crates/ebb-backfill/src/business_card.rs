//! Business cards: capability descriptors published through the directory.
//!
//! A card names where to send each kind of message to a node for one
//! region. Cards are immutable once published; a node that moves its
//! mailboxes publishes a new card.

use ebb_types::{Address, BranchId};
use serde::{Deserialize, Serialize};

/// Where to reach a node's backfiller for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackfillerBusinessCard {
    /// Accepts `BackfillRequest`.
    pub backfill_addr: Address,

    /// Accepts `CancelBackfill` for sessions this backfiller serves.
    pub cancel_addr: Address,
}

/// Where to reach a node's replica for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaBusinessCard {
    /// Accepts `Synchronize`.
    pub synchronize_addr: Address,

    /// Accepts `ReplicateWrite` from the region's authoritative writer.
    pub live_write_addr: Address,

    /// The branch this replica currently follows.
    pub branch_id: BranchId,

    /// The backfiller co-located with this replica.
    pub backfiller: BackfillerBusinessCard,
}
