//! ebb-directory: Business card discovery for `ebb`
//!
//! Nodes publish a [`ReplicaBusinessCard`] for every region copy they host.
//! A replica that needs to catch up looks up the cards of peers hosting its
//! region and opens a backfill against one of them.
//!
//! Entries are keyed by `(NodeId, region)`. A node may publish several
//! regions, and several nodes may publish overlapping regions.
//!
//! # Example
//!
//! ```
//! use ebb_backfill::{BackfillerBusinessCard, ReplicaBusinessCard};
//! use ebb_directory::Directory;
//! use ebb_types::{Address, BranchId, KeyRange, MailboxId, NodeId, ShardId};
//!
//! let node = NodeId::new(1);
//! let addr = |m| Address::new(node, ShardId::new(0), MailboxId::new(m));
//! let card = ReplicaBusinessCard {
//!     synchronize_addr: addr(2),
//!     live_write_addr: addr(3),
//!     branch_id: BranchId::from_u128(1),
//!     backfiller: BackfillerBusinessCard {
//!         backfill_addr: addr(0),
//!         cancel_addr: addr(1),
//!     },
//! };
//!
//! let mut directory = Directory::new();
//! directory.publish(node, KeyRange::full(), card).unwrap();
//!
//! let found = directory.backfiller_for(&KeyRange::bounded(0u64, 10u64), NodeId::new(2));
//! assert_eq!(found.unwrap().card, card);
//! ```

use ebb_backfill::ReplicaBusinessCard;
use ebb_types::{KeyRange, NodeId};
use serde::{Deserialize, Serialize};

/// One published card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub node: NodeId,
    pub region: KeyRange,
    pub card: ReplicaBusinessCard,
}

/// Published business cards, keyed by `(NodeId, region)`.
///
/// Directory is `Clone` and serializable; the runtime shares one behind a
/// lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    entries: Vec<DirectoryEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `card` for `node`'s copy of `region`, replacing any card
    /// previously published under the same key.
    ///
    /// Returns the replaced card, if any.
    ///
    /// # Errors
    ///
    /// - [`DirectoryError::EmptyRegion`] if `region` holds no keys
    /// - [`DirectoryError::NodeMismatch`] if the card's addresses belong to
    ///   another node
    pub fn publish(
        &mut self,
        node: NodeId,
        region: KeyRange,
        card: ReplicaBusinessCard,
    ) -> Result<Option<ReplicaBusinessCard>, DirectoryError> {
        if region.is_empty() {
            return Err(DirectoryError::EmptyRegion { node });
        }
        let addresses = [
            card.synchronize_addr,
            card.live_write_addr,
            card.backfiller.backfill_addr,
            card.backfiller.cancel_addr,
        ];
        if let Some(foreign) = addresses.iter().find(|a| a.node != node) {
            return Err(DirectoryError::NodeMismatch {
                node,
                card_node: foreign.node,
            });
        }

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.node == node && e.region == region)
        {
            return Ok(Some(std::mem::replace(&mut existing.card, card)));
        }
        self.entries.push(DirectoryEntry { node, region, card });
        Ok(None)
    }

    /// Builder form of [`publish`](Self::publish).
    pub fn with_card(
        mut self,
        node: NodeId,
        region: KeyRange,
        card: ReplicaBusinessCard,
    ) -> Result<Self, DirectoryError> {
        self.publish(node, region, card)?;
        Ok(self)
    }

    /// Retracts the card `node` published for exactly `region`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotPublished`] if there is no such card.
    pub fn retract(
        &mut self,
        node: NodeId,
        region: &KeyRange,
    ) -> Result<ReplicaBusinessCard, DirectoryError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.node == node && &e.region == region)
            .ok_or_else(|| DirectoryError::NotPublished {
                node,
                region: region.clone(),
            })?;
        Ok(self.entries.remove(index).card)
    }

    /// Retracts every card `node` published. Returns how many were removed.
    pub fn retract_node(&mut self, node: NodeId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.node != node);
        before - self.entries.len()
    }

    pub fn get(&self, node: NodeId, region: &KeyRange) -> Option<&ReplicaBusinessCard> {
        self.entries
            .iter()
            .find(|e| e.node == node && &e.region == region)
            .map(|e| &e.card)
    }

    /// Returns every entry whose region overlaps `region`.
    pub fn lookup(&self, region: &KeyRange) -> Vec<&DirectoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.region.overlaps(region))
            .collect()
    }

    /// Finds a peer other than `exclude` whose published region contains
    /// all of `region`, so one backfill session can cover it.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NoBackfiller`] if no such peer exists.
    pub fn backfiller_for(
        &self,
        region: &KeyRange,
        exclude: NodeId,
    ) -> Result<&DirectoryEntry, DirectoryError> {
        self.entries
            .iter()
            .find(|e| e.node != exclude && e.region.contains_range(region))
            .ok_or_else(|| DirectoryError::NoBackfiller {
                region: region.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter()
    }
}

/// Errors that can occur during directory operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// A card was published for a region with no keys.
    #[error("node {node} published an empty region")]
    EmptyRegion { node: NodeId },

    /// A card names mailboxes on a different node than it was published for.
    #[error("card published for node {node} names node {card_node}")]
    NodeMismatch { node: NodeId, card_node: NodeId },

    /// No card is published under the given key.
    #[error("node {node} has no card for {region}")]
    NotPublished { node: NodeId, region: KeyRange },

    /// No peer hosts the whole region.
    #[error("no backfiller hosts {region}")]
    NoBackfiller { region: KeyRange },
}

#[cfg(test)]
mod tests;
