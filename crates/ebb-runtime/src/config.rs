//! Runtime configuration.

use ebb_backfill::BackfillConfig;
use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Configuration shared by every replica task in a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Backfill sizing applied to replicas opened through the cluster.
    pub backfill: BackfillConfig,

    /// Bound on queued client requests per replica task.
    ///
    /// Peer traffic is not counted here: the backfill allowance already
    /// bounds it.
    pub mailbox_capacity: usize,
}

impl RuntimeConfig {
    pub fn testing() -> Self {
        Self {
            backfill: BackfillConfig::testing(),
            mailbox_capacity: 16,
        }
    }

    pub fn development() -> Self {
        Self {
            backfill: BackfillConfig::development(),
            mailbox_capacity: 256,
        }
    }

    pub fn production() -> Self {
        Self {
            backfill: BackfillConfig::production(),
            mailbox_capacity: 4096,
        }
    }

    /// Sets the backfill configuration.
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Sets the per-replica request queue bound.
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.backfill.validate()?;
        if self.mailbox_capacity == 0 {
            return Err(RuntimeError::ZeroMailboxCapacity);
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::production()
    }
}
