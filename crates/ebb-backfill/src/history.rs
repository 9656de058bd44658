//! Causal history store.
//!
//! A region's history is a DAG of *branches*. Each branch is a period during
//! which one node was the sole authoritative writer; it records which branch
//! it forked from and up to which timestamp of that parent it inherited.
//!
//! ```text
//!   A: t0 ──── t40 ──── t80
//!                │
//!                └─► B: t40 ──── t90      (B forked from A at t40)
//! ```
//!
//! Two versions `(branch, timestamp)` are ordered by walking parent links:
//! `(A, t30)` is before `(B, t60)` because B inherited A up to t40, while
//! `(A, t80)` and `(B, t60)` are concurrent because A kept going after the
//! fork. Concurrency is reported, never resolved here.
//!
//! Histories only grow. [`BranchHistory::merge`] adds records the local side
//! is missing and fails if the two sides disagree about any shared branch.

use std::collections::BTreeMap;
use std::fmt::Display;

use ebb_types::{BranchId, KeyRange, Timestamp, TimestampRange};
use serde::{Deserialize, Serialize};

// ============================================================================
// Version
// ============================================================================

/// A point in a region's history: a branch and a timestamp on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: Timestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

/// Result of comparing two versions through the branch DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CausalOrder {
    /// The left version is causally before the right one.
    Before,
    /// The left version is causally after the right one.
    After,
    /// Same branch, same timestamp.
    Equal,
    /// Divergent: neither version includes the other.
    Concurrent,
}

impl CausalOrder {
    /// Returns true if the left side has seen at least everything the right
    /// side has.
    pub fn is_at_least(&self) -> bool {
        matches!(self, CausalOrder::After | CausalOrder::Equal)
    }
}

// ============================================================================
// Branch Records
// ============================================================================

/// Link from a branch to the branch it forked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentLink {
    /// The parent branch.
    pub branch: BranchId,

    /// Timestamps of the parent the child inherited; `latest` is the fork
    /// point.
    pub range: TimestampRange,
}

impl ParentLink {
    pub fn new(branch: BranchId, range: TimestampRange) -> Self {
        Self { branch, range }
    }

    /// The last parent timestamp the child branch includes.
    pub fn fork_point(&self) -> Timestamp {
        self.range.latest
    }
}

/// Provenance of one branch. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchRecord {
    pub parent: Option<ParentLink>,
    pub region: KeyRange,
    pub initial_timestamp: Timestamp,
}

impl BranchRecord {
    /// Creates a root branch (no parent).
    pub fn root(region: KeyRange, initial_timestamp: Timestamp) -> Self {
        Self {
            parent: None,
            region,
            initial_timestamp,
        }
    }

    /// Creates a branch forked from `parent`.
    pub fn forked(parent: ParentLink, region: KeyRange, initial_timestamp: Timestamp) -> Self {
        Self {
            parent: Some(parent),
            region,
            initial_timestamp,
        }
    }
}

/// Errors raised while growing a branch history.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// Two histories hold different records for the same branch.
    #[error("history conflict on branch {branch}")]
    Conflict { branch: BranchId },

    /// A record's parent chain does not resolve.
    #[error("branch {branch} references unknown parent {parent}")]
    DanglingParent { branch: BranchId, parent: BranchId },
}

// ============================================================================
// Branch History
// ============================================================================

/// Append-only mapping from branch ids to their records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(BranchId, BranchRecord)>", into = "Vec<(BranchId, BranchRecord)>")]
pub struct BranchHistory {
    branches: BTreeMap<BranchId, BranchRecord>,
}

impl From<Vec<(BranchId, BranchRecord)>> for BranchHistory {
    fn from(entries: Vec<(BranchId, BranchRecord)>) -> Self {
        Self {
            branches: entries.into_iter().collect(),
        }
    }
}

impl From<BranchHistory> for Vec<(BranchId, BranchRecord)> {
    fn from(history: BranchHistory) -> Self {
        history.branches.into_iter().collect()
    }
}

impl BranchHistory {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a newly created branch.
    ///
    /// The parent (if any) must already be present. Re-adding an identical
    /// record is a no-op; a different record for an existing id is a
    /// conflict.
    pub fn create_branch(
        &mut self,
        branch: BranchId,
        record: BranchRecord,
    ) -> Result<(), HistoryError> {
        if let Some(existing) = self.branches.get(&branch) {
            if *existing != record {
                return Err(HistoryError::Conflict { branch });
            }
            return Ok(());
        }
        if let Some(parent) = record.parent {
            if !self.branches.contains_key(&parent.branch) {
                return Err(HistoryError::DanglingParent {
                    branch,
                    parent: parent.branch,
                });
            }
        }
        self.branches.insert(branch, record);
        Ok(())
    }

    /// Builder form of [`create_branch`](Self::create_branch).
    pub fn with_branch(
        mut self,
        branch: BranchId,
        record: BranchRecord,
    ) -> Result<Self, HistoryError> {
        self.create_branch(branch, record)?;
        Ok(self)
    }

    pub fn get(&self, branch: &BranchId) -> Option<&BranchRecord> {
        self.branches.get(branch)
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BranchId, &BranchRecord)> {
        self.branches.iter()
    }

    /// Merges `incoming` into this history.
    ///
    /// Every branch present on both sides must have an identical record.
    /// Every new record's parent chain must resolve within the union of the
    /// two histories. The merge is all-or-nothing: on error nothing is
    /// inserted.
    pub fn merge(&mut self, incoming: &BranchHistory) -> Result<(), HistoryError> {
        for (branch, record) in &incoming.branches {
            if let Some(existing) = self.branches.get(branch) {
                if existing != record {
                    return Err(HistoryError::Conflict { branch: *branch });
                }
            }
        }

        let bound = self.branches.len() + incoming.branches.len();
        for (branch, record) in &incoming.branches {
            if self.branches.contains_key(branch) {
                continue;
            }
            let mut current = *branch;
            let mut link = record.parent;
            let mut steps = 0usize;
            while let Some(parent) = link {
                let next = self
                    .branches
                    .get(&parent.branch)
                    .or_else(|| incoming.branches.get(&parent.branch));
                let Some(next) = next else {
                    return Err(HistoryError::DanglingParent {
                        branch: current,
                        parent: parent.branch,
                    });
                };
                steps += 1;
                if steps > bound {
                    // A parent cycle can only come from a corrupt peer.
                    return Err(HistoryError::Conflict { branch: *branch });
                }
                current = parent.branch;
                link = next.parent;
            }
        }

        for (branch, record) in &incoming.branches {
            self.branches
                .entry(*branch)
                .or_insert_with(|| record.clone());
        }
        Ok(())
    }

    /// Pure form of [`merge`](Self::merge): returns the union of both
    /// histories.
    pub fn merged(&self, incoming: &BranchHistory) -> Result<BranchHistory, HistoryError> {
        let mut result = self.clone();
        result.merge(incoming)?;
        Ok(result)
    }

    /// Returns the timestamp of `ancestor` up to which `descendant`
    /// inherited history, or `None` if `ancestor` is not a proper ancestor.
    pub fn fork_point(&self, ancestor: BranchId, descendant: BranchId) -> Option<Timestamp> {
        let mut link = self.branches.get(&descendant)?.parent;
        let mut steps = 0usize;
        while let Some(parent) = link {
            if parent.branch == ancestor {
                return Some(parent.fork_point());
            }
            steps += 1;
            if steps > self.branches.len() {
                return None;
            }
            link = self.branches.get(&parent.branch)?.parent;
        }
        None
    }

    /// Returns true if `candidate` is a proper ancestor of `of`.
    pub fn is_ancestor(&self, candidate: BranchId, of: BranchId) -> bool {
        self.fork_point(candidate, of).is_some()
    }

    /// Returns the proper ancestors of `branch`, nearest first, each with
    /// the fork point the chain inherited from it.
    pub fn ancestors(&self, branch: BranchId) -> Vec<(BranchId, Timestamp)> {
        let mut out = Vec::new();
        let mut link = self.branches.get(&branch).and_then(|r| r.parent);
        while let Some(parent) = link {
            if out.len() > self.branches.len() {
                break;
            }
            out.push((parent.branch, parent.fork_point()));
            link = self.branches.get(&parent.branch).and_then(|r| r.parent);
        }
        out
    }

    /// Compares two versions for causal order.
    ///
    /// Versions on branches this history cannot resolve are reported as
    /// [`CausalOrder::Concurrent`] since no order can be proven.
    pub fn compare(&self, a: Version, b: Version) -> CausalOrder {
        if a.branch == b.branch {
            return match a.timestamp.cmp(&b.timestamp) {
                std::cmp::Ordering::Less => CausalOrder::Before,
                std::cmp::Ordering::Greater => CausalOrder::After,
                std::cmp::Ordering::Equal => CausalOrder::Equal,
            };
        }
        if let Some(fork) = self.fork_point(a.branch, b.branch) {
            return if a.timestamp <= fork {
                CausalOrder::Before
            } else {
                CausalOrder::Concurrent
            };
        }
        if let Some(fork) = self.fork_point(b.branch, a.branch) {
            return if b.timestamp <= fork {
                CausalOrder::After
            } else {
                CausalOrder::Concurrent
            };
        }
        CausalOrder::Concurrent
    }
}
