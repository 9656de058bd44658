//! # ebb-types: Core types for `ebb`
//!
//! This crate contains shared types used across the `ebb` replication layer:
//! - Entity IDs ([`NodeId`], [`ShardId`], [`MailboxId`], [`BranchId`], [`SessionId`])
//! - Message addressing ([`Address`])
//! - Logical time ([`Timestamp`], [`TimestampRange`])
//! - Key space ([`Key`], [`KeyRange`])

use std::cmp::Ordering;
use std::fmt::{Debug, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

/// Unique identifier for a node (process) in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

/// Identifier of one hosted region replica on a node.
///
/// A node may host copies of several regions; each copy is a shard with its
/// own mailboxes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardId(u64);

impl ShardId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl From<u64> for ShardId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifier of a mailbox within a shard.
///
/// Mailbox ids are allocated from a per-shard counter and are never reused
/// while the shard lives.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MailboxId(u64);

impl MailboxId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next mailbox id.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mb{}", self.0)
    }
}

// ============================================================================
// Address - Copy (node + shard + mailbox)
// ============================================================================

/// A handle a peer can later send a message to.
///
/// Addresses are plain capabilities: holding one is enough to deliver a
/// message to the named mailbox. They are embedded in business cards and
/// passed inside messages as reply endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub node: NodeId,
    pub shard: ShardId,
    pub mailbox: MailboxId,
}

impl Address {
    pub fn new(node: NodeId, shard: ShardId, mailbox: MailboxId) -> Self {
        Self {
            node,
            shard,
            mailbox,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.shard, self.mailbox)
    }
}

// ============================================================================
// Random 128-bit identifiers
// ============================================================================

/// Length of random identifiers in bytes.
pub const ID_LENGTH: usize = 16;

fn random_id() -> [u8; ID_LENGTH] {
    let mut bytes = [0u8; ID_LENGTH];
    getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
    bytes
}

fn fmt_short_hex(bytes: &[u8; ID_LENGTH], f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
        f,
        "{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

/// Opaque unique identifier for a branch.
///
/// A branch is a maximal period during which one node is the sole
/// authoritative writer for a region. Branch ids are created when a region
/// fails over to a new writer and are immutable once created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId([u8; ID_LENGTH]);

impl BranchId {
    /// Creates a branch id from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Creates a branch id from a 128-bit integer.
    ///
    /// Deterministic ids are useful for simulation and tests.
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Generates a new random branch id.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        Self(random_id())
    }
}

impl Debug for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BranchId(")?;
        fmt_short_hex(&self.0, f)?;
        write!(f, "...)")
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b:")?;
        fmt_short_hex(&self.0, f)
    }
}

/// Opaque unique identifier for one backfill request/response exchange.
///
/// Generated by the requester and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; ID_LENGTH]);

impl SessionId {
    /// Creates a session id from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the id as a byte slice.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    /// Generates a new random session id.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        Self(random_id())
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId(")?;
        fmt_short_hex(&self.0, f)?;
        write!(f, "...)")
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bf:")?;
        fmt_short_hex(&self.0, f)
    }
}

// ============================================================================
// Timestamp - Copy (logical clock)
// ============================================================================

/// Logical clock value, monotonically increasing within a branch.
///
/// Timestamps from different branches are only comparable through the
/// branch history (see `ebb-backfill`'s causal history store).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The initial timestamp of every branch.
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next timestamp (incremented by 1).
    pub fn next(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for u64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

/// Inclusive range of timestamps `[earliest, latest]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimestampRange {
    pub earliest: Timestamp,
    pub latest: Timestamp,
}

impl TimestampRange {
    pub fn new(earliest: Timestamp, latest: Timestamp) -> Self {
        debug_assert!(earliest <= latest, "timestamp range must not be inverted");
        Self { earliest, latest }
    }

    /// A range covering exactly one timestamp.
    pub fn point(ts: Timestamp) -> Self {
        Self {
            earliest: ts,
            latest: ts,
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.earliest <= ts && ts <= self.latest
    }
}

impl Display for TimestampRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.earliest, self.latest)
    }
}

// ============================================================================
// Key - Clone (zero-copy Bytes)
// ============================================================================

/// A key in the ordered key space. Keys compare lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Key(Bytes);

impl Key {
    /// The smallest key (empty byte string).
    pub fn min() -> Self {
        Self(Bytes::new())
    }

    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Encodes an integer as a big-endian key, preserving numeric order.
    pub fn from_u64(value: u64) -> Self {
        Self(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self})")
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "-");
        }
        if self.0.len() == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.0);
            return write!(f, "{}", u64::from_be_bytes(raw));
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&'static str> for Key {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

// ============================================================================
// KeyRange - Clone (half-open interval over keys)
// ============================================================================

/// Half-open key interval `[start, end)`; `end == None` means unbounded.
///
/// A region is a key range owned and replicated as a unit.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Key,
    end: Option<Key>,
}

/// Compares two exclusive upper bounds, treating `None` as infinity.
pub fn cmp_end(a: Option<&Key>, b: Option<&Key>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

impl KeyRange {
    /// Creates a range `[start, end)`.
    pub fn new(start: Key, end: Option<Key>) -> Self {
        Self { start, end }
    }

    /// Creates a bounded range `[start, end)`.
    pub fn bounded(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Self::new(start.into(), Some(end.into()))
    }

    /// Creates an unbounded range `[start, ∞)`.
    pub fn from_start(start: impl Into<Key>) -> Self {
        Self::new(start.into(), None)
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(Key::min(), None)
    }

    pub fn start(&self) -> &Key {
        &self.start
    }

    pub fn end(&self) -> Option<&Key> {
        self.end.as_ref()
    }

    pub fn is_unbounded(&self) -> bool {
        self.end.is_none()
    }

    /// Returns true if the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.end.as_ref().is_some_and(|end| *end <= self.start)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        *key >= self.start && self.end.as_ref().is_none_or(|end| key < end)
    }

    /// Returns true if `other` lies entirely within this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.is_empty()
            || (other.start >= self.start
                && cmp_end(other.end.as_ref(), self.end.as_ref()) != Ordering::Greater)
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.intersection(other).is_some()
    }

    /// Returns the non-empty intersection of two ranges, if any.
    pub fn intersection(&self, other: &KeyRange) -> Option<KeyRange> {
        let start = std::cmp::max(&self.start, &other.start).clone();
        let end = match cmp_end(self.end.as_ref(), other.end.as_ref()) {
            Ordering::Greater => other.end.clone(),
            _ => self.end.clone(),
        };
        let range = KeyRange::new(start, end);
        if range.is_empty() { None } else { Some(range) }
    }

    /// Splits the range at `key`, returning `[start, key)` and `[key, end)`.
    ///
    /// Either half is `None` when it would be empty.
    pub fn split_at(&self, key: &Key) -> (Option<KeyRange>, Option<KeyRange>) {
        let left = KeyRange::new(self.start.clone(), Some(key.clone()));
        let right = KeyRange::new(key.clone(), self.end.clone());
        let left = self.intersection(&left);
        let right = self.intersection(&right);
        (left, right)
    }
}

impl Debug for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyRange{self}")
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, ∞)", self.start),
        }
    }
}

#[cfg(test)]
mod tests;
