//! Version map: per-sub-range record of which version a node holds.
//!
//! A [`VersionMap`] partitions one region into sub-ranges, each tagged with
//! the [`Version`] believed current there:
//!
//! ```text
//! region [0, ∞)
//! ├── [0, 100)   A@t50
//! └── [100, ∞)   A@t30
//! ```
//!
//! # Invariants
//!
//! - Entries are sorted by start key and cover the region exactly: no gaps,
//!   no overlaps, no empty entries.
//! - Every update preserves the partition. [`VersionMap::apply_update`]
//!   only accepts ranges that lie inside one entry or that are an exact
//!   union of consecutive entries, so neighbours are never silently widened
//!   or shrunk.
//! - Maps received from peers are validated on deserialization.

use std::cmp::Ordering;
use std::fmt::Display;

use ebb_types::{Key, KeyRange, cmp_end};
use serde::{Deserialize, Serialize};

use crate::history::{BranchHistory, CausalOrder, Version};

// ============================================================================
// Entries and Diff Results
// ============================================================================

/// One sub-range of a version map and its version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionEntry {
    pub range: KeyRange,
    pub version: Version,
}

impl VersionEntry {
    pub fn new(range: KeyRange, version: Version) -> Self {
        Self { range, version }
    }
}

/// Outcome of comparing two maps over one overlapping sub-range, from the
/// perspective of the map passed as `self` to [`VersionMap::diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// The other side is causally behind us here.
    TheyAreBehind,
    /// We are causally behind the other side here.
    IAmBehind,
    /// Both sides hold the same version.
    Equal,
}

/// Errors raised by version map operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionMapError {
    /// The entries do not partition the region.
    #[error("entries do not partition region {region}: {reason}")]
    InvalidPartition {
        region: KeyRange,
        reason: &'static str,
    },

    /// An update or query named a range outside the map's region.
    #[error("range {range} lies outside region {region}")]
    OutsideRegion { range: KeyRange, region: KeyRange },

    /// An update would cut across existing entry boundaries.
    #[error("update range {range} is not within one entry nor an exact union of entries")]
    MisalignedUpdate { range: KeyRange },

    /// An update named an empty range.
    #[error("update range is empty")]
    EmptyRange,

    /// A version references a branch the history does not contain.
    #[error("version references unknown branch {branch}")]
    UnknownBranch { branch: ebb_types::BranchId },

    /// Two versions for the same keys are causally concurrent.
    #[error("concurrent versions over {range}: {mine} vs {theirs}")]
    Concurrent {
        range: KeyRange,
        mine: Version,
        theirs: Version,
    },
}

// ============================================================================
// Version Map
// ============================================================================

#[derive(Deserialize)]
struct RawVersionMap {
    region: KeyRange,
    entries: Vec<VersionEntry>,
}

impl TryFrom<RawVersionMap> for VersionMap {
    type Error = VersionMapError;

    fn try_from(raw: RawVersionMap) -> Result<Self, Self::Error> {
        VersionMap::from_entries(raw.region, raw.entries)
    }
}

/// A partition of one region into versioned sub-ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVersionMap")]
pub struct VersionMap {
    region: KeyRange,
    entries: Vec<VersionEntry>,
}

impl VersionMap {
    /// Creates a map covering `region` with a single version.
    ///
    /// An empty region yields a map with no entries.
    pub fn new(region: KeyRange, version: Version) -> Self {
        let entries = if region.is_empty() {
            Vec::new()
        } else {
            vec![VersionEntry::new(region.clone(), version)]
        };
        Self { region, entries }
    }

    /// Creates a map from explicit entries, validating the partition.
    pub fn from_entries(
        region: KeyRange,
        mut entries: Vec<VersionEntry>,
    ) -> Result<Self, VersionMapError> {
        entries.sort_by(|a, b| a.range.start().cmp(b.range.start()));
        let map = Self { region, entries };
        map.check_partition()?;
        Ok(map)
    }

    /// Returns the region this map partitions.
    pub fn region(&self) -> &KeyRange {
        &self.region
    }

    /// Returns the entries in key order.
    pub fn entries(&self) -> &[VersionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verifies that the entries partition the region exactly.
    pub fn check_partition(&self) -> Result<(), VersionMapError> {
        let invalid = |reason| VersionMapError::InvalidPartition {
            region: self.region.clone(),
            reason,
        };

        if self.region.is_empty() {
            return if self.entries.is_empty() {
                Ok(())
            } else {
                Err(invalid("empty region must have no entries"))
            };
        }

        let Some(first) = self.entries.first() else {
            return Err(invalid("no entries"));
        };
        if first.range.start() != self.region.start() {
            return Err(invalid("gap at region start"));
        }

        for pair in self.entries.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            match left.range.end() {
                Some(end) if end == right.range.start() => {}
                Some(end) if end > right.range.start() => return Err(invalid("overlap")),
                Some(_) => return Err(invalid("gap between entries")),
                None => return Err(invalid("unbounded entry before the last")),
            }
        }

        if self.entries.iter().any(|e| e.range.is_empty()) {
            return Err(invalid("empty entry"));
        }

        let last = &self.entries[self.entries.len() - 1];
        if cmp_end(last.range.end(), self.region.end()) != Ordering::Equal {
            return Err(invalid("gap at region end"));
        }
        Ok(())
    }

    /// Returns the version covering `key`, if the key lies in the region.
    pub fn version_at(&self, key: &Key) -> Option<Version> {
        self.entries
            .iter()
            .find(|e| e.range.contains_key(key))
            .map(|e| e.version)
    }

    /// Verifies that every referenced branch resolves in `history`.
    pub fn check_resolvable(&self, history: &BranchHistory) -> Result<(), VersionMapError> {
        for entry in &self.entries {
            if !history.contains(&entry.version.branch) {
                return Err(VersionMapError::UnknownBranch {
                    branch: entry.version.branch,
                });
            }
        }
        Ok(())
    }

    /// Returns the portion of this map covering `to`.
    ///
    /// If `to` does not overlap the region the result has an empty region
    /// and no entries.
    pub fn restrict(&self, to: &KeyRange) -> VersionMap {
        let Some(region) = self.region.intersection(to) else {
            return VersionMap {
                region: KeyRange::new(to.start().clone(), Some(to.start().clone())),
                entries: Vec::new(),
            };
        };
        let entries = self
            .entries
            .iter()
            .filter_map(|e| {
                e.range
                    .intersection(&region)
                    .map(|range| VersionEntry::new(range, e.version))
            })
            .collect();
        VersionMap { region, entries }
    }

    /// Compares this map against `theirs` over every overlapping sub-range.
    ///
    /// Results are in key order and use this map's perspective: `IAmBehind`
    /// marks exactly the sub-ranges where `theirs` holds a causally later
    /// version. A concurrent pair is an inconsistency and fails the diff.
    pub fn diff(
        &self,
        theirs: &VersionMap,
        history: &BranchHistory,
    ) -> Result<Vec<(KeyRange, DiffKind)>, VersionMapError> {
        let mut out = Vec::new();
        let (mine, other) = (&self.entries, &theirs.entries);
        let (mut i, mut j) = (0usize, 0usize);

        while i < mine.len() && j < other.len() {
            let (a, b) = (&mine[i], &other[j]);
            if let Some(piece) = a.range.intersection(&b.range) {
                let kind = match history.compare(a.version, b.version) {
                    CausalOrder::After => DiffKind::TheyAreBehind,
                    CausalOrder::Before => DiffKind::IAmBehind,
                    CausalOrder::Equal => DiffKind::Equal,
                    CausalOrder::Concurrent => {
                        return Err(VersionMapError::Concurrent {
                            range: piece,
                            mine: a.version,
                            theirs: b.version,
                        });
                    }
                };
                out.push((piece, kind));
            }
            match cmp_end(a.range.end(), b.range.end()) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        Ok(out)
    }

    /// Returns true if this map is causally at least as current as `other`
    /// everywhere the two overlap.
    pub fn dominates(
        &self,
        other: &VersionMap,
        history: &BranchHistory,
    ) -> Result<bool, VersionMapError> {
        Ok(self
            .diff(other, history)?
            .iter()
            .all(|(_, kind)| *kind != DiffKind::IAmBehind))
    }

    /// Returns true if every entry overlapping `range` is causally at or
    /// after `target`.
    pub fn covers(&self, range: &KeyRange, target: Version, history: &BranchHistory) -> bool {
        self.entries
            .iter()
            .filter(|e| e.range.overlaps(range))
            .all(|e| history.compare(e.version, target).is_at_least())
    }

    /// Replaces the version tag for exactly `range`.
    ///
    /// `range` must lie within one existing entry (which is split around
    /// it) or be an exact union of consecutive entries (which are replaced
    /// by one). Anything else is rejected so neighbouring ranges never
    /// change shape. Callers must only invoke this after the corresponding
    /// data is durably applied.
    pub fn apply_update(
        &mut self,
        range: &KeyRange,
        version: Version,
    ) -> Result<(), VersionMapError> {
        if range.is_empty() {
            return Err(VersionMapError::EmptyRange);
        }
        if !self.region.contains_range(range) {
            return Err(VersionMapError::OutsideRegion {
                range: range.clone(),
                region: self.region.clone(),
            });
        }

        let Some(first) = self
            .entries
            .iter()
            .position(|e| e.range.contains_key(range.start()))
        else {
            return Err(VersionMapError::MisalignedUpdate {
                range: range.clone(),
            });
        };

        if self.entries[first].range.contains_range(range) {
            let entry = self.entries.remove(first);
            let mut replacement = Vec::with_capacity(3);
            let (left, rest) = entry.range.split_at(range.start());
            if let Some(left) = left {
                replacement.push(VersionEntry::new(left, entry.version));
            }
            replacement.push(VersionEntry::new(range.clone(), version));
            if let (Some(rest), Some(end)) = (rest, range.end()) {
                let (_, right) = rest.split_at(end);
                if let Some(right) = right {
                    replacement.push(VersionEntry::new(right, entry.version));
                }
            }
            self.entries.splice(first..first, replacement);
        } else {
            if self.entries[first].range.start() != range.start() {
                return Err(VersionMapError::MisalignedUpdate {
                    range: range.clone(),
                });
            }
            let Some(last) = self.entries[first..]
                .iter()
                .position(|e| cmp_end(e.range.end(), range.end()) == Ordering::Equal)
                .map(|offset| first + offset)
            else {
                return Err(VersionMapError::MisalignedUpdate {
                    range: range.clone(),
                });
            };
            self.entries.splice(
                first..=last,
                [VersionEntry::new(range.clone(), version)],
            );
        }

        debug_assert!(
            self.check_partition().is_ok(),
            "apply_update broke the partition"
        );
        Ok(())
    }

    /// Returns the sub-ranges of `range` whose current tag is causally
    /// before `version`, i.e. where a write carrying `version` must be
    /// applied.
    ///
    /// Sub-ranges already at `version` or later are skipped, which makes
    /// application idempotent. A concurrent tag fails the plan. Each
    /// returned piece lies within one entry, so it is always a valid
    /// argument to [`apply_update`](Self::apply_update).
    pub fn plan_apply(
        &self,
        range: &KeyRange,
        version: Version,
        history: &BranchHistory,
    ) -> Result<Vec<KeyRange>, VersionMapError> {
        if !self.region.contains_range(range) {
            return Err(VersionMapError::OutsideRegion {
                range: range.clone(),
                region: self.region.clone(),
            });
        }
        let mut pieces = Vec::new();
        for entry in &self.entries {
            let Some(piece) = entry.range.intersection(range) else {
                continue;
            };
            match history.compare(entry.version, version) {
                CausalOrder::Before => pieces.push(piece),
                CausalOrder::Equal | CausalOrder::After => {}
                CausalOrder::Concurrent => {
                    return Err(VersionMapError::Concurrent {
                        range: piece,
                        mine: entry.version,
                        theirs: version,
                    });
                }
            }
        }
        Ok(pieces)
    }

    /// Returns an equivalent map with adjacent equal-version entries merged.
    pub fn coalesced(&self) -> VersionMap {
        let mut entries: Vec<VersionEntry> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entries.last_mut() {
                Some(prev) if prev.version == entry.version => {
                    prev.range = KeyRange::new(
                        prev.range.start().clone(),
                        entry.range.end().cloned(),
                    );
                }
                _ => entries.push(entry.clone()),
            }
        }
        VersionMap {
            region: self.region.clone(),
            entries,
        }
    }
}

impl Display for VersionMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", entry.range, entry.version)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::BranchRecord;
    use ebb_types::{BranchId, Timestamp};
    use proptest::prelude::*;

    fn a() -> BranchId {
        BranchId::from_u128(0xA)
    }

    fn va(ts: u64) -> Version {
        Version::new(a(), Timestamp::new(ts))
    }

    fn history() -> BranchHistory {
        BranchHistory::new()
            .with_branch(a(), BranchRecord::root(KeyRange::full(), Timestamp::ZERO))
            .unwrap()
    }

    fn backfiller_map() -> VersionMap {
        VersionMap::from_entries(
            KeyRange::full(),
            vec![
                VersionEntry::new(KeyRange::new(ebb_types::Key::min(), Some(Key::from_u64(100))), va(50)),
                VersionEntry::new(KeyRange::from_start(100u64), va(30)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn from_entries_rejects_gap() {
        let err = VersionMap::from_entries(
            KeyRange::bounded(0u64, 100u64),
            vec![
                VersionEntry::new(KeyRange::bounded(0u64, 40u64), va(1)),
                VersionEntry::new(KeyRange::bounded(50u64, 100u64), va(1)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, VersionMapError::InvalidPartition { .. }));
    }

    #[test]
    fn from_entries_rejects_overlap() {
        let err = VersionMap::from_entries(
            KeyRange::bounded(0u64, 100u64),
            vec![
                VersionEntry::new(KeyRange::bounded(0u64, 60u64), va(1)),
                VersionEntry::new(KeyRange::bounded(50u64, 100u64), va(1)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, VersionMapError::InvalidPartition { .. }));
    }

    #[test]
    fn from_entries_sorts_input() {
        let map = VersionMap::from_entries(
            KeyRange::bounded(0u64, 100u64),
            vec![
                VersionEntry::new(KeyRange::bounded(50u64, 100u64), va(2)),
                VersionEntry::new(KeyRange::bounded(0u64, 50u64), va(1)),
            ],
        )
        .unwrap();
        assert_eq!(map.version_at(&Key::from_u64(10)), Some(va(1)));
        assert_eq!(map.version_at(&Key::from_u64(60)), Some(va(2)));
    }

    #[test]
    fn deserialization_validates_partition() {
        let raw = serde_json::json!({
            "region": KeyRange::bounded(0u64, 10u64),
            "entries": [{ "range": KeyRange::bounded(0u64, 5u64), "version": va(1) }],
        });
        let result: Result<VersionMap, _> = serde_json::from_value(raw);
        assert!(result.is_err());
    }

    #[test]
    fn diff_reports_i_am_behind_for_empty_replica() {
        let mine = VersionMap::new(KeyRange::full(), va(0));
        let theirs = backfiller_map();
        let diff = mine.diff(&theirs, &history()).unwrap();
        assert_eq!(
            diff,
            vec![
                (KeyRange::new(Key::min(), Some(Key::from_u64(100))), DiffKind::IAmBehind),
                (KeyRange::from_start(100u64), DiffKind::IAmBehind),
            ]
        );
    }

    #[test]
    fn diff_from_other_side_is_mirrored() {
        let mine = backfiller_map();
        let theirs = VersionMap::new(KeyRange::full(), va(30));
        let diff = mine.diff(&theirs, &history()).unwrap();
        assert_eq!(diff[0].1, DiffKind::TheyAreBehind);
        assert_eq!(diff[1].1, DiffKind::Equal);
    }

    #[test]
    fn diff_fails_on_concurrent_versions() {
        let b = BranchId::from_u128(0xB);
        let h = history()
            .with_branch(b, BranchRecord::root(KeyRange::full(), Timestamp::ZERO))
            .unwrap();
        let mine = VersionMap::new(KeyRange::full(), va(5));
        let theirs = VersionMap::new(KeyRange::full(), Version::new(b, Timestamp::new(5)));
        assert!(matches!(
            mine.diff(&theirs, &h),
            Err(VersionMapError::Concurrent { .. })
        ));
    }

    #[test]
    fn restrict_scopes_entries() {
        let map = backfiller_map();
        let restricted = map.restrict(&KeyRange::bounded(50u64, 150u64));
        assert_eq!(restricted.region(), &KeyRange::bounded(50u64, 150u64));
        assert_eq!(
            restricted.entries(),
            &[
                VersionEntry::new(KeyRange::bounded(50u64, 100u64), va(50)),
                VersionEntry::new(KeyRange::bounded(100u64, 150u64), va(30)),
            ]
        );
        assert!(restricted.check_partition().is_ok());
    }

    #[test]
    fn restrict_to_disjoint_range_is_empty() {
        let map = VersionMap::new(KeyRange::bounded(0u64, 10u64), va(1));
        let restricted = map.restrict(&KeyRange::bounded(20u64, 30u64));
        assert!(restricted.is_empty());
        assert!(restricted.check_partition().is_ok());
    }

    #[test]
    fn apply_update_splits_single_entry() {
        let mut map = VersionMap::new(KeyRange::bounded(0u64, 100u64), va(1));
        map.apply_update(&KeyRange::bounded(20u64, 30u64), va(2)).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.version_at(&Key::from_u64(19)), Some(va(1)));
        assert_eq!(map.version_at(&Key::from_u64(20)), Some(va(2)));
        assert_eq!(map.version_at(&Key::from_u64(30)), Some(va(1)));
    }

    #[test]
    fn apply_update_replaces_exact_union() {
        let mut map = backfiller_map();
        map.apply_update(&KeyRange::full(), va(60)).unwrap();
        assert_eq!(map, VersionMap::new(KeyRange::full(), va(60)));
    }

    #[test]
    fn apply_update_rejects_straddling_range() {
        let mut map = backfiller_map();
        let before = map.clone();
        let err = map
            .apply_update(&KeyRange::bounded(50u64, 150u64), va(60))
            .unwrap_err();
        assert!(matches!(err, VersionMapError::MisalignedUpdate { .. }));
        assert_eq!(map, before);
    }

    #[test]
    fn apply_update_rejects_outside_region() {
        let mut map = VersionMap::new(KeyRange::bounded(0u64, 10u64), va(1));
        assert!(matches!(
            map.apply_update(&KeyRange::bounded(5u64, 20u64), va(2)),
            Err(VersionMapError::OutsideRegion { .. })
        ));
    }

    #[test]
    fn plan_apply_skips_stale_pieces() {
        let map = backfiller_map();
        let pieces = map.plan_apply(&KeyRange::full(), va(40), &history()).unwrap();
        assert_eq!(pieces, vec![KeyRange::from_start(100u64)]);
    }

    #[test]
    fn covers_requires_every_overlapping_entry() {
        let map = backfiller_map();
        let h = history();
        assert!(map.covers(&KeyRange::bounded(0u64, 100u64), va(50), &h));
        assert!(!map.covers(&KeyRange::full(), va(50), &h));
        assert!(map.covers(&KeyRange::full(), va(30), &h));
    }

    #[test]
    fn coalesced_merges_equal_neighbours() {
        let mut map = VersionMap::new(KeyRange::bounded(0u64, 100u64), va(1));
        map.apply_update(&KeyRange::bounded(20u64, 30u64), va(1)).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.coalesced().len(), 1);
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    fn arb_update() -> impl Strategy<Value = (u64, u64, u64)> {
        (0u64..200, 1u64..50, 0u64..100).prop_map(|(start, len, ts)| (start, start + len, ts))
    }

    proptest! {
        #[test]
        fn partition_holds_after_any_update_sequence(updates in proptest::collection::vec(arb_update(), 1..30)) {
            let mut map = VersionMap::new(KeyRange::from_start(0u64), va(0));
            for (start, end, ts) in updates {
                let range = KeyRange::bounded(start, end);
                // Misaligned updates are rejected and must leave the map intact.
                let _ = map.apply_update(&range, va(ts));
                prop_assert!(map.check_partition().is_ok());
            }
        }

        #[test]
        fn planned_apply_is_idempotent(updates in proptest::collection::vec(arb_update(), 1..20)) {
            let h = history();
            let mut once = VersionMap::new(KeyRange::from_start(0u64), va(0));
            let mut twice = once.clone();
            for (start, end, ts) in updates {
                let range = KeyRange::bounded(start, end);
                for piece in once.plan_apply(&range, va(ts), &h).unwrap() {
                    once.apply_update(&piece, va(ts)).unwrap();
                }
                for _ in 0..2 {
                    for piece in twice.plan_apply(&range, va(ts), &h).unwrap() {
                        twice.apply_update(&piece, va(ts)).unwrap();
                    }
                }
                prop_assert_eq!(&once, &twice);
            }
        }
    }
}
