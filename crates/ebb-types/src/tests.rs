//! Unit tests for ebb-types

use crate::{Address, BranchId, Key, KeyRange, MailboxId, NodeId, SessionId, ShardId, Timestamp};

// ============================================================================
// ID Type Tests
// ============================================================================

#[test]
fn node_id_from_u64_roundtrip() {
    let id = NodeId::new(42);
    let raw: u64 = id.into();
    assert_eq!(raw, 42);
}

#[test]
fn generated_ids_are_distinct() {
    assert_ne!(BranchId::generate(), BranchId::generate());
    assert_ne!(SessionId::generate(), SessionId::generate());
}

#[test]
fn branch_id_from_u128_is_deterministic() {
    assert_eq!(BranchId::from_u128(7), BranchId::from_u128(7));
    assert!(BranchId::from_u128(1) < BranchId::from_u128(2));
}

#[test]
fn address_display() {
    let addr = Address::new(NodeId::new(1), ShardId::new(2), MailboxId::new(3));
    assert_eq!(addr.to_string(), "n1/s2/mb3");
}

#[test]
fn timestamp_next_saturates() {
    assert_eq!(Timestamp::new(4).next(), Timestamp::new(5));
    assert_eq!(Timestamp::new(u64::MAX).next(), Timestamp::new(u64::MAX));
}

// ============================================================================
// KeyRange Tests
// ============================================================================

#[test]
fn u64_keys_preserve_numeric_order() {
    assert!(Key::from_u64(9) < Key::from_u64(10));
    assert!(Key::from_u64(255) < Key::from_u64(256));
    assert!(Key::min() < Key::from_u64(0));
}

#[test]
fn bounded_range_contains_start_not_end() {
    let range = KeyRange::bounded(0u64, 100u64);
    assert!(range.contains_key(&Key::from_u64(0)));
    assert!(range.contains_key(&Key::from_u64(99)));
    assert!(!range.contains_key(&Key::from_u64(100)));
}

#[test]
fn unbounded_range_contains_everything_above_start() {
    let range = KeyRange::from_start(100u64);
    assert!(range.contains_key(&Key::from_u64(u64::MAX)));
    assert!(!range.contains_key(&Key::from_u64(99)));
    assert!(range.is_unbounded());
}

#[test]
fn empty_range_detection() {
    assert!(KeyRange::bounded(5u64, 5u64).is_empty());
    assert!(KeyRange::bounded(6u64, 5u64).is_empty());
    assert!(!KeyRange::bounded(5u64, 6u64).is_empty());
    assert!(!KeyRange::full().is_empty());
}

#[test]
fn intersection_of_overlapping_ranges() {
    let a = KeyRange::bounded(0u64, 100u64);
    let b = KeyRange::from_start(50u64);
    assert_eq!(a.intersection(&b), Some(KeyRange::bounded(50u64, 100u64)));
    assert_eq!(b.intersection(&a), Some(KeyRange::bounded(50u64, 100u64)));
}

#[test]
fn intersection_of_adjacent_ranges_is_none() {
    let a = KeyRange::bounded(0u64, 100u64);
    let b = KeyRange::from_start(100u64);
    assert_eq!(a.intersection(&b), None);
    assert!(!a.overlaps(&b));
}

#[test]
fn contains_range_respects_unbounded_end() {
    let full = KeyRange::full();
    let tail = KeyRange::from_start(10u64);
    let head = KeyRange::bounded(0u64, 10u64);
    assert!(full.contains_range(&tail));
    assert!(full.contains_range(&head));
    assert!(!head.contains_range(&tail));
    assert!(!tail.contains_range(&full));
}

#[test]
fn split_at_interior_key() {
    let range = KeyRange::bounded(0u64, 100u64);
    let (left, right) = range.split_at(&Key::from_u64(40));
    assert_eq!(left, Some(KeyRange::bounded(0u64, 40u64)));
    assert_eq!(right, Some(KeyRange::bounded(40u64, 100u64)));
}

#[test]
fn split_at_boundary_yields_one_side() {
    let range = KeyRange::bounded(0u64, 100u64);
    let (left, right) = range.split_at(&Key::from_u64(0));
    assert_eq!(left, None);
    assert_eq!(right, Some(range.clone()));
}

#[test]
fn key_range_display() {
    assert_eq!(KeyRange::bounded(0u64, 100u64).to_string(), "[0, 100)");
    assert_eq!(KeyRange::from_start(100u64).to_string(), "[100, ∞)");
}

#[test]
fn key_range_serde_roundtrip() {
    let range = KeyRange::bounded(3u64, 9u64);
    let json = serde_json::to_string(&range).unwrap();
    let back: KeyRange = serde_json::from_str(&json).unwrap();
    assert_eq!(back, range);
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn intersection_is_commutative(a in 0u64..200, b in 0u64..200, c in 0u64..200, d in 0u64..200) {
            let x = KeyRange::bounded(a, b);
            let y = KeyRange::bounded(c, d);
            prop_assert_eq!(x.intersection(&y), y.intersection(&x));
        }

        #[test]
        fn intersection_is_contained_in_both(a in 0u64..200, b in 0u64..200, c in 0u64..200) {
            let x = KeyRange::bounded(a, b);
            let y = KeyRange::from_start(c);
            if let Some(i) = x.intersection(&y) {
                prop_assert!(x.contains_range(&i));
                prop_assert!(y.contains_range(&i));
            }
        }

        #[test]
        fn key_order_matches_integer_order(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Key::from_u64(a).cmp(&Key::from_u64(b)), a.cmp(&b));
        }
    }
}
