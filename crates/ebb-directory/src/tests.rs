//! Unit tests for ebb-directory

use ebb_backfill::{BackfillerBusinessCard, ReplicaBusinessCard};
use ebb_types::{Address, BranchId, KeyRange, MailboxId, NodeId, ShardId};

use crate::{Directory, DirectoryError};

fn card(node: u64, branch: u128) -> ReplicaBusinessCard {
    let node = NodeId::new(node);
    let addr = |m| Address::new(node, ShardId::new(0), MailboxId::new(m));
    ReplicaBusinessCard {
        synchronize_addr: addr(2),
        live_write_addr: addr(3),
        branch_id: BranchId::from_u128(branch),
        backfiller: BackfillerBusinessCard {
            backfill_addr: addr(0),
            cancel_addr: addr(1),
        },
    }
}

fn low() -> KeyRange {
    KeyRange::bounded(0u64, 100u64)
}

fn high() -> KeyRange {
    KeyRange::from_start(100u64)
}

// ============================================================================
// Publish / Retract
// ============================================================================

#[test]
fn publish_then_get() {
    let mut directory = Directory::new();
    assert_eq!(directory.publish(NodeId::new(1), low(), card(1, 1)), Ok(None));
    assert_eq!(directory.get(NodeId::new(1), &low()), Some(&card(1, 1)));
    assert_eq!(directory.get(NodeId::new(1), &high()), None);
    assert_eq!(directory.len(), 1);
}

#[test]
fn republish_replaces_card() {
    let mut directory = Directory::new();
    directory.publish(NodeId::new(1), low(), card(1, 1)).unwrap();
    let previous = directory.publish(NodeId::new(1), low(), card(1, 2)).unwrap();

    assert_eq!(previous, Some(card(1, 1)));
    assert_eq!(directory.len(), 1);
    assert_eq!(directory.get(NodeId::new(1), &low()), Some(&card(1, 2)));
}

#[test]
fn card_for_another_node_is_rejected() {
    let mut directory = Directory::new();
    let result = directory.publish(NodeId::new(1), low(), card(2, 1));
    assert_eq!(
        result,
        Err(DirectoryError::NodeMismatch {
            node: NodeId::new(1),
            card_node: NodeId::new(2),
        })
    );
    assert!(directory.is_empty());
}

#[test]
fn empty_region_is_rejected() {
    let mut directory = Directory::new();
    let result = directory.publish(NodeId::new(1), KeyRange::bounded(5u64, 5u64), card(1, 1));
    assert!(matches!(result, Err(DirectoryError::EmptyRegion { .. })));
}

#[test]
fn retract_removes_exact_key_only() {
    let mut directory = Directory::new()
        .with_card(NodeId::new(1), low(), card(1, 1))
        .unwrap()
        .with_card(NodeId::new(1), high(), card(1, 1))
        .unwrap();

    assert_eq!(directory.retract(NodeId::new(1), &low()), Ok(card(1, 1)));
    assert_eq!(directory.len(), 1);
    assert!(matches!(
        directory.retract(NodeId::new(1), &low()),
        Err(DirectoryError::NotPublished { .. })
    ));
}

#[test]
fn retract_node_removes_all_its_cards() {
    let mut directory = Directory::new()
        .with_card(NodeId::new(1), low(), card(1, 1))
        .unwrap()
        .with_card(NodeId::new(1), high(), card(1, 1))
        .unwrap()
        .with_card(NodeId::new(2), low(), card(2, 1))
        .unwrap();

    assert_eq!(directory.retract_node(NodeId::new(1)), 2);
    assert_eq!(directory.len(), 1);
    assert_eq!(directory.retract_node(NodeId::new(1)), 0);
}

// ============================================================================
// Lookup
// ============================================================================

#[test]
fn lookup_finds_overlapping_regions() {
    let directory = Directory::new()
        .with_card(NodeId::new(1), low(), card(1, 1))
        .unwrap()
        .with_card(NodeId::new(2), high(), card(2, 1))
        .unwrap();

    let found = directory.lookup(&KeyRange::bounded(50u64, 150u64));
    assert_eq!(found.len(), 2);

    let found = directory.lookup(&KeyRange::bounded(10u64, 20u64));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].node, NodeId::new(1));
}

#[test]
fn backfiller_must_contain_whole_region() {
    let directory = Directory::new()
        .with_card(NodeId::new(1), low(), card(1, 1))
        .unwrap()
        .with_card(NodeId::new(2), KeyRange::full(), card(2, 1))
        .unwrap();

    let entry = directory
        .backfiller_for(&KeyRange::bounded(50u64, 150u64), NodeId::new(3))
        .unwrap();
    assert_eq!(entry.node, NodeId::new(2));
    assert_eq!(entry.card.backfiller, card(2, 1).backfiller);
}

#[test]
fn backfiller_lookup_skips_requesting_node() {
    let directory = Directory::new()
        .with_card(NodeId::new(1), KeyRange::full(), card(1, 1))
        .unwrap();

    let result = directory.backfiller_for(&low(), NodeId::new(1));
    assert!(matches!(result, Err(DirectoryError::NoBackfiller { .. })));
    assert!(directory.backfiller_for(&low(), NodeId::new(2)).is_ok());
}

#[test]
fn directory_serializes() {
    let directory = Directory::new()
        .with_card(NodeId::new(1), low(), card(1, 1))
        .unwrap();
    let json = serde_json::to_string(&directory).unwrap();
    let decoded: Directory = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, directory);
}
