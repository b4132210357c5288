//! Scenario: partition rebalancing on instance join/leave.
//!
//! # Invariants under test
//! - With one instance, every partition belongs to it.
//! - When a second instance joins, ownership follows the modulo formula:
//!   both instances own a non-empty share, the shares partition the set,
//!   and the computation is identical across repeated calls.
//! - When an instance goes stale, its partitions fall back to the
//!   survivors without explicit handoff.

use tokio_util::sync::CancellationToken;
use wh_schemas::Coordinator;
use wh_testkit::fixtures;
use wh_testkit::MemoryCoordinator;

#[tokio::test]
async fn partitions_split_when_a_second_instance_joins() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance_a = fixtures::instance("orders");
    let instance_b = fixtures::instance("orders");

    // One instance: all ten partitions map to the only slot.
    coordinator
        .process_work_batch(fixtures::request(&instance_a), &cancel)
        .await?;
    let owners = coordinator.partition_owners(10);
    assert!(owners.values().all(|&slot| slot == 0));

    // Second instance joins; after both have called, each owns the share
    // the modulo formula assigns.
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance_b), &cancel)
        .await?;
    assert_eq!(batch.active_instances, 2);
    coordinator
        .process_work_batch(fixtures::request(&instance_a), &cancel)
        .await?;

    let owners = coordinator.partition_owners(10);
    let slot0 = owners.values().filter(|&&s| s == 0).count();
    let slot1 = owners.values().filter(|&&s| s == 1).count();
    assert_eq!(slot0 + slot1, 10, "the shares partition the set");
    assert!(slot0 > 0 && slot1 > 0, "both instances own partitions");

    // Partition determinism: same active set, same answer.
    assert_eq!(owners, coordinator.partition_owners(10));
    Ok(())
}

#[tokio::test]
async fn stale_instance_returns_its_partitions() -> anyhow::Result<()> {
    let coordinator = MemoryCoordinator::new();
    let cancel = CancellationToken::new();
    let instance_a = fixtures::instance("orders");
    let instance_b = fixtures::instance("orders");

    coordinator
        .process_work_batch(fixtures::request(&instance_a), &cancel)
        .await?;
    coordinator
        .process_work_batch(fixtures::request(&instance_b), &cancel)
        .await?;
    assert_eq!(coordinator.active_instances().len(), 2);

    // A stops heart-beating past the stale threshold (11 s in tests); B's
    // next call shrinks the active set and absorbs every partition.
    coordinator.advance(12);
    let batch = coordinator
        .process_work_batch(fixtures::request(&instance_b), &cancel)
        .await?;

    assert_eq!(batch.active_instances, 1);
    assert_eq!(coordinator.active_instances(), vec![instance_b.instance_id]);
    let owners = coordinator.partition_owners(10);
    assert!(owners.values().all(|&slot| slot == 0));
    Ok(())
}
