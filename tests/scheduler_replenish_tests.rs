//! Replenish-path tests: inventory rebuild, unacked subtraction, expiry
//! sweep, and failure handling.


use gantry::settings::SchedulerConfig;

use test_helpers::*;

#[gantry::test]
async fn replenish_builds_inventory_from_capacity() {
    let h = build_harness();
    h.add_worker(&["act"], 3);
    h.add_worker(&["act"], 2);
    h.scheduler.replenish(true).await.expect("replenish");

    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 5);
    assert_eq!(total, 5);
}

#[gantry::test]
async fn replenish_is_idempotent_when_nothing_changed() {
    let h = build_harness();
    h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");
    let before = h.scheduler.slot_counts("act").await.expect("action");

    h.scheduler.replenish(true).await.expect("replenish");
    let after = h.scheduler.slot_counts("act").await.expect("action");

    assert_eq!(before, after);
}

#[gantry::test]
async fn replenish_subtracts_unacked_slots() {
    let h = build_harness();
    h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");

    let results = assign_plain(&h, make_items("act", 1)).await;
    let ack_id = results.assigned[0].ack_id;
    assert_eq!(h.scheduler.unacked_len(), 1);

    // the unacked reservation still counts against the worker: two fresh
    // slots plus the extended unacked one
    h.scheduler.replenish(true).await.expect("replenish");
    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 2);
    assert_eq!(total, 3);

    // once acked, the next replenish hands out full capacity again
    h.scheduler.ack(&[ack_id]);
    h.scheduler.replenish(true).await.expect("replenish");
    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 3);
    assert_eq!(total, 3);
}

#[gantry::test]
async fn zero_capacity_still_extends_unacked_slots() {
    let h = build_harness();
    let w = h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");

    let results = assign_plain(&h, make_items("act", 1)).await;
    assert_eq!(results.assigned.len(), 1);

    h.repo.set_available_slots(w, 0);
    h.scheduler.replenish(true).await.expect("replenish");

    // no fresh slots, but the in-flight reservation stays visible
    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 0);
    assert_eq!(total, 1);
}

#[gantry::test]
async fn capacity_below_unacked_never_goes_negative() {
    let h = build_harness();
    let w = h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");

    let results = assign_plain(&h, make_items("act", 2)).await;
    assert_eq!(results.assigned.len(), 2);

    h.repo.set_available_slots(w, 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 0);
    assert_eq!(total, 2);
}

#[gantry::test]
async fn expired_slots_are_swept_and_empty_actions_dropped() {
    let cfg = SchedulerConfig {
        slot_ttl_ms: -1, // every slot is born expired
        ..test_config()
    };
    let h = build_harness_with_config(cfg);
    h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");

    // the sweep at the end of the same pass removes everything
    assert!(h.scheduler.slot_counts("act").await.is_none());
}

#[gantry::test]
async fn removed_worker_disappears_on_next_replenish() {
    let h = build_harness();
    let w = h.add_worker(&["act"], 2);
    h.scheduler.replenish(true).await.expect("replenish");
    assert!(h.scheduler.slot_counts("act").await.is_some());

    h.repo.remove_worker(w);
    h.scheduler.set_workers(Vec::new());
    h.scheduler.replenish(true).await.expect("replenish");

    // no capability rows, so the ring is never rebuilt; the stale slots
    // age out with their ttl rather than being torn down immediately
    let (_, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(total, 2);
}

#[gantry::test]
async fn best_effort_replenish_skips_stable_actions() {
    let h = build_harness();
    let w = h.add_worker(&["act"], 2);
    h.scheduler.replenish(true).await.expect("replenish");

    // capacity doubled, but the ring is healthy: untouched without `must`
    h.repo.set_available_slots(w, 4);
    h.scheduler.replenish(false).await.expect("replenish");
    let (_, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(total, 2);

    h.scheduler.replenish(true).await.expect("replenish");
    let (_, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(total, 4);
}

#[gantry::test]
async fn more_workers_triggers_best_effort_replenish() {
    let h = build_harness();
    h.add_worker(&["act"], 2);
    h.scheduler.replenish(true).await.expect("replenish");

    h.add_worker(&["act"], 2);
    h.scheduler.replenish(false).await.expect("replenish");

    let (_, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(total, 4);
}

#[gantry::test]
async fn half_consumed_ring_triggers_best_effort_replenish() {
    let h = build_harness();
    h.add_worker(&["act"], 2);
    h.scheduler.replenish(true).await.expect("replenish");

    let results = assign_plain(&h, make_items("act", 1)).await;
    assert_eq!(results.assigned.len(), 1);
    // flush succeeded: capacity drops to 1 in the repository
    h.scheduler.ack(&[results.assigned[0].ack_id]);
    let w = {
        // the remaining capacity for the worker is now 1
        results.assigned[0].worker_id
    };
    h.repo.set_available_slots(w, 1);

    // one of two slots consumed hits the half-used threshold
    h.scheduler.replenish(false).await.expect("replenish");
    let (active, total) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 1);
    assert_eq!(total, 1);
}

#[gantry::test]
async fn query_failure_leaves_inventory_intact() {
    let h = build_harness();
    h.add_worker(&["act"], 3);
    h.scheduler.replenish(true).await.expect("replenish");

    h.repo.fail_next_query();
    let err = h.scheduler.replenish(true).await;
    assert!(err.is_err());

    // the previous inventory is still there for the assigner
    let (active, _) = h.scheduler.slot_counts("act").await.expect("action");
    assert_eq!(active, 3);
    let results = assign_plain(&h, make_items("act", 1)).await;
    assert_eq!(results.assigned.len(), 1);
}

#[gantry::test]
async fn empty_worker_snapshot_is_a_no_op() {
    let h = build_harness();
    h.scheduler.replenish(true).await.expect("replenish");
    assert!(h.scheduler.slot_counts("act").await.is_none());
}

#[gantry::test]
async fn background_loop_replenishes_until_shutdown() {
    let cfg = SchedulerConfig {
        replenish_interval_ms: 20,
        ..test_config()
    };
    let h = build_harness_with_config(cfg);
    h.add_worker(&["act"], 2);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let handle = h.scheduler.start(shutdown_tx.subscribe());

    with_timeout!(2_000, {
        loop {
            if h.scheduler.slot_counts("act").await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    });

    shutdown_tx.send(()).expect("send shutdown");
    with_timeout!(2_000, {
        handle.await.expect("replenish loop join");
    });
}
