//! Affinity tests: sticky workers and desired labels.


use std::collections::HashMap;

use uuid::Uuid;

use gantry::queue_item::{DesiredLabel, LabelComparator, StickyStrategy};
use gantry::worker::LabelValue;

use test_helpers::*;

fn labels(pairs: &[(&str, LabelValue)]) -> HashMap<String, LabelValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[gantry::test]
async fn hard_sticky_filters_to_the_desired_worker() {
    let h = build_harness();
    h.add_worker(&["act"], 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Hard);
    items[0].desired_worker_id = Some(Uuid::new_v4()); // not a known worker

    let results = assign_plain(&h, items).await;
    assert_eq!(results.unassigned.len(), 1);
}

#[gantry::test]
async fn soft_sticky_falls_back_to_any_worker() {
    let h = build_harness();
    let w1 = h.add_worker(&["act"], 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Soft);
    items[0].desired_worker_id = Some(Uuid::new_v4());

    let results = assign_plain(&h, items).await;
    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, w1);
}

#[gantry::test]
async fn hard_sticky_hits_the_desired_worker() {
    let h = build_harness();
    h.add_worker(&["act"], 4);
    let desired = h.add_worker(&["act"], 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Hard);
    items[0].desired_worker_id = Some(desired);

    let results = assign_plain(&h, items).await;
    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, desired);
}

#[gantry::test]
async fn soft_sticky_prefers_the_desired_worker() {
    let h = build_harness();
    h.add_worker(&["act"], 8);
    let desired = h.add_worker(&["act"], 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Soft);
    items[0].desired_worker_id = Some(desired);

    let results = assign_plain(&h, items).await;
    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, desired);
}

#[gantry::test]
async fn sticky_without_desired_worker_assigns_normally() {
    let h = build_harness();
    h.add_worker(&["act"], 1);
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Hard);

    let results = assign_plain(&h, items).await;
    assert_eq!(results.assigned.len(), 1);
}

#[gantry::test]
async fn required_label_filters_workers() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 3, labels(&[("region", LabelValue::from("us"))]));
    let eu = h.add_worker_with_labels(&["act"], 1, labels(&[("region", LabelValue::from("eu"))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel::equals_str("region", "eu").required()];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, eu);
}

#[gantry::test]
async fn required_label_with_no_satisfying_worker_unassigns() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 3, labels(&[("region", LabelValue::from("us"))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel::equals_str("region", "eu").required()];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.unassigned.len(), 1);
}

#[gantry::test]
async fn weighted_label_prefers_higher_score() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 4, HashMap::new());
    let fast = h.add_worker_with_labels(&["act"], 1, labels(&[("gpu", LabelValue::from("a100"))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel::equals_str("gpu", "a100").weighted(100)];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, fast);
}

#[gantry::test]
async fn unweighted_miss_still_assigns_somewhere() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 1, HashMap::new());
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel::equals_str("gpu", "a100").weighted(100)];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    // the label is a preference, not a requirement
    assert_eq!(results.assigned.len(), 1);
}

#[gantry::test]
async fn integer_comparators_rank_workers() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 2, labels(&[("memory_gb", LabelValue::from(8i64))]));
    let big = h.add_worker_with_labels(&["act"], 1, labels(&[("memory_gb", LabelValue::from(64i64))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel {
        key: "memory_gb".to_string(),
        str_value: None,
        int_value: Some(32),
        required: true,
        weight: 1,
        comparator: LabelComparator::GreaterThanOrEqual,
    }];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, big);
}

#[gantry::test]
async fn sticky_and_labels_compose() {
    let h = build_harness();
    // the desired worker fails the required label, so hard sticky plus the
    // label filter leaves nothing
    let desired = h.add_worker_with_labels(&["act"], 2, labels(&[("region", LabelValue::from("us"))]));
    h.add_worker_with_labels(&["act"], 2, labels(&[("region", LabelValue::from("eu"))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let mut items = make_items("act", 1);
    items[0].sticky = Some(StickyStrategy::Hard);
    items[0].desired_worker_id = Some(desired);
    let step_labels = HashMap::from([(
        items[0].step_id,
        vec![DesiredLabel::equals_str("region", "eu").required()],
    )]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.unassigned.len(), 1);
}

#[gantry::test]
async fn not_equal_comparator_matches_other_values() {
    let h = build_harness();
    h.add_worker_with_labels(&["act"], 1, labels(&[("region", LabelValue::from("us"))]));
    let other = h.add_worker_with_labels(&["act"], 1, labels(&[("region", LabelValue::from("eu"))]));
    h.scheduler.replenish(true).await.expect("replenish");

    let items = make_items("act", 1);
    let desired = vec![DesiredLabel {
        key: "region".to_string(),
        str_value: Some("us".to_string()),
        int_value: None,
        required: true,
        weight: 1,
        comparator: LabelComparator::NotEqual,
    }];
    let step_labels = HashMap::from([(items[0].step_id, desired)]);

    let stream = h.scheduler.try_assign(items, step_labels, HashMap::new());
    let results = collect_results(stream).await;

    assert_eq!(results.assigned.len(), 1);
    assert_eq!(results.assigned[0].worker_id, other);
}
