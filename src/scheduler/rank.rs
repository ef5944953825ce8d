//! Affinity-aware ordering of candidate slots.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use crate::queue_item::{DesiredLabel, LabelComparator, QueueItem, StickyStrategy};
use crate::slot::Slot;
use crate::worker::LabelValue;

/// Reorder candidate slots for an item carrying affinity. Sticky
/// filtering/ordering applies first; the surviving list is then
/// stable-sorted by descending label score, so ties keep their ring order.
pub(crate) fn ranked_slots(
    qi: &QueueItem,
    labels: &[DesiredLabel],
    slots: &[Arc<Slot>],
) -> Vec<Arc<Slot>> {
    let mut candidates: Vec<Arc<Slot>> = match (qi.sticky, qi.desired_worker_id) {
        (Some(StickyStrategy::Hard), Some(desired)) => slots
            .iter()
            .filter(|s| s.worker_id() == desired)
            .cloned()
            .collect(),
        (Some(StickyStrategy::Soft), Some(desired)) => {
            let mut preferred: Vec<Arc<Slot>> = Vec::new();
            let mut rest: Vec<Arc<Slot>> = Vec::new();
            for slot in slots {
                if slot.worker_id() == desired {
                    preferred.push(slot.clone());
                } else {
                    rest.push(slot.clone());
                }
            }
            preferred.extend(rest);
            preferred
        }
        // sticky without a desired worker keeps the shuffle as-is
        _ => slots.to_vec(),
    };

    if !labels.is_empty() {
        let mut scored: Vec<(i64, Arc<Slot>)> = Vec::with_capacity(candidates.len());
        for slot in candidates.drain(..) {
            if let Some(score) = slot_score(labels, slot.worker_labels()) {
                scored.push((score, slot));
            }
        }
        scored.sort_by_key(|(score, _)| Reverse(*score));
        candidates = scored.into_iter().map(|(_, slot)| slot).collect();
    }

    candidates
}

/// Score a worker's labels against the desired labels. `None` means a
/// required label cannot be satisfied and the slot is filtered out.
fn slot_score(labels: &[DesiredLabel], worker_labels: &HashMap<String, LabelValue>) -> Option<i64> {
    let mut total: i64 = 0;

    for desired in labels {
        let satisfied = worker_labels
            .get(&desired.key)
            .map_or(false, |value| label_satisfied(desired, value));

        if satisfied {
            total += desired.weight as i64;
        } else if desired.required {
            return None;
        }
    }

    Some(total)
}

fn label_satisfied(desired: &DesiredLabel, value: &LabelValue) -> bool {
    match desired.comparator {
        LabelComparator::Equal => values_equal(desired, value),
        LabelComparator::NotEqual => !values_equal(desired, value),
        LabelComparator::GreaterThan => int_cmp(desired, value).map_or(false, |o| o.is_gt()),
        LabelComparator::GreaterThanOrEqual => int_cmp(desired, value).map_or(false, |o| o.is_ge()),
        LabelComparator::LessThan => int_cmp(desired, value).map_or(false, |o| o.is_lt()),
        LabelComparator::LessThanOrEqual => int_cmp(desired, value).map_or(false, |o| o.is_le()),
    }
}

fn values_equal(desired: &DesiredLabel, value: &LabelValue) -> bool {
    match (value, &desired.str_value, desired.int_value) {
        (LabelValue::Str(have), Some(want), _) => have == want,
        (LabelValue::Int(have), _, Some(want)) => *have == want,
        _ => false,
    }
}

/// Ordering comparators only apply when both sides are integers.
fn int_cmp(desired: &DesiredLabel, value: &LabelValue) -> Option<std::cmp::Ordering> {
    Some(value.as_int()?.cmp(&desired.int_value?))
}
