//! Batched assignment of queue items to worker slots.
//!
//! Queue items are partitioned by action and each partition is processed
//! concurrently. Within a partition, items past their scheduling deadline
//! are split off first; the rest are assigned in sub-batches, each item
//! probing the action's slot ring concurrently from a rotating offset.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::queue_item::{DesiredLabel, QueueItem};
use crate::rate_limiter::{RateLimitLease, RateLimitOutcome};
use crate::slot::{now_epoch_ms, Slot};

use super::{rank, Scheduler};

/// A queue item bound to a worker slot, awaiting durable flush.
#[derive(Debug)]
pub struct AssignedQueueItem {
    pub ack_id: u64,
    pub worker_id: Uuid,
    pub queue_item: QueueItem,
    /// Set by the flush layer after a successful flush; never by the core.
    pub dispatcher_id: Option<Uuid>,
}

/// A queue item rejected by a rate limit, with the key that ran dry.
#[derive(Debug)]
pub struct RateLimitedItem {
    pub queue_item: QueueItem,
    pub exceeded_key: String,
    pub exceeded_units: i64,
}

/// One streamed batch of assignment outcomes. `assigned` arrives in
/// sub-batch sized chunks as they are computed; the trailing buckets are
/// emitted once per action partition at completion.
#[derive(Debug, Default)]
pub struct AssignResults {
    pub assigned: Vec<AssignedQueueItem>,
    pub unassigned: Vec<QueueItem>,
    pub scheduling_timed_out: Vec<QueueItem>,
    pub rate_limited: Vec<RateLimitedItem>,
}

enum ItemOutcome {
    Assigned {
        ack_id: u64,
        worker_id: Uuid,
        queue_item: QueueItem,
    },
    NoSlots(QueueItem),
    RateLimited {
        queue_item: QueueItem,
        key: String,
        units: i64,
    },
}

enum PreparedItem {
    /// Rate limits reserved (or none required); ready to probe for a slot.
    Ready {
        queue_item: QueueItem,
        lease: Option<RateLimitLease>,
    },
    /// Reservation failed; terminal for this pass, no slot consumed.
    Limited {
        queue_item: QueueItem,
        key: String,
        units: i64,
    },
}

/// A queue item is abandoned once its scheduling deadline has passed.
pub(crate) fn is_timed_out(qi: &QueueItem) -> bool {
    match qi.schedule_timeout_at {
        Some(deadline) => deadline < now_epoch_ms(),
        None => false,
    }
}

impl Scheduler {
    /// Try to bind each queue item to a worker slot. Results are streamed:
    /// assigned items in sub-batch chunks as soon as they are computed,
    /// then one trailing result per action partition with the unassigned,
    /// timed-out, and rate-limited buckets.
    ///
    /// Dropping the returned stream abandons the call; reservations that
    /// already succeeded stay in the unacked registry until slot expiry.
    pub fn try_assign(
        self: &Arc<Self>,
        queue_items: Vec<QueueItem>,
        step_labels: HashMap<Uuid, Vec<DesiredLabel>>,
        step_run_rate_limits: HashMap<Uuid, HashMap<String, i32>>,
    ) -> ReceiverStream<AssignResults> {
        let mut partitions: HashMap<String, Vec<QueueItem>> = HashMap::new();
        for qi in queue_items {
            partitions.entry(qi.action_id.clone()).or_default().push(qi);
        }

        let (tx, rx) = mpsc::channel(partitions.len().max(1));
        let scheduler = self.clone();
        let step_labels = Arc::new(step_labels);
        let step_run_rate_limits = Arc::new(step_run_rate_limits);

        tokio::spawn(async move {
            let start = Instant::now();
            let mut partition_tasks = JoinSet::new();

            for (action_id, items) in partitions {
                let scheduler = scheduler.clone();
                let tx = tx.clone();
                let step_labels = step_labels.clone();
                let step_run_rate_limits = step_run_rate_limits.clone();

                partition_tasks.spawn(async move {
                    scheduler
                        .assign_partition(action_id, items, step_labels, step_run_rate_limits, tx)
                        .await;
                });
            }

            while let Some(res) = partition_tasks.join_next().await {
                if let Err(err) = res {
                    error!(error = %err, "assignment partition task failed");
                }
            }

            let elapsed = start.elapsed();
            if elapsed > Duration::from_millis(scheduler.cfg.slow_pass_warn_ms) {
                warn!(?elapsed, "assigning queue items took longer than expected");
            }
        });

        ReceiverStream::new(rx)
    }

    async fn assign_partition(
        self: Arc<Self>,
        action_id: String,
        items: Vec<QueueItem>,
        step_labels: Arc<HashMap<Uuid, Vec<DesiredLabel>>>,
        step_run_rate_limits: Arc<HashMap<Uuid, HashMap<String, i32>>>,
        tx: mpsc::Sender<AssignResults>,
    ) {
        let mut unassigned: Vec<QueueItem> = Vec::new();
        let mut scheduling_timed_out: Vec<QueueItem> = Vec::new();
        let mut rate_limited: Vec<RateLimitedItem> = Vec::new();
        let mut assigned_total: u64 = 0;

        let mut queue: Vec<QueueItem> = Vec::with_capacity(items.len());
        for qi in items {
            if is_timed_out(&qi) {
                scheduling_timed_out.push(qi);
            } else {
                queue.push(qi);
            }
        }

        let batch_size = self.cfg.assign_batch_size.max(1);
        let mut ring_offset: usize = 0;

        while !queue.is_empty() {
            let tail = queue.split_off(queue.len().min(batch_size));
            let chunk = queue;
            queue = tail;

            let chunk_start = Instant::now();
            let chunk_len = chunk.len();
            let outcomes = self
                .try_assign_batch(
                    &action_id,
                    chunk,
                    &mut ring_offset,
                    &step_labels,
                    &step_run_rate_limits,
                )
                .await;

            let mut batch_assigned: Vec<AssignedQueueItem> = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Assigned {
                        ack_id,
                        worker_id,
                        queue_item,
                    } => batch_assigned.push(AssignedQueueItem {
                        ack_id,
                        worker_id,
                        queue_item,
                        dispatcher_id: None,
                    }),
                    ItemOutcome::NoSlots(qi) => unassigned.push(qi),
                    ItemOutcome::RateLimited {
                        queue_item,
                        key,
                        units,
                    } => rate_limited.push(RateLimitedItem {
                        queue_item,
                        exceeded_key: key,
                        exceeded_units: units,
                    }),
                }
            }
            assigned_total += batch_assigned.len() as u64;

            let chunk_elapsed = chunk_start.elapsed();
            if chunk_elapsed > Duration::from_millis(self.cfg.slow_pass_warn_ms) {
                warn!(
                    ?chunk_elapsed,
                    items = chunk_len,
                    "processing an assignment sub-batch took longer than expected"
                );
            }

            let sent = tx
                .send(AssignResults {
                    assigned: batch_assigned,
                    ..Default::default()
                })
                .await;
            if sent.is_err() {
                debug!(action_id = %action_id, "assignment result receiver dropped, abandoning partition");
                return;
            }
        }

        self.metrics.record_assignment(
            &self.tenant_label,
            assigned_total,
            unassigned.len() as u64,
            rate_limited.len() as u64,
            scheduling_timed_out.len() as u64,
        );

        let _ = tx
            .send(AssignResults {
                assigned: Vec::new(),
                unassigned,
                scheduling_timed_out,
                rate_limited,
            })
            .await;
    }

    /// Assign one sub-batch of queue items for a single action.
    ///
    /// `ring_offset` is a hint for where each item starts probing the slot
    /// ring; the probe wraps around. It is advanced per item without
    /// synchronization against other partitions, so it provides best-effort
    /// fairness, not strict round-robin.
    async fn try_assign_batch(
        self: &Arc<Self>,
        action_id: &str,
        items: Vec<QueueItem>,
        ring_offset: &mut usize,
        step_labels: &HashMap<Uuid, Vec<DesiredLabel>>,
        step_run_rate_limits: &HashMap<Uuid, HashMap<String, i32>>,
    ) -> Vec<ItemOutcome> {
        debug!(count = items.len(), action_id, "trying to assign queue items");

        // First, reserve rate limits for each item. Failed reservations are
        // terminal for this pass and never touch a slot.
        let mut prepared: Vec<PreparedItem> = Vec::with_capacity(items.len());
        for qi in items {
            match step_run_rate_limits.get(&qi.step_run_id) {
                Some(limits) if !limits.is_empty() => {
                    match self.rate_limiter.use_units(qi.step_run_id, limits) {
                        RateLimitOutcome::Granted(lease) => prepared.push(PreparedItem::Ready {
                            queue_item: qi,
                            lease: Some(lease),
                        }),
                        RateLimitOutcome::Exhausted { key, units } => {
                            prepared.push(PreparedItem::Limited {
                                queue_item: qi,
                                key,
                                units,
                            })
                        }
                    }
                }
                _ => prepared.push(PreparedItem::Ready {
                    queue_item: qi,
                    lease: None,
                }),
            }
        }

        // The ring snapshot is probed while the actions read lock is held,
        // so a concurrent replenish cannot swap rings and recount capacity
        // in the middle of the sub-batch.
        let actions = self.actions.read().await;

        let Some(action) = actions.get(action_id) else {
            drop(actions);
            debug!(action_id, "no slots for action");
            return prepared
                .into_iter()
                .map(|p| match p {
                    PreparedItem::Ready { queue_item, lease } => {
                        if let Some(lease) = lease {
                            lease.nack();
                        }
                        ItemOutcome::NoSlots(queue_item)
                    }
                    PreparedItem::Limited {
                        queue_item,
                        key,
                        units,
                    } => ItemOutcome::RateLimited {
                        queue_item,
                        key,
                        units,
                    },
                })
                .collect();
        };
        let candidate_slots = action.slots.clone();

        let mut outcomes: Vec<Option<ItemOutcome>> = Vec::with_capacity(prepared.len());
        let mut singletons: JoinSet<(usize, ItemOutcome)> = JoinSet::new();

        for (idx, p) in prepared.into_iter().enumerate() {
            match p {
                PreparedItem::Limited {
                    queue_item,
                    key,
                    units,
                } => outcomes.push(Some(ItemOutcome::RateLimited {
                    queue_item,
                    key,
                    units,
                })),
                PreparedItem::Ready { queue_item, lease } => {
                    outcomes.push(None);

                    let child_offset = if candidate_slots.is_empty() {
                        0
                    } else {
                        *ring_offset % candidate_slots.len()
                    };
                    *ring_offset += 1;

                    let scheduler = self.clone();
                    let slots = candidate_slots.clone();
                    let labels = step_labels.get(&queue_item.step_id).cloned().unwrap_or_default();
                    singletons.spawn(async move {
                        let outcome = scheduler
                            .try_assign_singleton(queue_item, &slots, child_offset, &labels, lease);
                        (idx, outcome)
                    });
                }
            }
        }

        while let Some(res) = singletons.join_next().await {
            match res {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(err) => error!(error = %err, "error assigning queue item"),
            }
        }

        // slot reservations are complete; the ring may be swapped now
        drop(actions);

        outcomes.into_iter().flatten().collect()
    }

    /// Probe the slot ring for one queue item, starting at `ring_offset`
    /// and wrapping. Affinity reorders the candidates first.
    fn try_assign_singleton(
        &self,
        queue_item: QueueItem,
        candidate_slots: &[Arc<Slot>],
        ring_offset: usize,
        labels: &[DesiredLabel],
        mut lease: Option<RateLimitLease>,
    ) -> ItemOutcome {
        let ranked: Vec<Arc<Slot>>;
        let candidates: &[Arc<Slot>] = if queue_item.sticky.is_some() || !labels.is_empty() {
            ranked = rank::ranked_slots(&queue_item, labels, candidate_slots);
            &ranked
        } else {
            candidate_slots
        };

        if candidates.is_empty() {
            if let Some(lease) = lease {
                lease.nack();
            }
            return ItemOutcome::NoSlots(queue_item);
        }

        let offset = ring_offset % candidates.len();
        let mut assigned: Option<&Arc<Slot>> = None;

        for slot in candidates[offset..].iter().chain(candidates[..offset].iter()) {
            if !slot.active() {
                continue;
            }
            match slot.try_use(lease.take()) {
                Ok(()) => {
                    assigned = Some(slot);
                    break;
                }
                Err(returned) => lease = returned,
            }
        }

        match assigned {
            Some(slot) => {
                let ack_id = self.assigned_count.fetch_add(1, Ordering::SeqCst) + 1;
                self.unacked.lock().unwrap().insert(ack_id, slot.clone());
                ItemOutcome::Assigned {
                    ack_id,
                    worker_id: slot.worker_id(),
                    queue_item,
                }
            }
            None => {
                if let Some(lease) = lease {
                    lease.nack();
                }
                ItemOutcome::NoSlots(queue_item)
            }
        }
    }
}
