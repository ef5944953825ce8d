//! Periodic reconciliation of the slot inventory.
//!
//! A replenish pass snapshots worker capability and capacity from the
//! repository, rebuilds the slot rings for actions that need it, extends
//! the expiry of unacked slots so they stay visible, then sweeps expired
//! slots and empty actions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::slot::Slot;

use super::{Action, Scheduler, SchedulerError};

impl Scheduler {
    /// Load new slots from the repository. With `must` set the pass blocks
    /// until it can run; otherwise it is skipped when another pass is
    /// already in progress.
    pub async fn replenish(&self, must: bool) -> Result<(), SchedulerError> {
        let _guard = if must {
            self.replenish_lock.lock().await
        } else {
            match self.replenish_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("skipping replenish because another replenish is in progress");
                    return Ok(());
                }
            }
        };

        debug!("replenishing slots");

        let start = Instant::now();
        let workers = self.get_workers();
        let worker_ids: Vec<Uuid> = workers.keys().copied().collect();

        let mut checkpoint = Instant::now();
        let capability_rows = self
            .repo
            .list_actions_for_workers(self.tenant_id, &worker_ids)
            .await?;
        debug!(elapsed = ?checkpoint.elapsed(), "listed actions for workers");
        checkpoint = Instant::now();

        let mut actions_to_workers: HashMap<String, Vec<Uuid>> = HashMap::new();
        let mut workers_to_actions: HashMap<Uuid, Vec<String>> = HashMap::new();

        for row in &capability_rows {
            if row.action_id.is_empty() {
                continue;
            }
            actions_to_workers
                .entry(row.action_id.clone())
                .or_default()
                .push(row.worker_id);
            workers_to_actions
                .entry(row.worker_id)
                .or_default()
                .push(row.action_id.clone());
        }

        // Decide which actions to replenish:
        // - untracked, or zero active slots: replenish
        // - half or more of the last batch consumed: replenish
        // - more workers available than last time: replenish
        // - otherwise leave the ring alone
        let mut actions_to_replenish: Vec<String> = Vec::new();
        {
            let actions = self.actions.read().await;

            for (action_id, action_workers) in &actions_to_workers {
                let replenish = if must {
                    true
                } else {
                    match actions.get(action_id) {
                        None => true,
                        Some(action) => {
                            let active = action.active_count();
                            if active == 0 {
                                debug!(action_id = %action_id, "replenishing because no slots are active");
                                true
                            } else if active <= action.last_replenished_slot_count / 2 {
                                debug!(
                                    action_id = %action_id,
                                    "replenishing because half the slots are consumed"
                                );
                                true
                            } else if action_workers.len() > action.last_replenished_worker_count {
                                debug!(action_id = %action_id, "replenishing because more workers are available");
                                true
                            } else {
                                false
                            }
                        }
                    }
                };

                if replenish {
                    actions_to_replenish.push(action_id.clone());
                }
            }
        }

        debug!(elapsed = ?checkpoint.elapsed(), "decided which actions to replenish");
        checkpoint = Instant::now();

        let mut unique_worker_ids: HashSet<Uuid> = HashSet::new();
        for action_id in &actions_to_replenish {
            if let Some(ws) = actions_to_workers.get(action_id) {
                unique_worker_ids.extend(ws.iter().copied());
            }
        }
        let touched_workers: Vec<Uuid> = unique_worker_ids.into_iter().collect();

        let capacity_rows = self
            .repo
            .list_available_slots_for_workers(self.tenant_id, &touched_workers)
            .await?;
        debug!(elapsed = ?checkpoint.elapsed(), "loaded available slots");

        // Write phase. Locks nest actions -> unacked, the same order the
        // assigner uses; both guards are held across sync work only.
        let mut actions = self.actions.write().await;
        let unacked = self.unacked.lock().unwrap();

        let mut workers_to_unacked: HashMap<Uuid, Vec<Arc<Slot>>> = HashMap::new();
        for slot in unacked.values() {
            workers_to_unacked
                .entry(slot.worker_id())
                .or_default()
                .push(slot.clone());
        }

        let no_unacked: Vec<Arc<Slot>> = Vec::new();
        let mut actions_to_new_slots: HashMap<String, Vec<Arc<Slot>>> = HashMap::new();

        for row in &capacity_rows {
            let Some(worker) = workers.get(&row.worker_id) else {
                continue;
            };
            let action_ids = workers_to_actions
                .get(&row.worker_id)
                .cloned()
                .unwrap_or_default();
            let unacked_slots = workers_to_unacked
                .get(&row.worker_id)
                .unwrap_or(&no_unacked);

            // fresh slots beyond what is already reserved in flight
            let fresh = (row.available_slots - unacked_slots.len() as i64).max(0) as usize;

            let shared_actions = Arc::new(action_ids.clone());
            let mut slots: Vec<Arc<Slot>> = Vec::with_capacity(fresh + unacked_slots.len());
            for _ in 0..fresh {
                slots.push(Slot::new(worker, shared_actions.clone(), self.cfg.slot_ttl_ms));
            }

            // keep in-flight reservations visible to future passes
            for slot in unacked_slots {
                slot.extend_expiry();
            }
            slots.extend(unacked_slots.iter().cloned());

            debug!(
                worker_id = %row.worker_id,
                available = row.available_slots,
                unacked = unacked_slots.len(),
                "computed worker slots"
            );

            for action_id in &action_ids {
                actions_to_new_slots
                    .entry(action_id.clone())
                    .or_default()
                    .extend(slots.iter().cloned());
            }
        }

        // first pass: swap in a freshly shuffled ring per affected action
        {
            let mut rng = self.rng.lock().unwrap();
            for (action_id, mut new_slots) in actions_to_new_slots {
                new_slots.shuffle(&mut *rng);

                let slot_count = new_slots.len();
                let worker_count = actions_to_workers
                    .get(&action_id)
                    .map_or(0, |ws| ws.len());
                debug!(action_id = %action_id, slots = slot_count, "replenished action");

                actions.insert(
                    action_id,
                    Action {
                        slots: new_slots.into(),
                        last_replenished_slot_count: slot_count,
                        last_replenished_worker_count: worker_count,
                    },
                );
            }
        }

        // second pass: drop expired slots
        for (action_id, action) in actions.iter_mut() {
            let kept: Vec<Arc<Slot>> = action
                .slots
                .iter()
                .filter(|s| !s.expired())
                .cloned()
                .collect();
            if kept.len() != action.slots.len() {
                debug!(action_id = %action_id, kept = kept.len(), "swept expired slots");
            }
            action.slots = kept.into();
        }

        // third pass: remove actions with no slots left
        actions.retain(|action_id, action| {
            if action.slots.is_empty() {
                debug!(action_id = %action_id, "removing action because it has no slots");
                false
            } else {
                true
            }
        });

        for (action_id, action) in actions.iter() {
            self.metrics.set_active_slots(
                &self.tenant_label,
                action_id,
                action.active_count() as u64,
            );
        }
        self.metrics
            .set_unacked_slots(&self.tenant_label, unacked.len() as u64);

        drop(unacked);
        drop(actions);

        let elapsed = start.elapsed();
        self.metrics
            .record_replenish_duration(&self.tenant_label, elapsed.as_secs_f64());
        if elapsed > Duration::from_millis(self.cfg.slow_pass_warn_ms) {
            warn!(?elapsed, "replenishing slots took longer than expected");
        } else {
            debug!(?elapsed, "finished replenishing slots");
        }

        Ok(())
    }

    /// Background loop: one blocking replenish per tick until shutdown.
    pub(crate) async fn loop_replenish(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.cfg.replenish_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.replenish(true).await {
                        error!(error = %err, "error replenishing slots");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("replenish loop shutting down");
                    return;
                }
            }
        }
    }
}
