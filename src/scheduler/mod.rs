//! Tenant-scoped step scheduler.
//!
//! This module contains the core `Scheduler` type and its implementation,
//! split across submodules:
//!
//! - `replenish`: periodic reconciliation of slot inventory against
//!   repository-visible worker capacity
//! - `assign`: batched, per-action assignment of queue items to slots
//! - `rank`: affinity-aware slot ordering (sticky workers, desired labels)

mod assign;
mod rank;
mod replenish;

pub use assign::{AssignResults, AssignedQueueItem, RateLimitedItem};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::rate_limiter::RateLimiter;
use crate::repository::{RepoError, SchedulerRepo};
use crate::settings::SchedulerConfig;
use crate::slot::Slot;
use crate::worker::Worker;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Per-action slot ring plus the replenish hints.
pub(crate) struct Action {
    /// Shuffled slot ring. The replenisher replaces the whole ring rather
    /// than mutating it, so the assigner can clone the `Arc` and probe a
    /// stable snapshot.
    pub(crate) slots: Arc<[Arc<Slot>]>,
    pub(crate) last_replenished_slot_count: usize,
    pub(crate) last_replenished_worker_count: usize,
}

impl Action {
    pub(crate) fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.active()).count()
    }
}

/// Binds queue items to worker slots for a single tenant.
///
/// The scheduler holds no durable state: slot inventory is rebuilt from the
/// repository on every replenish pass, and the worker snapshot is replaced
/// wholesale by [`Scheduler::set_workers`].
pub struct Scheduler {
    repo: Arc<dyn SchedulerRepo>,
    tenant_id: Uuid,
    tenant_label: String,
    cfg: SchedulerConfig,

    actions: RwLock<HashMap<String, Action>>,
    /// Serializes replenish passes. Best-effort passes skip out when the
    /// lock is contended instead of queueing behind it.
    replenish_lock: tokio::sync::Mutex<()>,

    workers: Mutex<Arc<HashMap<Uuid, Worker>>>,

    assigned_count: AtomicU64,

    /// Slots reserved by the assigner but not yet confirmed flushed to the
    /// database. They count against worker capacity during the next
    /// replenish pass.
    unacked: Mutex<HashMap<u64, Arc<Slot>>>,

    rate_limiter: Arc<RateLimiter>,
    rng: Mutex<SmallRng>,
    metrics: Metrics,
}

impl Scheduler {
    pub fn new(
        repo: Arc<dyn SchedulerRepo>,
        tenant_id: Uuid,
        cfg: SchedulerConfig,
        rate_limiter: Arc<RateLimiter>,
        metrics: Metrics,
    ) -> Arc<Self> {
        let rng = match cfg.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };

        Arc::new(Self {
            repo,
            tenant_id,
            tenant_label: tenant_id.to_string(),
            cfg,
            actions: RwLock::new(HashMap::new()),
            replenish_lock: tokio::sync::Mutex::new(()),
            workers: Mutex::new(Arc::new(HashMap::new())),
            assigned_count: AtomicU64::new(0),
            unacked: Mutex::new(HashMap::new()),
            rate_limiter,
            rng: Mutex::new(rng),
            metrics,
        })
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Confirm flushed assignments. Unknown ack ids are ignored, so a
    /// repeated `ack` is a no-op.
    pub fn ack(&self, ack_ids: &[u64]) {
        let mut unacked = self.unacked.lock().unwrap();
        for id in ack_ids {
            if let Some(slot) = unacked.remove(id) {
                slot.ack();
            }
        }
        self.metrics
            .set_unacked_slots(&self.tenant_label, unacked.len() as u64);
    }

    /// Revoke assignments whose flush failed. The slot's rate-limit units
    /// are released; the slot itself is not re-armed and its capacity comes
    /// back through the next replenish.
    pub fn nack(&self, ack_ids: &[u64]) {
        let mut unacked = self.unacked.lock().unwrap();
        for id in ack_ids {
            if let Some(slot) = unacked.remove(id) {
                slot.nack();
            }
        }
        self.metrics
            .set_unacked_slots(&self.tenant_label, unacked.len() as u64);
    }

    /// Replace the tenant's worker snapshot wholesale.
    pub fn set_workers(&self, workers: Vec<Worker>) {
        let snapshot: HashMap<Uuid, Worker> =
            workers.into_iter().map(|w| (w.id, w)).collect();
        *self.workers.lock().unwrap() = Arc::new(snapshot);
    }

    pub(crate) fn get_workers(&self) -> Arc<HashMap<Uuid, Worker>> {
        self.workers.lock().unwrap().clone()
    }

    /// Spawn the background replenish loop. It runs until the shutdown
    /// signal fires.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.loop_replenish(shutdown).await })
    }

    /// Active and total slot counts for an action, for observability.
    pub async fn slot_counts(&self, action_id: &str) -> Option<(usize, usize)> {
        let actions = self.actions.read().await;
        actions
            .get(action_id)
            .map(|a| (a.active_count(), a.slots.len()))
    }

    /// Number of assignments awaiting ack or nack.
    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().unwrap().len()
    }
}
