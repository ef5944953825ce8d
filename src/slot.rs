//! A slot is one unit of a worker's unused concurrency budget.
//!
//! Slots are created by the replenisher, shared between every action ring of
//! their worker and the unacked registry, and can be reserved exactly once.
//! A reserved slot stays in the unacked registry until the flush layer acks
//! or nacks it; an expired slot is swept on the next replenish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::rate_limiter::RateLimitLease;
use crate::worker::{LabelValue, Worker};

/// Current wall-clock time in epoch milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct Slot {
    worker_id: Uuid,
    worker_labels: Arc<HashMap<String, LabelValue>>,
    /// Actions the owning worker supports. The same slot object sits in
    /// every one of these actions' rings; reserving it removes the
    /// capacity from all of them at once.
    actions: Arc<Vec<String>>,
    ttl_ms: i64,
    expiry_ms: AtomicI64,
    used: AtomicBool,
    lease: Mutex<Option<RateLimitLease>>,
}

impl Slot {
    pub(crate) fn new(worker: &Worker, actions: Arc<Vec<String>>, ttl_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            worker_id: worker.id,
            worker_labels: Arc::new(worker.labels.clone()),
            actions,
            ttl_ms,
            expiry_ms: AtomicI64::new(now_epoch_ms() + ttl_ms),
            used: AtomicBool::new(false),
            lease: Mutex::new(None),
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn worker_labels(&self) -> &HashMap<String, LabelValue> {
        &self.worker_labels
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// A slot is active while it has never been reserved and has not
    /// expired.
    pub fn active(&self) -> bool {
        !self.used.load(Ordering::Acquire) && now_epoch_ms() < self.expiry_ms.load(Ordering::Acquire)
    }

    pub fn expired(&self) -> bool {
        now_epoch_ms() >= self.expiry_ms.load(Ordering::Acquire)
    }

    /// Push the expiry out by one TTL from now. The replenisher calls this
    /// on unacked slots so they survive until the flush layer resolves them.
    pub fn extend_expiry(&self) {
        self.expiry_ms
            .store(now_epoch_ms() + self.ttl_ms, Ordering::Release);
    }

    /// Reserve the slot. Succeeds at most once across the slot's lifetime;
    /// losers of the race get the lease handed back to try the next slot.
    pub fn try_use(
        &self,
        lease: Option<RateLimitLease>,
    ) -> Result<(), Option<RateLimitLease>> {
        if self
            .used
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.lease.lock().unwrap() = lease;
            Ok(())
        } else {
            Err(lease)
        }
    }

    /// Confirm the reservation's rate-limit units after a successful flush.
    pub fn ack(&self) {
        if let Some(lease) = self.lease.lock().unwrap().take() {
            lease.ack();
        }
    }

    /// Release the reservation's rate-limit units after a failed flush.
    /// The slot itself is not re-armed; capacity comes back through the
    /// next replenish.
    pub fn nack(&self) {
        if let Some(lease) = self.lease.lock().unwrap().take() {
            lease.nack();
        }
    }
}
