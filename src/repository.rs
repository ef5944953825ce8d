//! Repository queries the scheduler consumes.
//!
//! The scheduler sees persistent storage through exactly two read queries;
//! everything else about the database is someone else's problem. An
//! in-memory implementation is provided for the simulator and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository query failed: {0}")]
    Query(String),
}

/// One worker-to-action capability pair among actively heartbeating workers.
#[derive(Debug, Clone)]
pub struct WorkerActionRow {
    pub worker_id: Uuid,
    pub action_id: String,
}

/// Per-worker uncommitted capacity snapshot.
#[derive(Debug, Clone)]
pub struct WorkerSlotsRow {
    pub worker_id: Uuid,
    pub available_slots: i64,
}

/// The two read queries the scheduler runs against storage.
#[async_trait]
pub trait SchedulerRepo: Send + Sync {
    /// Which actions each of the given workers can perform, restricted to
    /// workers that are actively heartbeating.
    async fn list_actions_for_workers(
        &self,
        tenant_id: Uuid,
        worker_ids: &[Uuid],
    ) -> Result<Vec<WorkerActionRow>, RepoError>;

    /// Uncommitted capacity per worker. Already-flushed assignments are
    /// excluded by the query; assigned-but-unflushed slots are the
    /// scheduler's own bookkeeping.
    async fn list_available_slots_for_workers(
        &self,
        tenant_id: Uuid,
        worker_ids: &[Uuid],
    ) -> Result<Vec<WorkerSlotsRow>, RepoError>;
}

#[derive(Default)]
struct InMemoryState {
    actions: HashMap<Uuid, Vec<String>>,
    slots: HashMap<Uuid, i64>,
    fail_next: bool,
}

/// In-memory repository for the simulator and tests. Capability and
/// capacity tables are mutated directly by the harness.
#[derive(Default)]
pub struct InMemoryRepo {
    state: Mutex<InMemoryState>,
}

impl InMemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update a worker's capability and capacity rows.
    pub fn set_worker(&self, worker_id: Uuid, actions: Vec<String>, available_slots: i64) {
        let mut state = self.state.lock().unwrap();
        state.actions.insert(worker_id, actions);
        state.slots.insert(worker_id, available_slots);
    }

    pub fn set_available_slots(&self, worker_id: Uuid, available_slots: i64) {
        let mut state = self.state.lock().unwrap();
        state.slots.insert(worker_id, available_slots);
    }

    pub fn remove_worker(&self, worker_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.actions.remove(&worker_id);
        state.slots.remove(&worker_id);
    }

    /// Make the next query return an error, for failure-path tests.
    pub fn fail_next_query(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    fn check_failure(state: &mut InMemoryState) -> Result<(), RepoError> {
        if state.fail_next {
            state.fail_next = false;
            return Err(RepoError::Query("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerRepo for InMemoryRepo {
    async fn list_actions_for_workers(
        &self,
        _tenant_id: Uuid,
        worker_ids: &[Uuid],
    ) -> Result<Vec<WorkerActionRow>, RepoError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;

        let mut rows = Vec::new();
        for worker_id in worker_ids {
            if let Some(actions) = state.actions.get(worker_id) {
                for action_id in actions {
                    rows.push(WorkerActionRow {
                        worker_id: *worker_id,
                        action_id: action_id.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn list_available_slots_for_workers(
        &self,
        _tenant_id: Uuid,
        worker_ids: &[Uuid],
    ) -> Result<Vec<WorkerSlotsRow>, RepoError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;

        let mut rows = Vec::new();
        for worker_id in worker_ids {
            if let Some(available_slots) = state.slots.get(worker_id) {
                rows.push(WorkerSlotsRow {
                    worker_id: *worker_id,
                    available_slots: *available_slots,
                });
            }
        }
        Ok(rows)
    }
}
