use uuid::Uuid;

/// Per-step affinity mode. `Hard` restricts assignment to the desired
/// worker; `Soft` prefers it but falls back to any eligible slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StickyStrategy {
    Soft,
    Hard,
}

/// One pending step-run waiting to be placed on a worker slot.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub step_run_id: Uuid,
    pub step_id: Uuid,
    pub action_id: String,
    /// Priority is carried for the caller's benefit; the scheduler does not
    /// re-order items by it.
    pub priority: i32,
    /// Wall-clock deadline (epoch ms, UTC). Items past it are abandoned
    /// without consuming a slot or rate-limit unit.
    pub schedule_timeout_at: Option<i64>,
    pub sticky: Option<StickyStrategy>,
    pub desired_worker_id: Option<Uuid>,
}

impl QueueItem {
    /// Minimal item for a given action; affinity and deadline unset.
    pub fn new(id: i64, action_id: impl Into<String>) -> Self {
        Self {
            id,
            step_run_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            action_id: action_id.into(),
            priority: 0,
            schedule_timeout_at: None,
            sticky: None,
            desired_worker_id: None,
        }
    }
}

/// Comparator applied between a desired label's value and the worker's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelComparator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

/// One affinity requirement attached to a step. `required` filters slots
/// that cannot satisfy it; otherwise a satisfied comparator contributes
/// `weight` to the slot's rank.
#[derive(Debug, Clone)]
pub struct DesiredLabel {
    pub key: String,
    pub str_value: Option<String>,
    pub int_value: Option<i64>,
    pub required: bool,
    pub weight: i32,
    pub comparator: LabelComparator,
}

impl DesiredLabel {
    pub fn equals_str(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            str_value: Some(value.into()),
            int_value: None,
            required: false,
            weight: 100,
            comparator: LabelComparator::Equal,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn weighted(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }
}
