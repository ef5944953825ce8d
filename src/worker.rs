use std::collections::HashMap;

use uuid::Uuid;

/// A single value a worker label can carry. Workers report either a string
/// or an integer per key; ordering comparators only apply to integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelValue {
    Str(String),
    Int(i64),
}

impl LabelValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            LabelValue::Int(v) => Some(*v),
            LabelValue::Str(_) => None,
        }
    }
}

impl From<&str> for LabelValue {
    fn from(v: &str) -> Self {
        LabelValue::Str(v.to_string())
    }
}

impl From<i64> for LabelValue {
    fn from(v: i64) -> Self {
        LabelValue::Int(v)
    }
}

/// Snapshot of one actively heartbeating worker. The whole set is replaced
/// wholesale by `Scheduler::set_workers` on each refresh; capacity and
/// action capability come from the repository at replenish time, not from
/// this snapshot.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: Uuid,
    pub labels: HashMap<String, LabelValue>,
}

impl Worker {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            labels: HashMap::new(),
        }
    }

    pub fn with_labels(id: Uuid, labels: HashMap<String, LabelValue>) -> Self {
        Self { id, labels }
    }
}
