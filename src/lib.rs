//! gantry - a tenant-scoped step scheduler.
//!
//! The scheduler keeps an in-memory inventory of worker capacity ("slots"),
//! binds pending queue items to slots in concurrent batches, and reconciles
//! the inventory against repository-visible capacity on a periodic cadence.
//!
//! Each tenant gets its own [`scheduler::Scheduler`]; the embedding process
//! owns the tenant map. The scheduler holds no durable state of its own -
//! after a restart it rebuilds from the repository and fresh worker
//! snapshots.

pub mod metrics;
pub mod queue_item;
pub mod rate_limiter;
pub mod repository;
pub mod scheduler;
pub mod settings;
pub mod slot;
pub mod trace;
pub mod worker;

pub use gantry_macros::test;
