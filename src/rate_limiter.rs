//! Token-style rate limiting with reserve/ack/nack.
//!
//! Each key holds a counter with a max capacity and a refill window. The
//! assigner reserves units for every key an item names before probing for a
//! slot; the reservation is confirmed (`ack`) when the assignment flushes or
//! released (`nack`) when it fails. Window semantics are invisible to the
//! scheduler - it only consumes reserve/ack/nack.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

struct Counter {
    max_units: i64,
    window_ms: i64,
    window_start_ms: i64,
    /// Bumped on every window roll. A reservation taken in an earlier epoch
    /// is stale: its units were already returned by the roll, so a late
    /// `nack` must not subtract them again.
    epoch: u64,
    used: i64,
}

impl Counter {
    fn roll_if_elapsed(&mut self, now_ms: i64) {
        if now_ms >= self.window_start_ms + self.window_ms {
            let elapsed_windows = (now_ms - self.window_start_ms) / self.window_ms;
            self.window_start_ms += elapsed_windows * self.window_ms;
            self.used = 0;
            self.epoch += 1;
        }
    }
}

/// One reserved key within a lease.
struct Reservation {
    key: String,
    units: i64,
    epoch: u64,
}

/// Outcome of a reservation attempt. On exhaustion every unit reserved
/// during the same attempt has already been released.
pub enum RateLimitOutcome {
    Granted(RateLimitLease),
    Exhausted { key: String, units: i64 },
}

impl RateLimitOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RateLimitOutcome::Granted(_))
    }
}

/// An unresolved reservation. Exactly one of `ack` or `nack` should be
/// called; dropping the lease without either leaves the units consumed
/// until the window rolls, same as an `ack`.
pub struct RateLimitLease {
    limiter: Arc<RateLimiter>,
    step_run_id: Uuid,
    reserved: Vec<Reservation>,
}

impl RateLimitLease {
    /// Make the reservation permanent. Units stay consumed until the
    /// window rolls.
    pub fn ack(self) {
        debug!(step_run_id = %self.step_run_id, keys = self.reserved.len(), "rate limit reservation acked");
    }

    /// Release the reserved units back to their counters.
    pub fn nack(self) {
        debug!(step_run_id = %self.step_run_id, keys = self.reserved.len(), "rate limit reservation nacked");
        self.limiter.release(&self.reserved);
    }
}

/// Per-tenant rate limiter. Keys without a configured limit are unlimited.
pub struct RateLimiter {
    counters: Mutex<HashMap<String, Counter>>,
}

impl RateLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Create or redefine the limit for a key. The window restarts now;
    /// in-window usage is kept when only the capacity changed.
    pub fn upsert_limit(&self, key: &str, max_units: i64, window_ms: i64) {
        let mut counters = self.counters.lock().unwrap();
        match counters.get_mut(key) {
            Some(counter) => {
                counter.max_units = max_units;
                counter.window_ms = window_ms;
            }
            None => {
                counters.insert(
                    key.to_string(),
                    Counter {
                        max_units,
                        window_ms,
                        window_start_ms: crate::slot::now_epoch_ms(),
                        epoch: 0,
                        used: 0,
                    },
                );
            }
        }
    }

    /// Attempt to reserve `units` for every key atomically. On any key's
    /// exhaustion, units reserved for the other keys in this attempt are
    /// released before returning.
    pub fn use_units(
        self: &Arc<Self>,
        step_run_id: Uuid,
        units: &HashMap<String, i32>,
    ) -> RateLimitOutcome {
        let now_ms = crate::slot::now_epoch_ms();
        let mut counters = self.counters.lock().unwrap();
        let mut reserved: Vec<Reservation> = Vec::with_capacity(units.len());

        for (key, requested) in units {
            let requested = *requested as i64;
            let epoch = {
                let Some(counter) = counters.get_mut(key) else {
                    // no configured limit for this key
                    continue;
                };

                counter.roll_if_elapsed(now_ms);

                if counter.used + requested > counter.max_units {
                    None
                } else {
                    counter.used += requested;
                    Some(counter.epoch)
                }
            };

            let Some(epoch) = epoch else {
                // roll back this attempt's reservations under the same lock
                for r in &reserved {
                    if let Some(c) = counters.get_mut(&r.key) {
                        if c.epoch == r.epoch {
                            c.used = (c.used - r.units).max(0);
                        }
                    }
                }
                debug!(
                    step_run_id = %step_run_id,
                    key = %key,
                    requested,
                    "rate limit exhausted"
                );
                return RateLimitOutcome::Exhausted {
                    key: key.clone(),
                    units: requested,
                };
            };

            reserved.push(Reservation {
                key: key.clone(),
                units: requested,
                epoch,
            });
        }

        RateLimitOutcome::Granted(RateLimitLease {
            limiter: self.clone(),
            step_run_id,
            reserved,
        })
    }

    /// Remaining units in the current window, if the key is limited.
    pub fn remaining(&self, key: &str) -> Option<i64> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.get_mut(key)?;
        counter.roll_if_elapsed(crate::slot::now_epoch_ms());
        Some(counter.max_units - counter.used)
    }

    fn release(&self, reserved: &[Reservation]) {
        let mut counters = self.counters.lock().unwrap();
        for r in reserved {
            if let Some(counter) = counters.get_mut(&r.key) {
                if counter.epoch == r.epoch {
                    counter.used = (counter.used - r.units).max(0);
                }
            }
        }
    }
}
