//! Benchmark for the assignment hot path.
//!
//! Run with: cargo bench --bench assign_throughput

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_stream::StreamExt;
use uuid::Uuid;

use gantry::queue_item::QueueItem;
use gantry::rate_limiter::RateLimiter;
use gantry::repository::InMemoryRepo;
use gantry::scheduler::Scheduler;
use gantry::settings::SchedulerConfig;
use gantry::worker::Worker;

async fn setup(workers: usize, slots_per_worker: i64) -> Arc<Scheduler> {
    let repo = Arc::new(InMemoryRepo::new());
    let mut roster = Vec::with_capacity(workers);
    for _ in 0..workers {
        let id = Uuid::new_v4();
        repo.set_worker(id, vec!["bench".to_string()], slots_per_worker);
        roster.push(Worker::new(id));
    }

    let cfg = SchedulerConfig {
        rng_seed: Some(7),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(
        repo,
        Uuid::new_v4(),
        cfg,
        RateLimiter::new(),
        gantry::metrics::init().expect("metrics"),
    );
    scheduler.set_workers(roster);
    scheduler.replenish(true).await.expect("replenish");
    scheduler
}

async fn measure_round_trip(workers: usize, slots_per_worker: i64, rounds: usize) -> f64 {
    let scheduler = setup(workers, slots_per_worker).await;
    let batch = (workers as i64 * slots_per_worker) as usize;

    let start = Instant::now();
    let mut assigned_total = 0usize;

    for round in 0..rounds {
        let items: Vec<QueueItem> = (0..batch)
            .map(|i| QueueItem::new((round * batch + i) as i64, "bench"))
            .collect();

        let mut stream = scheduler.try_assign(items, HashMap::new(), HashMap::new());
        let mut ack_ids = Vec::with_capacity(batch);
        while let Some(results) = stream.next().await {
            for a in &results.assigned {
                ack_ids.push(a.ack_id);
            }
        }
        assigned_total += ack_ids.len();
        scheduler.ack(&ack_ids);
        scheduler.replenish(true).await.expect("replenish");
    }

    assigned_total as f64 / start.elapsed().as_secs_f64()
}

#[tokio::main]
async fn main() {
    println!("--- assignment round trip (assign + ack + replenish) ---");

    let small = measure_round_trip(4, 8, 50).await;
    println!("  4 workers x 8 slots:    {:>10.0} assignments/sec", small);

    let medium = measure_round_trip(16, 16, 50).await;
    println!("  16 workers x 16 slots:  {:>10.0} assignments/sec", medium);

    let large = measure_round_trip(64, 16, 20).await;
    println!("  64 workers x 16 slots:  {:>10.0} assignments/sec", large);
}
