//! Load simulator: drives a scheduler against an in-memory repository with
//! synthetic workers and queue items, then prints outcome counts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio_stream::StreamExt;
use uuid::Uuid;

use gantry::metrics;
use gantry::queue_item::{QueueItem, StickyStrategy};
use gantry::rate_limiter::RateLimiter;
use gantry::repository::InMemoryRepo;
use gantry::scheduler::Scheduler;
use gantry::settings::{LogFormat, SchedulerConfig};
use gantry::slot::now_epoch_ms;
use gantry::worker::{LabelValue, Worker};

#[derive(Parser, Debug)]
struct Args {
    /// Duration to run the simulation, in seconds
    #[arg(long, default_value = "30")]
    duration_secs: u64,
    /// Number of simulated workers
    #[arg(long, default_value = "8")]
    workers: usize,
    /// Available slots per worker
    #[arg(long, default_value = "4")]
    slots_per_worker: i64,
    /// Number of distinct actions
    #[arg(long, default_value = "4")]
    actions: usize,
    /// Queue items per assignment round
    #[arg(long, default_value = "100")]
    batch: usize,
    /// Percent of assignments to nack instead of ack
    #[arg(long, default_value = "5")]
    nack_percent: u32,
    /// Optional shared rate limit capacity per 1s window
    #[arg(long)]
    rate_limit: Option<i64>,
    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
    /// Optional address for the /metrics endpoint
    #[arg(long)]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    gantry::trace::init(LogFormat::Text)?;

    let mut rng = match args.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    };

    let repo = Arc::new(InMemoryRepo::new());
    let action_ids: Vec<String> = (0..args.actions).map(|i| format!("action-{i}")).collect();

    let mut workers = Vec::with_capacity(args.workers);
    for i in 0..args.workers {
        let id = Uuid::new_v4();
        // each worker supports half the actions, offset by its index
        let supported: Vec<String> = (0..args.actions.div_ceil(2))
            .map(|j| action_ids[(i + j) % action_ids.len()].clone())
            .collect();
        repo.set_worker(id, supported, args.slots_per_worker);

        let mut labels = HashMap::new();
        labels.insert(
            "region".to_string(),
            LabelValue::from(if i % 2 == 0 { "us" } else { "eu" }),
        );
        labels.insert("tier".to_string(), LabelValue::from(i as i64));
        workers.push(Worker::with_labels(id, labels));
    }
    let worker_ids: Vec<Uuid> = workers.iter().map(|w| w.id).collect();

    let rate_limiter = RateLimiter::new();
    if let Some(capacity) = args.rate_limit {
        rate_limiter.upsert_limit("global", capacity, 1_000);
    }

    let metrics = metrics::init()?;
    let cfg = SchedulerConfig {
        rng_seed: args.seed,
        ..SchedulerConfig::default()
    };

    let scheduler = Scheduler::new(
        repo.clone(),
        Uuid::new_v4(),
        cfg,
        rate_limiter.clone(),
        metrics.clone(),
    );
    scheduler.set_workers(workers);

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let replenish_handle = scheduler.start(shutdown_tx.subscribe());

    if let Some(addr) = &args.metrics_addr {
        let addr = addr.parse()?;
        let metrics = metrics.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = metrics::run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!(error = %err, "metrics server failed");
            }
        });
    }

    // initial inventory before the first round
    scheduler.replenish(true).await?;

    let mut total_assigned: u64 = 0;
    let mut total_unassigned: u64 = 0;
    let mut total_rate_limited: u64 = 0;
    let mut total_timed_out: u64 = 0;
    let mut next_item_id: i64 = 0;

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    while Instant::now() < deadline {
        let mut items = Vec::with_capacity(args.batch);
        let mut rate_limits: HashMap<Uuid, HashMap<String, i32>> = HashMap::new();

        for _ in 0..args.batch {
            next_item_id += 1;
            let mut qi = QueueItem::new(
                next_item_id,
                action_ids[rng.gen_range(0..action_ids.len())].clone(),
            );

            // a few percent arrive already past their deadline
            if rng.gen_ratio(2, 100) {
                qi.schedule_timeout_at = Some(now_epoch_ms() - 1_000);
            }
            // some prefer a specific worker
            if rng.gen_ratio(10, 100) {
                qi.sticky = Some(StickyStrategy::Soft);
                qi.desired_worker_id = Some(worker_ids[rng.gen_range(0..worker_ids.len())]);
            }
            if args.rate_limit.is_some() {
                rate_limits.insert(qi.step_run_id, HashMap::from([("global".to_string(), 1)]));
            }
            items.push(qi);
        }

        let mut stream = scheduler.try_assign(items, HashMap::new(), rate_limits);
        let mut to_ack = Vec::new();
        let mut to_nack = Vec::new();

        while let Some(results) = stream.next().await {
            for assigned in &results.assigned {
                if rng.gen_ratio(args.nack_percent.min(100), 100) {
                    to_nack.push(assigned.ack_id);
                } else {
                    to_ack.push(assigned.ack_id);
                }
            }
            total_assigned += results.assigned.len() as u64;
            total_unassigned += results.unassigned.len() as u64;
            total_rate_limited += results.rate_limited.len() as u64;
            total_timed_out += results.scheduling_timed_out.len() as u64;
        }

        scheduler.ack(&to_ack);
        scheduler.nack(&to_nack);

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(());
    let _ = replenish_handle.await;

    let total = total_assigned + total_unassigned + total_rate_limited + total_timed_out;
    println!("--- gantry-sim results ---");
    println!("items:        {total}");
    println!(
        "assigned:     {total_assigned} ({:.1}%)",
        100.0 * total_assigned as f64 / total.max(1) as f64
    );
    println!("unassigned:   {total_unassigned}");
    println!("rate limited: {total_rate_limited}");
    println!("timed out:    {total_timed_out}");
    println!("unacked left: {}", scheduler.unacked_len());

    gantry::trace::shutdown();
    Ok(())
}
