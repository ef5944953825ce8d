//! Prometheus metrics for gantry.
//!
//! Initialize once at startup with [`init`], hand the `Metrics` clone to each
//! tenant scheduler, and serve the `/metrics` endpoint with
//! [`run_metrics_server`] when the embedding process wants scraping.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Histogram buckets for pass latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics handle containing all scheduler instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    items_assigned: CounterVec,
    items_unassigned: CounterVec,
    items_rate_limited: CounterVec,
    items_timed_out: CounterVec,

    replenish_duration: HistogramVec,
    active_slots: GaugeVec,
    unacked_slots: GaugeVec,
}

impl Metrics {
    /// Get the prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome counts of one assignment pass.
    pub fn record_assignment(
        &self,
        tenant: &str,
        assigned: u64,
        unassigned: u64,
        rate_limited: u64,
        timed_out: u64,
    ) {
        self.items_assigned
            .with_label_values(&[tenant])
            .inc_by(assigned as f64);
        self.items_unassigned
            .with_label_values(&[tenant])
            .inc_by(unassigned as f64);
        self.items_rate_limited
            .with_label_values(&[tenant])
            .inc_by(rate_limited as f64);
        self.items_timed_out
            .with_label_values(&[tenant])
            .inc_by(timed_out as f64);
    }

    /// Record replenish pass duration in seconds.
    pub fn record_replenish_duration(&self, tenant: &str, duration_secs: f64) {
        self.replenish_duration
            .with_label_values(&[tenant])
            .observe(duration_secs);
    }

    /// Update the active slot count for an action.
    pub fn set_active_slots(&self, tenant: &str, action: &str, count: u64) {
        self.active_slots
            .with_label_values(&[tenant, action])
            .set(count as f64);
    }

    /// Update the number of assigned-but-unflushed slots.
    pub fn set_unacked_slots(&self, tenant: &str, count: u64) {
        self.unacked_slots
            .with_label_values(&[tenant])
            .set(count as f64);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a Prometheus registry.
///
/// Returns a `Metrics` handle that can be cloned and passed to schedulers.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let items_assigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_assigned_total",
                "Total number of queue items bound to a worker slot",
            ),
            &["tenant"],
        )?,
    );

    let items_unassigned = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_unassigned_total",
                "Total number of queue items that found no eligible slot",
            ),
            &["tenant"],
        )?,
    );

    let items_rate_limited = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_rate_limited_total",
                "Total number of queue items rejected by rate limits",
            ),
            &["tenant"],
        )?,
    );

    let items_timed_out = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "gantry_items_timed_out_total",
                "Total number of queue items past their scheduling deadline",
            ),
            &["tenant"],
        )?,
    );

    let replenish_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "gantry_replenish_duration_seconds",
                "Slot replenish pass duration in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["tenant"],
        )?,
    );

    let active_slots = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "gantry_active_slots",
                "Number of active slots per action after the last replenish",
            ),
            &["tenant", "action"],
        )?,
    );

    let unacked_slots = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "gantry_unacked_slots",
                "Number of slots assigned but not yet flushed",
            ),
            &["tenant"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        items_assigned,
        items_unassigned,
        items_rate_limited,
        items_timed_out,
        replenish_duration,
        active_slots,
        unacked_slots,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics`.
/// Shuts down gracefully when the shutdown signal is received.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
