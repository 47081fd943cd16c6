//! Prometheus metrics for token reconciliation.
//!
//! Initialize once at startup and hand clones to the reconciler:
//! ```ignore
//! let metrics = sa_token::metrics::init()?;
//! let reconciler = TokenReconciler::new(backend, locks, &cfg).with_metrics(metrics.clone());
//! sa_token::metrics::run_metrics_server(addr, metrics, shutdown).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    Counter, CounterVec, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
    core::Collector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Buckets for end-to-end reconcile latency (in seconds). Lease waits can take tens of seconds.
const RECONCILE_BUCKETS: &[f64] = &[0.005, 0.025, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Buckets for attempt/poll counts.
const ATTEMPT_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 30.0, 40.0, 50.0];

/// Instruments for reconcile outcomes, shared by clones.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    ensure_total: CounterVec,
    ensure_duration: Histogram,
    lease_attempts: Histogram,
    lease_release_failures: Counter,
    secrets_created: Counter,
    secrets_deleted: CounterVec,
    populate_polls: Histogram,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of one ensure call (`ok` or an error kind).
    pub fn record_ensure(&self, outcome: &str, duration_secs: f64) {
        self.ensure_total.with_label_values(&[outcome]).inc();
        self.ensure_duration.observe(duration_secs);
    }

    /// Record how many create attempts a lease acquisition took.
    pub fn record_lease_attempts(&self, attempts: u32) {
        self.lease_attempts.observe(f64::from(attempts));
    }

    pub fn record_lease_release_failure(&self) {
        self.lease_release_failures.inc();
    }

    pub fn record_secret_created(&self) {
        self.secrets_created.inc();
    }

    /// Record cleanup of non-canonical secrets.
    pub fn record_secrets_deleted(&self, deleted: u32, failed: u32) {
        self.secrets_deleted
            .with_label_values(&["deleted"])
            .inc_by(f64::from(deleted));
        self.secrets_deleted
            .with_label_values(&["failed"])
            .inc_by(f64::from(failed));
    }

    /// Record how many polls it took for a secret to be populated.
    pub fn record_populate_polls(&self, polls: u32) {
        self.populate_polls.observe(f64::from(polls));
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Duplicate names only lose the series; reconciling carries on.
        tracing::warn!(error = %e, "could not register sa_token metric");
    }
    metric
}

/// Build every instrument on its own registry, so instances never share series.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let ensure_total = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "sa_token_ensure_total",
                "Ensure calls by outcome (ok or error kind)",
            ),
            &["outcome"],
        )?,
    );

    let ensure_duration = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "sa_token_ensure_duration_seconds",
                "End-to-end duration of ensure calls",
            )
            .buckets(RECONCILE_BUCKETS.to_vec()),
        )?,
    );

    let lease_attempts = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "sa_token_lease_acquire_attempts",
                "Create attempts needed to acquire the reconcile lease",
            )
            .buckets(ATTEMPT_BUCKETS.to_vec()),
        )?,
    );

    let lease_release_failures = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sa_token_lease_release_failures_total",
            "Leases that could not be deleted after reconciling",
        ))?,
    );

    let secrets_created = register(
        &registry,
        Counter::with_opts(Opts::new(
            "sa_token_secrets_created_total",
            "Token secrets created",
        ))?,
    );

    let secrets_deleted = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "sa_token_secrets_deleted_total",
                "Duplicate or invalid token secrets removed during lookup",
            ),
            &["result"],
        )?,
    );

    let populate_polls = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(
                "sa_token_populate_polls",
                "Polls needed before the token controller populated a secret",
            )
            .buckets(ATTEMPT_BUCKETS.to_vec()),
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        ensure_total,
        ensure_duration,
        lease_attempts,
        lease_release_failures,
        secrets_created,
        secrets_deleted,
        populate_polls,
    })
}

/// Render all metrics in the Prometheus text exposition format.
pub fn render(metrics: &Metrics) -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer)?;
    Ok(buffer)
}

async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    match render(&metrics) {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "could not render metrics scrape");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Router serving `/metrics`.
pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Run the Prometheus metrics HTTP server.
///
/// Listens on the given address and serves metrics at `/metrics` until
/// `shutdown` is cancelled.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
