use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation mutations executed. Labels: op, status.
pub const MUTATIONS_TOTAL: &str = "motorpool_mutations_total";

/// Histogram: mutation transaction latency in seconds. Labels: op.
pub const TXN_DURATION_SECONDS: &str = "motorpool_txn_duration_seconds";

/// Counter: admissions rejected by the conflict guard.
pub const CONFLICTS_TOTAL: &str = "motorpool_conflicts_total";

/// Counter: payment confirmations processed. Labels: path, outcome.
pub const CONFIRMATIONS_TOTAL: &str = "motorpool_confirmations_total";

/// Counter: webhook/client confirmations rejected on signature.
pub const SIGNATURE_REJECTS_TOTAL: &str = "motorpool_signature_rejects_total";

/// Counter: provider intent-creation failures after commit.
pub const PROVIDER_FAILURES_TOTAL: &str = "motorpool_provider_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: resources registered.
pub const RESOURCES_ACTIVE: &str = "motorpool_resources_active";

/// Counter: guest identities provisioned.
pub const GUESTS_PROVISIONED_TOTAL: &str = "motorpool_guests_provisioned_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "motorpool_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "motorpool_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
