//! Prometheus metrics for daemon observability.
//!
//! One registry, one `DaemonMetrics` handle cloned wherever counters are
//! bumped. Exported in Prometheus text format at `/metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `varbus_requests_total` | Counter | `code`, `status` |
//! | `varbus_notifications_total` | Counter | `kind` |
//! | `varbus_delivery_failures_total` | Counter | `kind` |
//! | `varbus_variables` | Gauge | |
//! | `varbus_clients_active` | Gauge | |
//! | `varbus_clients_reclaimed_total` | Counter | |
//! | `varbus_transactions_inflight` | Gauge | |

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Daemon metrics handle.
///
/// Cheap to clone; all metrics use interior mutability.
#[derive(Clone)]
pub struct DaemonMetrics {
    requests_total: IntCounterVec,
    notifications_total: IntCounterVec,
    delivery_failures_total: IntCounterVec,
    variables: IntGauge,
    clients_active: IntGauge,
    clients_reclaimed_total: IntCounter,
    transactions_inflight: IntGauge,
}

impl DaemonMetrics {
    /// Creates the metrics and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests_total = IntCounterVec::new(
            Opts::new("varbus_requests_total", "Requests dispatched, by code and status"),
            &["code", "status"],
        )?;
        let notifications_total = IntCounterVec::new(
            Opts::new("varbus_notifications_total", "Push notifications delivered, by kind"),
            &["kind"],
        )?;
        let delivery_failures_total = IntCounterVec::new(
            Opts::new(
                "varbus_delivery_failures_total",
                "Push deliveries that found the subscriber gone, by kind",
            ),
            &["kind"],
        )?;
        let variables = IntGauge::new("varbus_variables", "Variables in the store")?;
        let clients_active = IntGauge::new("varbus_clients_active", "Live client registrations")?;
        let clients_reclaimed_total = IntCounter::new(
            "varbus_clients_reclaimed_total",
            "Registrations reclaimed by the liveness sweeper",
        )?;
        let transactions_inflight =
            IntGauge::new("varbus_transactions_inflight", "Open delegation transactions")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(notifications_total.clone()))?;
        registry.register(Box::new(delivery_failures_total.clone()))?;
        registry.register(Box::new(variables.clone()))?;
        registry.register(Box::new(clients_active.clone()))?;
        registry.register(Box::new(clients_reclaimed_total.clone()))?;
        registry.register(Box::new(transactions_inflight.clone()))?;

        Ok(Self {
            requests_total,
            notifications_total,
            delivery_failures_total,
            variables,
            clients_active,
            clients_reclaimed_total,
            transactions_inflight,
        })
    }

    /// Records a dispatched request.
    pub fn request_completed(&self, code: &str, status: &str) {
        self.requests_total.with_label_values(&[code, status]).inc();
    }

    /// Records a delivered push notification.
    pub fn notification_sent(&self, kind: &str) {
        self.notifications_total.with_label_values(&[kind]).inc();
    }

    /// Records a push delivery that found the subscriber gone.
    pub fn delivery_failed(&self, kind: &str) {
        self.delivery_failures_total.with_label_values(&[kind]).inc();
    }

    /// Updates the variable-count gauge.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_variables(&self, count: usize) {
        self.variables.set(count as i64);
    }

    /// Updates the live-client gauge.
    #[allow(clippy::cast_possible_wrap)]
    pub fn set_clients(&self, count: usize) {
        self.clients_active.set(count as i64);
    }

    /// Records one registration reclaimed by the sweeper.
    pub fn client_reclaimed(&self) {
        self.clients_reclaimed_total.inc();
    }

    /// Records a delegation transaction opening.
    pub fn transaction_opened(&self) {
        self.transactions_inflight.inc();
    }

    /// Records a delegation transaction closing.
    pub fn transaction_closed(&self) {
        self.transactions_inflight.dec();
    }
}

/// Registry wrapper owning the Prometheus registry and the daemon handle.
pub struct MetricsRegistry {
    registry: Registry,
    metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let metrics = DaemonMetrics::new(&registry)?;
        Ok(Self { registry, metrics })
    }

    /// The shared metrics handle.
    #[must_use]
    pub fn daemon_metrics(&self) -> DaemonMetrics {
        self.metrics.clone()
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}
