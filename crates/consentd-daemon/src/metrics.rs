//! Prometheus metrics for the consent gate.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `consentd_access_decisions_total` | Counter | `outcome`, `reason` |
//! | `consentd_decision_cache_lookups_total` | Counter | `result` |
//! | `consentd_consent_operations_total` | Counter | `operation`, `status` |
//! | `consentd_audit_write_failures_total` | Counter | `event_type` |
//! | `consentd_store_latency_seconds` | Histogram | `operation` |
//!
//! Every label value comes from a closed enumeration, so cardinality is fixed.

use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Histogram buckets for store latency, in seconds.
pub const STORE_LATENCY_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Consent gate metrics.
///
/// Cheap to clone; all clones share the same collectors.
#[derive(Clone, Debug)]
pub struct GateMetrics {
    registry: Registry,
    access_decisions_total: CounterVec,
    cache_lookups_total: CounterVec,
    consent_operations_total: CounterVec,
    audit_write_failures_total: CounterVec,
    store_latency: HistogramVec,
}

impl GateMetrics {
    /// Creates the collectors and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let access_decisions_total = CounterVec::new(
            Opts::new(
                "consentd_access_decisions_total",
                "Access decisions by outcome and reason",
            ),
            &["outcome", "reason"],
        )?;
        registry.register(Box::new(access_decisions_total.clone()))?;

        let cache_lookups_total = CounterVec::new(
            Opts::new(
                "consentd_decision_cache_lookups_total",
                "Decision cache lookups by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let consent_operations_total = CounterVec::new(
            Opts::new(
                "consentd_consent_operations_total",
                "Consent grant and revoke operations by status",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(consent_operations_total.clone()))?;

        let audit_write_failures_total = CounterVec::new(
            Opts::new(
                "consentd_audit_write_failures_total",
                "Audit appends that failed after the primary operation",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(audit_write_failures_total.clone()))?;

        let store_latency = HistogramVec::new(
            HistogramOpts::new(
                "consentd_store_latency_seconds",
                "Latency of ledger-backed store calls",
            )
            .buckets(STORE_LATENCY_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(store_latency.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            access_decisions_total,
            cache_lookups_total,
            consent_operations_total,
            audit_write_failures_total,
            store_latency,
        })
    }

    /// Creates metrics on a fresh private registry.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails.
    pub fn standalone() -> MetricsResult<Self> {
        Self::new(&Registry::new())
    }

    /// Records an access decision.
    pub fn access_decision(&self, granted: bool, reason: &str) {
        let outcome = if granted { "granted" } else { "denied" };
        self.access_decisions_total
            .with_label_values(&[outcome, reason])
            .inc();
    }

    /// Records a decision cache lookup.
    pub fn cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    /// Records a consent operation outcome.
    pub fn consent_operation(&self, operation: &str, status: &str) {
        self.consent_operations_total
            .with_label_values(&[operation, status])
            .inc();
    }

    /// Records a failed audit append.
    pub fn audit_write_failed(&self, event_type: &str) {
        self.audit_write_failures_total
            .with_label_values(&[event_type])
            .inc();
    }

    /// Records the latency of a store call.
    pub fn store_call(&self, operation: &str, elapsed: Duration) {
        self.store_latency
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Returns the number of failed audit appends for `event_type`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn audit_write_failures(&self, event_type: &str) -> u64 {
        self.audit_write_failures_total
            .with_label_values(&[event_type])
            .get() as u64
    }

    /// Returns the number of cache lookups with the given result.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn cache_lookups(&self, hit: bool) -> u64 {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).get() as u64
    }

    /// Encodes every registered metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}
