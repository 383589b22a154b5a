#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

/// Counter snapshot for the operational core. Scrape adapters read this;
/// the wire format (Prometheus text, OTLP) lives outside the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsCounters {
    pub requests_total: usize,
    pub audit_enqueue_failures: usize,
    pub audit_sync_fallbacks: usize,
    pub audit_dead_letters: usize,
    pub outbox_publish_failures: usize,
    pub outbox_exhausted: usize,
    pub payout_gateway_completed: usize,
    pub payout_gateway_failed: usize,
    pub rate_limit_delays: usize,
    pub rate_limit_blocks: usize,
    pub jobs_exhausted: usize,
    pub webhook_deliveries_failed: usize,
    pub slow_operations: usize,
}

#[derive(Debug, Default)]
struct TelemetryInner {
    counters: OpsCounters,
    operations: HashMap<String, usize>,
}

/// Process-wide counters plus duration observation with a slow-operation
/// log line. Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct OpsTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
    slow_op_threshold: Duration,
}

impl Default for OpsTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl OpsTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_slow_op_threshold(Duration::from_millis(500))
    }

    #[must_use]
    pub fn with_slow_op_threshold(slow_op_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TelemetryInner::default())),
            slow_op_threshold,
        }
    }

    fn update<F>(&self, updater: F)
    where
        F: FnOnce(&mut TelemetryInner),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner);
        }
    }

    pub fn record_request(&self) {
        self.update(|inner| inner.counters.requests_total += 1);
    }

    pub fn record_audit_enqueue_failure(&self) {
        self.update(|inner| inner.counters.audit_enqueue_failures += 1);
    }

    pub fn record_audit_sync_fallback(&self) {
        self.update(|inner| inner.counters.audit_sync_fallbacks += 1);
    }

    pub fn record_audit_dead_letter(&self) {
        self.update(|inner| inner.counters.audit_dead_letters += 1);
    }

    pub fn record_outbox_publish_failure(&self) {
        self.update(|inner| inner.counters.outbox_publish_failures += 1);
    }

    pub fn record_outbox_exhausted(&self) {
        self.update(|inner| inner.counters.outbox_exhausted += 1);
    }

    pub fn record_payout_gateway(&self, completed: bool) {
        self.update(|inner| {
            if completed {
                inner.counters.payout_gateway_completed += 1;
            } else {
                inner.counters.payout_gateway_failed += 1;
            }
        });
    }

    pub fn record_rate_limit_delay(&self) {
        self.update(|inner| inner.counters.rate_limit_delays += 1);
    }

    pub fn record_rate_limit_block(&self) {
        self.update(|inner| inner.counters.rate_limit_blocks += 1);
    }

    pub fn record_job_exhausted(&self) {
        self.update(|inner| inner.counters.jobs_exhausted += 1);
    }

    pub fn record_webhook_delivery_failed(&self) {
        self.update(|inner| inner.counters.webhook_deliveries_failed += 1);
    }

    /// Records an operation duration. Crossing the slow threshold emits a
    /// warning with the operation name so slow queries surface in logs
    /// without a profiler attached.
    pub fn observe_duration(&self, operation: &str, duration: Duration) {
        self.update(|inner| {
            *inner.operations.entry(operation.to_string()).or_default() += 1;
            if duration > self.slow_op_threshold {
                inner.counters.slow_operations += 1;
            }
        });
        if duration > self.slow_op_threshold {
            warn!(
                operation,
                elapsed_ms = duration.as_millis() as u64,
                threshold_ms = self.slow_op_threshold.as_millis() as u64,
                "slow operation"
            );
        } else {
            debug!(
                operation,
                elapsed_ms = duration.as_millis() as u64,
                "operation complete"
            );
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> OpsCounters {
        self.inner
            .lock()
            .map(|inner| inner.counters.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn operation_count(&self, operation: &str) -> usize {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.operations.get(operation).copied())
            .unwrap_or(0)
    }
}

/// Correlation id for a unit of work: the caller-provided header value
/// when present and non-empty, a fresh uuid otherwise.
#[must_use]
pub fn correlation_id_from(header: Option<&str>) -> String {
    match header.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counters_accumulate() {
        let telemetry = OpsTelemetry::new();
        telemetry.record_request();
        telemetry.record_request();
        telemetry.record_audit_enqueue_failure();
        telemetry.record_payout_gateway(true);
        telemetry.record_payout_gateway(false);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.audit_enqueue_failures, 1);
        assert_eq!(snapshot.payout_gateway_completed, 1);
        assert_eq!(snapshot.payout_gateway_failed, 1);
    }

    #[test]
    fn slow_operations_are_counted() {
        let telemetry = OpsTelemetry::with_slow_op_threshold(Duration::from_millis(10));
        telemetry.observe_duration("finance.create_transaction", Duration::from_millis(5));
        telemetry.observe_duration("finance.create_transaction", Duration::from_millis(50));

        assert_eq!(telemetry.snapshot().slow_operations, 1);
        assert_eq!(telemetry.operation_count("finance.create_transaction"), 2);
    }

    #[test]
    fn correlation_id_prefers_the_header() {
        assert_eq!(correlation_id_from(Some("  req-7  ")), "req-7");
        let generated = correlation_id_from(Some("   "));
        assert_eq!(generated.len(), 36);
        let fresh = correlation_id_from(None);
        assert_ne!(fresh, generated);
    }
}
