//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Operations**: Requests served per route
//! - **Subscriptions**: Active subscriptions and cancellation outcomes
//! - **Streams**: Quotes emitted, stream errors and abandoned streams
//! - **Connections**: Open WebSocket connections
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until `init_metrics` installs the recorder, so
//! tests can exercise instrumented code without setup.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "quote_service_operations_total",
        "Total requests served by route"
    );
    describe_counter!(
        "quote_service_cancellations_total",
        "Total cancellations by path and outcome"
    );
    describe_counter!(
        "quote_service_quotes_emitted_total",
        "Total quotes sent on streams and channels"
    );
    describe_counter!(
        "quote_service_stream_errors_total",
        "Total streams terminated with an error"
    );
    describe_counter!(
        "quote_service_streams_abandoned_total",
        "Total streams cancelled or disconnected before completion"
    );

    describe_gauge!(
        "quote_service_active_subscriptions",
        "Number of active subscriptions"
    );
    describe_gauge!(
        "quote_service_connections",
        "Number of open WebSocket connections"
    );

    describe_histogram!(
        "quote_service_stream_duration_seconds",
        "Lifetime of streams from request to termination"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for the two cancel operations.
#[derive(Debug, Clone, Copy)]
pub enum CancelPath {
    /// Cancel that reports its outcome.
    Confirmed,
    /// Fire-and-forget cancel.
    Unconfirmed,
}

impl CancelPath {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Unconfirmed => "unconfirmed",
        }
    }
}

const fn outcome_label(cancelled: bool) -> &'static str {
    if cancelled { "cancelled" } else { "error" }
}

/// Record a request served on `route`.
pub fn record_operation(route: &'static str) {
    counter!("quote_service_operations_total", "route" => route).increment(1);
}

/// Record a cancellation attempt and whether it removed a subscription.
pub fn record_cancellation(path: CancelPath, cancelled: bool) {
    counter!(
        "quote_service_cancellations_total",
        "path" => path.as_str(),
        "outcome" => outcome_label(cancelled)
    )
    .increment(1);
}

/// Record a quote sent on `route`.
pub fn record_quote_emitted(route: &'static str) {
    counter!("quote_service_quotes_emitted_total", "route" => route).increment(1);
}

/// Record a stream on `route` terminated with error `code`.
pub fn record_stream_error(route: &'static str, code: &'static str) {
    counter!(
        "quote_service_stream_errors_total",
        "route" => route,
        "code" => code
    )
    .increment(1);
}

/// Record a stream on `route` stopped before completion.
pub fn record_stream_abandoned(route: &'static str) {
    counter!("quote_service_streams_abandoned_total", "route" => route).increment(1);
}

/// Record how long a stream on `route` was live.
pub fn record_stream_duration(route: &'static str, duration: Duration) {
    histogram!(
        "quote_service_stream_duration_seconds",
        "route" => route
    )
    .record(duration.as_secs_f64());
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("quote_service_active_subscriptions").set(count as f64);
}

/// Update the open connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(count: usize) {
    gauge!("quote_service_connections").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_path_as_str() {
        assert_eq!(CancelPath::Confirmed.as_str(), "confirmed");
        assert_eq!(CancelPath::Unconfirmed.as_str(), "unconfirmed");
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(outcome_label(true), "cancelled");
        assert_eq!(outcome_label(false), "error");
    }

    #[test]
    fn recording_without_recorder_is_noop() {
        record_operation("subscribe");
        record_cancellation(CancelPath::Unconfirmed, false);
        record_quote_emitted("get-all-quotes");
        record_stream_error("get-random-quotes", "OUT_OF_RANGE");
        record_stream_abandoned("get-all-quotes");
        record_stream_duration("get-all-quotes", Duration::from_millis(5));
        set_active_subscriptions(3);
        set_connections(1);
    }
}
