//! Metrics module for merchant-billing-service.
//! Provides Prometheus metrics for redemptions, subscription transitions and store visibility.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "merchant_billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// HTTP request counter
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Redemption attempts by voucher type and outcome code
pub static REDEMPTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Auto-switch evaluations by resulting action
pub static AUTO_SWITCH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Store open/close toggles actually applied
pub static STORE_VISIBILITY_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("merchant_billing_http_requests_total", "Total HTTP requests"),
            &["method", "status"]
        )
        .expect("Failed to register HTTP_REQUESTS_TOTAL")
    });

    REDEMPTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "merchant_billing_redemptions_total",
                "Voucher redemption attempts by type and outcome"
            ),
            &["voucher_type", "outcome"]
        )
        .expect("Failed to register REDEMPTIONS_TOTAL")
    });

    AUTO_SWITCH_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "merchant_billing_auto_switch_total",
                "Subscription auto-switch evaluations by action"
            ),
            &["action"]
        )
        .expect("Failed to register AUTO_SWITCH_TOTAL")
    });

    STORE_VISIBILITY_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "merchant_billing_store_visibility_total",
                "Store visibility changes applied by billing transitions"
            ),
            &["change"]
        )
        .expect("Failed to register STORE_VISIBILITY_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "merchant_billing_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, status: &str) {
    if let Some(counter) = HTTP_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

/// Record a redemption attempt. `outcome` is `SUCCESS` or the rejection code.
pub fn record_redemption(voucher_type: &str, outcome: &str) {
    if let Some(counter) = REDEMPTIONS_TOTAL.get() {
        counter.with_label_values(&[voucher_type, outcome]).inc();
    }
}

/// Record an auto-switch evaluation.
pub fn record_auto_switch(action: &str) {
    if let Some(counter) = AUTO_SWITCH_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

/// Record a store visibility change (`opened` or `closed`).
pub fn record_store_visibility(change: &str) {
    if let Some(counter) = STORE_VISIBILITY_TOTAL.get() {
        counter.with_label_values(&[change]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
