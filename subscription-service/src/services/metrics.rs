//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle transitions, sweeps, usage and gateway calls.

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
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Payment gateway call duration histogram
pub static GATEWAY_CALL_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_gateway_call_duration_seconds",
            "Payment gateway call duration",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        ),
        &["operation"]
    )
    .expect("Failed to register GATEWAY_CALL_DURATION")
});

/// Sweep duration histogram
pub static SWEEP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_sweep_duration_seconds",
            "Scheduled sweep duration",
            vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
        ),
        &["sweep"]
    )
    .expect("Failed to register SWEEP_DURATION")
});

/// Subscription state transitions
pub static SUBSCRIPTION_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep runs by outcome
pub static SWEEP_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscriptions processed by sweeps, by result
pub static SWEEP_ITEMS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage units recorded
pub static USAGE_RECORDED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Gateway calls by operation and outcome
pub static GATEWAY_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notifications by template and outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Captured amount by currency and transaction type
pub static CHARGE_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    SUBSCRIPTION_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_transitions_total",
                "Subscription status transitions"
            ),
            &["from", "to"]
        )
        .expect("Failed to register SUBSCRIPTION_TRANSITIONS_TOTAL")
    });

    SWEEP_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_sweep_runs_total", "Sweep runs by outcome"),
            &["sweep", "status"]
        )
        .expect("Failed to register SWEEP_RUNS_TOTAL")
    });

    SWEEP_ITEMS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_sweep_items_total",
                "Subscriptions processed by sweeps"
            ),
            &["sweep", "result"]
        )
        .expect("Failed to register SWEEP_ITEMS_TOTAL")
    });

    USAGE_RECORDED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_usage_recorded_total", "Usage units recorded"),
            &["kind"]
        )
        .expect("Failed to register USAGE_RECORDED_TOTAL")
    });

    GATEWAY_CALLS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_gateway_calls_total",
                "Payment gateway calls by outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register GATEWAY_CALLS_TOTAL")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_notifications_total",
                "Notifications dispatched by template"
            ),
            &["template", "outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_errors_total",
                "Total errors by type for alerting"
            ),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    CHARGE_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "subscription_charge_amount_total",
                "Captured amount by currency and transaction type"
            ),
            &["currency", "transaction_type"]
        )
        .expect("Failed to register CHARGE_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
    let _ = &*GATEWAY_CALL_DURATION;
    let _ = &*SWEEP_DURATION;
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

/// Record a subscription status transition.
pub fn record_transition(from: &str, to: &str) {
    if let Some(counter) = SUBSCRIPTION_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

/// Record a completed sweep.
pub fn record_sweep_run(sweep: &str, status: &str) {
    if let Some(counter) = SWEEP_RUNS_TOTAL.get() {
        counter.with_label_values(&[sweep, status]).inc();
    }
}

/// Record the result for one subscription within a sweep.
pub fn record_sweep_item(sweep: &str, result: &str) {
    if let Some(counter) = SWEEP_ITEMS_TOTAL.get() {
        counter.with_label_values(&[sweep, result]).inc();
    }
}

/// Record usage units.
pub fn record_usage(kind: &str, count: i64) {
    if let Some(counter) = USAGE_RECORDED_TOTAL.get() {
        counter
            .with_label_values(&[kind])
            .inc_by(count.max(0) as u64);
    }
}

/// Record a gateway call outcome.
pub fn record_gateway_call(operation: &str, outcome: &str) {
    if let Some(counter) = GATEWAY_CALLS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record a notification delivery attempt.
pub fn record_notification(template: &str, outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[template, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

/// Record a captured amount.
pub fn record_charge_amount(currency: &str, transaction_type: &str, amount: f64) {
    if let Some(counter) = CHARGE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, transaction_type])
            .inc_by(amount);
    }
}
