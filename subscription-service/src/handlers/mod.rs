//! HTTP handlers for subscription-service.
//!
//! Merchant-facing operations are called in-process by the host
//! application; this router carries health, metrics, the payment webhook
//! and operator triggers for the sweeps.

pub mod health;
pub mod sweeps;
pub mod usage;
pub mod webhooks;

use crate::startup::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_handler))
        .route("/webhooks/tap", post(webhooks::tap_webhook))
        .route("/internal/sweeps/expiry", post(sweeps::run_expiry))
        .route("/internal/sweeps/reminders", post(sweeps::run_reminders))
        .route("/internal/sweeps/renewals", post(sweeps::run_renewals))
        .route("/internal/sweeps/usage-alerts", post(sweeps::run_usage_alerts))
        .route("/merchants/:merchant_id/usage", get(usage::get_usage))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}
