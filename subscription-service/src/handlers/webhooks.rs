//! Tap payment webhook.
//!
//! Tap signs the raw body with the webhook secret (hex HMAC-SHA256 in
//! `x-tap-signature`). Unknown charges are acknowledged so Tap stops
//! retrying; store failures return 5xx so it retries later.

use crate::error::BillingError;
use crate::services::gateway::{map_tap_status, verify_webhook_signature};
use crate::services::CallbackOutcome;
use crate::startup::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SIGNATURE_HEADER: &str = "x-tap-signature";

#[derive(Debug, Deserialize)]
pub struct TapChargeEvent {
    pub id: String,
    pub status: String,
}

pub async fn tap_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Value>), BillingError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Missing webhook signature header");
            BillingError::InvalidSignature
        })?;

    if !verify_webhook_signature(
        body.as_bytes(),
        signature,
        state.webhook_secret.expose_secret(),
    ) {
        tracing::warn!("Invalid webhook signature");
        return Err(BillingError::InvalidSignature);
    }

    let event: TapChargeEvent = serde_json::from_str(&body).map_err(|e| {
        tracing::warn!(error = %e, "Failed to parse webhook payload");
        BillingError::BadRequest("invalid webhook payload".to_string())
    })?;

    let status = map_tap_status(&event.status);
    tracing::info!(
        charge_id = %event.id,
        tap_status = %event.status,
        status = status.as_str(),
        "Processing Tap webhook"
    );

    match state
        .manager
        .handle_payment_callback(&event.id, status)
        .await
    {
        Ok(outcome) => {
            if let CallbackOutcome::Ignored { reason, .. } = &outcome {
                tracing::debug!(charge_id = %event.id, reason = %reason, "Webhook ignored");
            }
            Ok((StatusCode::OK, Json(json!(outcome))))
        }
        Err(BillingError::TransactionNotFound(_)) => {
            tracing::warn!(charge_id = %event.id, "Webhook for unknown charge");
            Ok((
                StatusCode::OK,
                Json(json!({ "result": "ignored", "reason": "unknown charge" })),
            ))
        }
        Err(e) => {
            tracing::error!(charge_id = %event.id, error = %e, "Failed to apply webhook");
            Err(e)
        }
    }
}
