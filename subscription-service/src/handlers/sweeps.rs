//! Manual sweep triggers. Same code paths as the scheduled runs.

use crate::error::Result;
use crate::services::{ReminderSummary, SweepSummary, UsageAlertSummary};
use crate::startup::AppState;
use axum::{extract::State, Json};

pub async fn run_expiry(State(state): State<AppState>) -> Result<Json<SweepSummary>> {
    tracing::info!("Expiry sweep triggered manually");
    Ok(Json(state.manager.run_expiry_sweep().await?))
}

pub async fn run_reminders(State(state): State<AppState>) -> Result<Json<ReminderSummary>> {
    tracing::info!("Reminder sweep triggered manually");
    Ok(Json(state.manager.run_reminder_sweep().await?))
}

pub async fn run_renewals(State(state): State<AppState>) -> Result<Json<SweepSummary>> {
    tracing::info!("Renewal sweep triggered manually");
    Ok(Json(state.manager.run_renewal_sweep().await?))
}

pub async fn run_usage_alerts(State(state): State<AppState>) -> Result<Json<UsageAlertSummary>> {
    tracing::info!("Usage alert sweep triggered manually");
    Ok(Json(state.manager.run_usage_alert_sweep().await?))
}
