use crate::error::Result;
use crate::models::UsageReport;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

pub async fn get_usage(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
) -> Result<Json<UsageReport>> {
    let report = state.manager.usage().get_usage(merchant_id).await?;
    Ok(Json(report))
}
