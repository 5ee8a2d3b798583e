//! Error type for subscription-service.

use crate::services::gateway::GatewayError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = BillingError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Merchant {merchant_id} already has a live subscription")]
    AlreadySubscribed { merchant_id: Uuid },

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Plan is not available for new subscriptions: {0}")]
    PlanInactive(Uuid),

    #[error("Merchant {0} has no active subscription")]
    NoActiveSubscription(Uuid),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Payment transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Invalid plan change: {0}")]
    InvalidPlanChange(String),

    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Payment rejected by gateway: {0}")]
    GatewayRejected(String),

    #[error("Payment gateway did not respond in time")]
    GatewayTimeout,

    #[error("Payment outcome unknown: {0}")]
    GatewayIndeterminate(String),

    #[error("Subscription {subscription_id} was modified concurrently")]
    ConcurrentModification { subscription_id: Uuid },

    #[error("Subscription {subscription_id} cannot move from {from} to {to}")]
    InvalidTransition {
        subscription_id: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::AlreadySubscribed { .. } => "already_subscribed",
            BillingError::PlanNotFound(_) => "plan_not_found",
            BillingError::PlanInactive(_) => "plan_inactive",
            BillingError::NoActiveSubscription(_) => "no_active_subscription",
            BillingError::SubscriptionNotFound(_) => "subscription_not_found",
            BillingError::TransactionNotFound(_) => "transaction_not_found",
            BillingError::InvalidPlanChange(_) => "invalid_plan_change",
            BillingError::InvalidUsage(_) => "invalid_usage",
            BillingError::GatewayUnavailable(_) => "gateway_unavailable",
            BillingError::GatewayRejected(_) => "gateway_rejected",
            BillingError::GatewayTimeout => "gateway_timeout",
            BillingError::GatewayIndeterminate(_) => "gateway_indeterminate",
            BillingError::ConcurrentModification { .. } => "concurrent_modification",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::InvalidSignature => "invalid_signature",
            BillingError::BadRequest(_) => "bad_request",
            BillingError::Database(_) => "database",
            BillingError::Config(_) => "config",
            BillingError::Internal(_) => "internal",
        }
    }

}

impl From<GatewayError> for BillingError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(reason) => BillingError::GatewayUnavailable(reason),
            GatewayError::Rejected(reason) => BillingError::GatewayRejected(reason),
            GatewayError::Timeout => BillingError::GatewayTimeout,
            GatewayError::Indeterminate(reason) => BillingError::GatewayIndeterminate(reason),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(anyhow::Error::new(err))
    }
}

impl From<config::ConfigError> for BillingError {
    fn from(err: config::ConfigError) -> Self {
        BillingError::Config(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for BillingError {
    fn from(err: std::io::Error) -> Self {
        BillingError::Internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details) = match &self {
            BillingError::AlreadySubscribed { .. }
            | BillingError::ConcurrentModification { .. }
            | BillingError::InvalidTransition { .. } => {
                (StatusCode::CONFLICT, self.to_string(), None)
            }
            BillingError::PlanNotFound(_)
            | BillingError::NoActiveSubscription(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::TransactionNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string(), None)
            }
            BillingError::PlanInactive(_)
            | BillingError::InvalidPlanChange(_)
            | BillingError::InvalidUsage(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), None)
            }
            BillingError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string(), None),
            BillingError::InvalidSignature => (StatusCode::UNAUTHORIZED, self.to_string(), None),
            BillingError::GatewayRejected(reason) => (
                StatusCode::PAYMENT_REQUIRED,
                "Payment rejected".to_string(),
                Some(reason.clone()),
            ),
            BillingError::GatewayUnavailable(reason) => (
                StatusCode::BAD_GATEWAY,
                "Payment gateway unavailable".to_string(),
                Some(reason.clone()),
            ),
            BillingError::GatewayTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "Payment gateway timeout".to_string(),
                None,
            ),
            BillingError::GatewayIndeterminate(reason) => (
                StatusCode::BAD_GATEWAY,
                "Payment outcome unknown".to_string(),
                Some(reason.clone()),
            ),
            BillingError::Database(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
            ),
            BillingError::Config(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
            ),
            BillingError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(format!("{:#}", err)),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}
