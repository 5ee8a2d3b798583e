//! Notification dispatch.
//!
//! Delivery is best effort: [`dispatch`] logs and counts failures and never
//! returns them, so a dead notification channel cannot block a state change.

use crate::services::metrics::record_notification;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type NotificationVars = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    ExpiryReminder,
    RenewalUpcoming,
    SubscriptionExpired,
    SubscriptionCancelled,
    SubscriptionActivated,
    RenewalSucceeded,
    RenewalFailed,
    PaymentFailed,
    UsageWarning,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::ExpiryReminder => "expiry_reminder",
            NotificationTemplate::RenewalUpcoming => "renewal_upcoming",
            NotificationTemplate::SubscriptionExpired => "subscription_expired",
            NotificationTemplate::SubscriptionCancelled => "subscription_cancelled",
            NotificationTemplate::SubscriptionActivated => "subscription_activated",
            NotificationTemplate::RenewalSucceeded => "renewal_succeeded",
            NotificationTemplate::RenewalFailed => "renewal_failed",
            NotificationTemplate::PaymentFailed => "payment_failed",
            NotificationTemplate::UsageWarning => "usage_warning",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification endpoint returned {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        merchant_id: Uuid,
        template: NotificationTemplate,
        variables: &NotificationVars,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        merchant_id: Uuid,
        template: NotificationTemplate,
        variables: &NotificationVars,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            merchant_id = %merchant_id,
            template = template.as_str(),
            variables = ?variables,
            "Notification"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    merchant_id: Uuid,
    template: &'static str,
    variables: &'a NotificationVars,
}

/// Posts notifications as JSON to a dispatch endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(
        &self,
        merchant_id: Uuid,
        template: NotificationTemplate,
        variables: &NotificationVars,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                merchant_id,
                template: template.as_str(),
                variables,
            })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Deliver with a deadline. Failures are logged and counted, never returned.
pub async fn dispatch(
    notifier: &dyn Notifier,
    timeout: Duration,
    merchant_id: Uuid,
    template: NotificationTemplate,
    variables: NotificationVars,
) {
    let outcome = tokio::time::timeout(
        timeout,
        notifier.deliver(merchant_id, template, &variables),
    )
    .await;

    match outcome {
        Ok(Ok(())) => record_notification(template.as_str(), "delivered"),
        Ok(Err(e)) => {
            tracing::warn!(
                merchant_id = %merchant_id,
                template = template.as_str(),
                error = %e,
                "Notification delivery failed"
            );
            record_notification(template.as_str(), "failed");
        }
        Err(_) => {
            tracing::warn!(
                merchant_id = %merchant_id,
                template = template.as_str(),
                "Notification delivery timed out"
            );
            record_notification(template.as_str(), "timeout");
        }
    }
}
