//! Usage meter.
//!
//! Counters live on the subscription's current [`UsagePeriod`]. Increments
//! are atomic adds in the store; period rollover is a compare-and-swap on
//! `next_reset_at`, so concurrent or repeated resets zero a window once.

use crate::error::{BillingError, Result};
use crate::models::{
    LimitCheck, Subscription, UsageKind, UsageMetric, UsagePeriod, UsageReport,
};
use crate::services::catalog::PlanCatalog;
use crate::services::clock::Clock;
use crate::services::metrics::record_usage;
use crate::services::store::SubscriptionStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn SubscriptionStore>,
    catalog: PlanCatalog,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        catalog: PlanCatalog,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    async fn live_subscription(&self, merchant_id: Uuid) -> Result<Subscription> {
        self.store
            .find_live_subscription(merchant_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(merchant_id))
    }

    /// Add `count` units of `kind` to the merchant's current period.
    #[instrument(skip(self), fields(merchant_id = %merchant_id, kind = kind.as_str()))]
    pub async fn record_usage(
        &self,
        merchant_id: Uuid,
        kind: UsageKind,
        count: i64,
    ) -> Result<UsagePeriod> {
        if count <= 0 {
            return Err(BillingError::InvalidUsage(format!(
                "count must be positive, got {}",
                count
            )));
        }

        let subscription = self.live_subscription(merchant_id).await?;
        self.current_period(&subscription).await?;

        let period = self
            .store
            .increment_usage(subscription.subscription_id, kind, count)
            .await?
            .ok_or(BillingError::NoActiveSubscription(merchant_id))?;

        record_usage(kind.as_str(), count);
        debug!(used = period.used(kind), "Usage recorded");
        Ok(period)
    }

    /// Usage against plan quotas for the current period.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn get_usage(&self, merchant_id: Uuid) -> Result<UsageReport> {
        let subscription = self.live_subscription(merchant_id).await?;
        self.report_for(&subscription).await
    }

    /// Usage report for a known subscription.
    pub(crate) async fn report_for(&self, subscription: &Subscription) -> Result<UsageReport> {
        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        let (period, _) = self.current_period(subscription).await?;

        let metric =
            |kind: UsageKind| UsageMetric::new(period.used(kind), plan.quotas.for_kind(kind));

        Ok(UsageReport {
            merchant_id: subscription.merchant_id,
            subscription_id: subscription.subscription_id,
            conversations: metric(UsageKind::Conversation),
            messages: metric(UsageKind::Message),
            voice_messages: metric(UsageKind::VoiceMessage),
            period_start: period.period_start,
            period_end: period.period_end,
            last_reset_at: period.last_reset_at,
            next_reset_at: period.next_reset_at,
        })
    }

    /// Whether one more unit of `kind` fits in the quota.
    pub async fn check_limit(&self, merchant_id: Uuid, kind: UsageKind) -> Result<LimitCheck> {
        let subscription = self.live_subscription(merchant_id).await?;
        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        let (period, _) = self.current_period(&subscription).await?;

        let quota = plan.quotas.for_kind(kind);
        let used = period.used(kind);
        Ok(LimitCheck {
            kind,
            allowed: !quota.is_exhausted(used),
            used,
            limit: quota.limit(),
        })
    }

    /// Roll the merchant's usage window forward if its boundary has passed.
    /// Returns whether this call performed the reset.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn reset_if_period_elapsed(&self, merchant_id: Uuid) -> Result<bool> {
        let subscription = self.live_subscription(merchant_id).await?;
        let (_, reset) = self.current_period(&subscription).await?;
        Ok(reset)
    }

    /// Start a zeroed window for `subscription` at `start`, ending on the
    /// next anchored boundary.
    pub async fn open_period(
        &self,
        subscription: &Subscription,
        start: DateTime<Utc>,
    ) -> Result<UsagePeriod> {
        let end = subscription
            .billing_cycle
            .next_boundary(subscription.billing_anchor, start);
        let period = UsagePeriod::with_window(
            subscription.subscription_id,
            subscription.merchant_id,
            start,
            end,
        );
        self.store.replace_usage_period(&period).await?;
        Ok(period)
    }

    /// The subscription's period as of now, rolling it over when elapsed.
    pub(crate) async fn current_period(
        &self,
        subscription: &Subscription,
    ) -> Result<(UsagePeriod, bool)> {
        let now = self.clock.now();
        let period = match self
            .store
            .get_usage_period(subscription.subscription_id)
            .await?
        {
            Some(period) => period,
            None => {
                let (start, _) = subscription
                    .billing_cycle
                    .window_containing(subscription.billing_anchor, now);
                self.open_period(subscription, start).await?
            }
        };

        let Some((start, end)) =
            period.next_window(subscription.billing_cycle, subscription.billing_anchor, now)
        else {
            return Ok((period, false));
        };

        let reset = self
            .store
            .reset_usage_period(
                subscription.subscription_id,
                period.next_reset_at,
                start,
                end,
                now,
            )
            .await?;

        if reset {
            info!(
                subscription_id = %subscription.subscription_id,
                period_start = %start,
                period_end = %end,
                "Usage period reset"
            );
        }

        let current = self
            .store
            .get_usage_period(subscription.subscription_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(subscription.merchant_id))?;
        Ok((current, reset))
    }
}
