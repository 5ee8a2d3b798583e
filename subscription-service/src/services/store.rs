//! Storage seam for plans, subscriptions, usage periods and transactions.
//!
//! Implementations must keep these guarantees under concurrent callers:
//!
//! - at most one subscription per merchant in `trial`/`active`
//!   ([`SubscriptionStore::insert_subscription`] and
//!   [`SubscriptionStore::update_subscription`] fail with
//!   [`BillingError::AlreadySubscribed`] otherwise);
//! - subscription updates are compare-and-swap on `version` and never move
//!   a status along an edge the state machine forbids
//!   ([`BillingError::InvalidTransition`]);
//! - usage increments are atomic adds, never read-modify-write;
//! - usage resets and transaction status changes only apply when the stored
//!   value still matches what the caller observed.

use crate::error::{BillingError, Result};
use crate::models::{
    PaymentTransaction, Plan, PlanChange, Subscription, SubscriptionStatus, TransactionStatus,
    UsageAlert, UsageKind, UsagePeriod,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    // Plans

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>>;

    /// Active plans, cheapest monthly price first, then `sort_order`.
    async fn list_active_plans(&self) -> Result<Vec<Plan>>;

    /// Insert or replace a plan definition.
    async fn upsert_plan(&self, plan: &Plan) -> Result<()>;

    /// Save an edited plan together with its audit records, atomically.
    async fn save_plan_changes(&self, plan: &Plan, changes: &[PlanChange]) -> Result<()>;

    /// Plan audit records, newest first; all plans when `plan_id` is `None`.
    async fn list_plan_changes(&self, plan_id: Option<Uuid>) -> Result<Vec<PlanChange>>;

    // Subscriptions

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;

    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>>;

    /// The merchant's `trial`/`active` subscription, if any.
    async fn find_live_subscription(&self, merchant_id: Uuid) -> Result<Option<Subscription>>;

    /// Write `subscription` if the stored version still equals
    /// `expected_version`. Returns the stored row with its bumped version.
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Subscription>;

    /// Live subscriptions whose `end_date` is at or before `until`.
    async fn list_live_ending_before(&self, until: DateTime<Utc>) -> Result<Vec<Subscription>>;

    /// Every `trial`/`active` subscription.
    async fn list_live_subscriptions(&self) -> Result<Vec<Subscription>>;

    // Usage

    /// Insert the period for a subscription, replacing any previous one.
    async fn replace_usage_period(&self, period: &UsagePeriod) -> Result<()>;

    async fn get_usage_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>>;

    /// Atomically add `count` to one counter. `None` when no period exists.
    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
        count: i64,
    ) -> Result<Option<UsagePeriod>>;

    /// Zero the counters and move the window to `start..end`, but only if
    /// the stored `next_reset_at` still equals `expected_next_reset`.
    /// Returns whether this call performed the reset.
    async fn reset_usage_period(
        &self,
        subscription_id: Uuid,
        expected_next_reset: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Last usage warning sent for a subscription and kind.
    async fn get_usage_alert(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
    ) -> Result<Option<UsageAlert>>;

    /// Store `alert` as the latest warning, but only if the stored one was
    /// sent at `previous_sent_at` (`None`: no warning stored yet). Returns
    /// whether this call recorded it.
    async fn record_usage_alert(
        &self,
        alert: &UsageAlert,
        previous_sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    // Payment transactions

    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> Result<()>;

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>>;

    async fn find_transaction_by_charge(
        &self,
        charge_id: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// Move a transaction from `expected` to `next`. Returns `false` when the
    /// stored status no longer equals `expected`.
    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn set_gateway_charge_id(
        &self,
        transaction_id: Uuid,
        charge_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Attach a transaction to the subscription it produced.
    async fn link_transaction_subscription(
        &self,
        transaction_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<()>;

    /// Pending transactions created at or before `created_before`.
    async fn list_pending_transactions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>>;

    /// The pending renewal transaction for a subscription, if one exists.
    async fn find_pending_renewal(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentTransaction>>;

    /// Readiness check.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Error for a write that would break the subscription state machine.
/// Rewriting the same status is always allowed.
pub(crate) fn check_transition(
    subscription_id: Uuid,
    from: SubscriptionStatus,
    to: SubscriptionStatus,
) -> Result<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            subscription_id,
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Error for a compare-and-swap miss on a subscription.
pub(crate) fn version_conflict(subscription_id: Uuid) -> BillingError {
    BillingError::ConcurrentModification { subscription_id }
}
