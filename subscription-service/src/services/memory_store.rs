//! In-memory [`SubscriptionStore`] for tests and local runs.
//!
//! All state sits behind one lock, so every check-and-write happens under a
//! single guard and the store upholds the same guarantees as Postgres.

use crate::error::{BillingError, Result};
use crate::models::{
    PaymentTransaction, Plan, PlanChange, Subscription, TransactionStatus, TransactionType,
    UsageAlert, UsageKind, UsagePeriod,
};
use crate::services::store::{check_transition, version_conflict, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: HashMap<Uuid, UsagePeriod>,
    transactions: HashMap<Uuid, PaymentTransaction>,
    usage_alerts: HashMap<(Uuid, UsageKind), UsageAlert>,
    plan_changes: Vec<PlanChange>,
}

impl State {
    fn live_for(&self, merchant_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.merchant_id == merchant_id && s.status.is_live())
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Every transaction, oldest first.
    pub fn transactions(&self) -> Vec<PaymentTransaction> {
        let mut all: Vec<_> = self.read().transactions.values().cloned().collect();
        all.sort_by_key(|t| t.created_utc);
        all
    }

    /// Every subscription a merchant ever had, oldest first.
    pub fn subscriptions_for(&self, merchant_id: Uuid) -> Vec<Subscription> {
        let mut all: Vec<_> = self
            .read()
            .subscriptions
            .values()
            .filter(|s| s.merchant_id == merchant_id)
            .cloned()
            .collect();
        all.sort_by_key(|s| s.created_utc);
        all
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        Ok(self.read().plans.get(&plan_id).cloned())
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        let mut plans: Vec<_> = self
            .read()
            .plans
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| {
            a.monthly_price
                .cmp(&b.monthly_price)
                .then(a.sort_order.cmp(&b.sort_order))
        });
        Ok(plans)
    }

    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        self.write().plans.insert(plan.plan_id, plan.clone());
        Ok(())
    }

    async fn save_plan_changes(&self, plan: &Plan, changes: &[PlanChange]) -> Result<()> {
        let mut state = self.write();
        state.plans.insert(plan.plan_id, plan.clone());
        state.plan_changes.extend_from_slice(changes);
        Ok(())
    }

    async fn list_plan_changes(&self, plan_id: Option<Uuid>) -> Result<Vec<PlanChange>> {
        let mut changes: Vec<_> = self
            .read()
            .plan_changes
            .iter()
            .filter(|c| plan_id.map_or(true, |id| c.plan_id == id))
            .cloned()
            .collect();
        // Stable sort keeps one edit's fields in the order they were applied.
        changes.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(changes)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut state = self.write();
        if subscription.status.is_live() && state.live_for(subscription.merchant_id).is_some() {
            return Err(BillingError::AlreadySubscribed {
                merchant_id: subscription.merchant_id,
            });
        }
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.read().subscriptions.get(&subscription_id).cloned())
    }

    async fn find_live_subscription(&self, merchant_id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.read().live_for(merchant_id).cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Subscription> {
        let mut state = self.write();
        let id = subscription.subscription_id;

        let current = state
            .subscriptions
            .get(&id)
            .ok_or(BillingError::SubscriptionNotFound(id))?;
        if current.version != expected_version {
            return Err(version_conflict(id));
        }
        check_transition(id, current.status, subscription.status)?;

        if subscription.status.is_live() {
            if let Some(other) = state.live_for(subscription.merchant_id) {
                if other.subscription_id != id {
                    return Err(BillingError::AlreadySubscribed {
                        merchant_id: subscription.merchant_id,
                    });
                }
            }
        }

        let mut stored = subscription.clone();
        stored.version = expected_version + 1;
        state.subscriptions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn list_live_ending_before(&self, until: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let mut due: Vec<_> = self
            .read()
            .subscriptions
            .values()
            .filter(|s| s.status.is_live() && s.end_date <= until)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.end_date);
        Ok(due)
    }

    async fn list_live_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut live: Vec<_> = self
            .read()
            .subscriptions
            .values()
            .filter(|s| s.status.is_live())
            .cloned()
            .collect();
        live.sort_by_key(|s| s.created_utc);
        Ok(live)
    }

    async fn replace_usage_period(&self, period: &UsagePeriod) -> Result<()> {
        self.write()
            .usage
            .insert(period.subscription_id, period.clone());
        Ok(())
    }

    async fn get_usage_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>> {
        Ok(self.read().usage.get(&subscription_id).cloned())
    }

    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
        count: i64,
    ) -> Result<Option<UsagePeriod>> {
        let mut state = self.write();
        let Some(period) = state.usage.get_mut(&subscription_id) else {
            return Ok(None);
        };
        let counter = match kind {
            UsageKind::Conversation => &mut period.conversations_used,
            UsageKind::Message => &mut period.messages_used,
            UsageKind::VoiceMessage => &mut period.voice_messages_used,
        };
        *counter = counter.saturating_add(count);
        Ok(Some(period.clone()))
    }

    async fn reset_usage_period(
        &self,
        subscription_id: Uuid,
        expected_next_reset: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.write();
        match state.usage.get_mut(&subscription_id) {
            Some(period) if period.next_reset_at == expected_next_reset => {
                period.period_start = start;
                period.period_end = end;
                period.conversations_used = 0;
                period.messages_used = 0;
                period.voice_messages_used = 0;
                period.last_reset_at = reset_at;
                period.next_reset_at = end;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_usage_alert(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
    ) -> Result<Option<UsageAlert>> {
        Ok(self.read().usage_alerts.get(&(subscription_id, kind)).cloned())
    }

    async fn record_usage_alert(
        &self,
        alert: &UsageAlert,
        previous_sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.write();
        let key = (alert.subscription_id, alert.kind);
        let stored = state.usage_alerts.get(&key).map(|a| a.sent_at);
        if stored != previous_sent_at {
            return Ok(false);
        }
        state.usage_alerts.insert(key, alert.clone());
        Ok(true)
    }

    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> Result<()> {
        let mut state = self.write();
        if let Some(charge_id) = &transaction.gateway_charge_id {
            if state
                .transactions
                .values()
                .any(|t| t.gateway_charge_id.as_deref() == Some(charge_id.as_str()))
            {
                return Err(BillingError::BadRequest(format!(
                    "charge {} already recorded",
                    charge_id
                )));
            }
        }
        state
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>> {
        Ok(self.read().transactions.get(&transaction_id).cloned())
    }

    async fn find_transaction_by_charge(
        &self,
        charge_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .read()
            .transactions
            .values()
            .find(|t| t.gateway_charge_id.as_deref() == Some(charge_id))
            .cloned())
    }

    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.write();
        match state.transactions.get_mut(&transaction_id) {
            Some(tx) if tx.status == expected => {
                tx.status = next;
                tx.updated_utc = at;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::TransactionNotFound(transaction_id.to_string())),
        }
    }

    async fn set_gateway_charge_id(
        &self,
        transaction_id: Uuid,
        charge_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.write();
        let tx = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;
        tx.gateway_charge_id = Some(charge_id.to_string());
        tx.updated_utc = at;
        Ok(())
    }

    async fn link_transaction_subscription(
        &self,
        transaction_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<()> {
        let mut state = self.write();
        let tx = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;
        tx.subscription_id = Some(subscription_id);
        Ok(())
    }

    async fn list_pending_transactions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>> {
        let mut pending: Vec<_> = self
            .read()
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Pending && t.created_utc <= created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_utc);
        Ok(pending)
    }

    async fn find_pending_renewal(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentTransaction>> {
        Ok(self
            .read()
            .transactions
            .values()
            .find(|t| {
                t.subscription_id == Some(subscription_id)
                    && t.transaction_type == TransactionType::Renewal
                    && t.status == TransactionStatus::Pending
            })
            .cloned())
    }
}
