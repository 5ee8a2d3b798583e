//! Subscription lifecycle manager.
//!
//! Owns the per-merchant state machine (`trial → active → expired |
//! cancelled`), plan changes with proration, renewals, and the sweeps the
//! scheduler drives.
//!
//! Payment effects (activation, upgrade, renewal) are applied before the
//! transaction leaves `pending` and each one checks a guard on the current
//! subscription row, so a callback, a reconciliation and a retry can race
//! without applying the same payment twice. Subscription writes go through
//! the store's version check; sweeps additionally hold a per-subscription
//! lock so overlapping runs in one process skip rows already in flight.

use crate::config::LifecycleConfig;
use crate::error::{BillingError, Result};
use crate::models::{
    BillingCycle, CreateSubscription, CreateTransaction, PaymentTransaction, Plan, Subscription,
    SubscriptionStatus, TransactionMetadata, TransactionStatus, TransactionType, UsageAlert,
    UsageAlertPolicy,
};
use crate::services::catalog::PlanCatalog;
use crate::services::clock::Clock;
use crate::services::gateway::{
    ChargeCustomer, ChargeRequest, ChargeStatus, ConnectionTest, CreatedCharge, GatewayError,
    PaymentGateway,
};
use crate::services::metrics::{
    record_charge_amount, record_error, record_sweep_item, record_sweep_run, record_transition,
    SWEEP_DURATION,
};
use crate::services::notifier::{dispatch, NotificationTemplate, NotificationVars, Notifier};
use crate::services::proration::{prorate, Proration};
use crate::services::store::{check_transition, version_conflict, SubscriptionStore};
use crate::services::usage::UsageMeter;
use chrono::Duration;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Retries for payment effects that lose a version race.
const EFFECT_ATTEMPTS: usize = 3;

const SECONDS_PER_DAY: i64 = 86_400;

/// Result of [`SubscriptionManager::subscribe`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubscribeOutcome {
    /// The merchant must complete payment; the subscription is activated by
    /// the payment callback.
    PaymentRequired {
        transaction_id: Uuid,
        charge_id: String,
        payment_url: Option<String>,
    },
    /// Nothing to pay (free plan) or the charge settled synchronously.
    Activated { subscription: Subscription },
}

/// Result of [`SubscriptionManager::upgrade_subscription`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// Plan switched now. A negative net is absorbed, not refunded.
    Applied {
        subscription: Subscription,
        proration: Proration,
    },
    PaymentRequired {
        transaction_id: Uuid,
        charge_id: String,
        payment_url: Option<String>,
        proration: Proration,
    },
}

/// Result of one renewal attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RenewalOutcome {
    Renewed { subscription: Subscription },
    /// Charge outcome unknown; reconciled on a later sweep.
    Pending { transaction_id: Uuid },
    Failed { transaction_id: Uuid, reason: String },
    /// Payment recorded but the subscription had already moved on.
    Superseded { transaction_id: Uuid },
}

/// Result of [`SubscriptionManager::handle_payment_callback`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied {
        transaction_id: Uuid,
        status: TransactionStatus,
        subscription_id: Option<Uuid>,
    },
    Ignored {
        transaction_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub subscription_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub settled: usize,
    pub abandoned: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Aggregate result of an expiry or renewal sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub expired: usize,
    pub cancelled: usize,
    pub renewed: usize,
    pub pending: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconcileSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderSummary {
    pub checked: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageAlertSummary {
    pub checked: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

enum ItemOutcome {
    Expired,
    Cancelled,
    Renewed,
    Pending,
    RenewalFailed(String),
    Skipped,
}

impl From<RenewalOutcome> for ItemOutcome {
    fn from(outcome: RenewalOutcome) -> Self {
        match outcome {
            RenewalOutcome::Renewed { .. } => ItemOutcome::Renewed,
            RenewalOutcome::Pending { .. } => ItemOutcome::Pending,
            RenewalOutcome::Failed { reason, .. } => ItemOutcome::RenewalFailed(reason),
            RenewalOutcome::Superseded { .. } => ItemOutcome::Skipped,
        }
    }
}

impl SweepSummary {
    fn absorb(&mut self, sweep: &'static str, subscription_id: Uuid, result: Result<ItemOutcome>) {
        let label = match result {
            Ok(ItemOutcome::Expired) => {
                self.expired += 1;
                "expired"
            }
            Ok(ItemOutcome::Cancelled) => {
                self.cancelled += 1;
                "cancelled"
            }
            Ok(ItemOutcome::Renewed) => {
                self.renewed += 1;
                "renewed"
            }
            Ok(ItemOutcome::Pending) => {
                self.pending += 1;
                "pending"
            }
            Ok(ItemOutcome::Skipped) => {
                self.skipped += 1;
                "skipped"
            }
            Ok(ItemOutcome::RenewalFailed(reason)) => {
                self.failed += 1;
                self.failures.push(SweepFailure {
                    subscription_id,
                    reason,
                });
                "renewal_failed"
            }
            Err(e) => {
                warn!(sweep, subscription_id = %subscription_id, error = %e, "Sweep item failed");
                record_error(e.kind(), sweep);
                self.failed += 1;
                self.failures.push(SweepFailure {
                    subscription_id,
                    reason: e.to_string(),
                });
                "error"
            }
        };
        record_sweep_item(sweep, label);
    }
}

/// What applying a transaction status produced.
struct Settlement {
    applied: bool,
    status: TransactionStatus,
    subscription: Option<Subscription>,
}

enum Reconciled {
    StillPending,
    Settled(Settlement),
}

/// Async mutexes keyed by id.
#[derive(Default)]
struct KeyedLocks {
    slots: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    fn slot(&self, key: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(&*self.slots.entry(key).or_default())
    }

    async fn lock(&self, key: Uuid) -> OwnedMutexGuard<()> {
        self.slot(key).lock_owned().await
    }

    fn try_lock(&self, key: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drop slots nobody holds.
    fn prune(&self) {
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}

fn vars<const N: usize>(pairs: [(&str, String); N]) -> NotificationVars {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    catalog: PlanCatalog,
    usage: UsageMeter,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    redirect_url: String,
    subscription_locks: KeyedLocks,
    transaction_locks: KeyedLocks,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
        redirect_url: impl Into<String>,
    ) -> Self {
        let catalog = PlanCatalog::new(Arc::clone(&store), Arc::clone(&clock));
        let usage = UsageMeter::new(Arc::clone(&store), catalog.clone(), Arc::clone(&clock));
        Self {
            store,
            catalog,
            usage,
            gateway,
            notifier,
            clock,
            config,
            redirect_url: redirect_url.into(),
            subscription_locks: KeyedLocks::default(),
            transaction_locks: KeyedLocks::default(),
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    /// The merchant's live subscription, if any.
    pub async fn current_subscription(&self, merchant_id: Uuid) -> Result<Option<Subscription>> {
        self.store.find_live_subscription(merchant_id).await
    }

    // =========================================================================
    // Merchant operations
    // =========================================================================

    /// Start a free trial. No payment is taken.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn start_trial(&self, merchant_id: Uuid) -> Result<Subscription> {
        if self.store.find_live_subscription(merchant_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed { merchant_id });
        }

        let plan = self.catalog.trial_plan(self.config.trial_plan_id).await?;
        let now = self.clock.now();
        let subscription = Subscription::new(
            CreateSubscription {
                merchant_id,
                plan_id: plan.plan_id,
                billing_cycle: BillingCycle::Monthly,
                status: SubscriptionStatus::Trial,
                start_date: now,
                end_date: now + Duration::days(self.config.trial_days),
                auto_renew: false,
            },
            now,
        );

        self.store.insert_subscription(&subscription).await?;
        self.usage.open_period(&subscription, now).await?;
        record_transition("none", SubscriptionStatus::Trial.as_str());

        info!(
            subscription_id = %subscription.subscription_id,
            plan_id = %plan.plan_id,
            end_date = %subscription.end_date,
            "Trial started"
        );
        Ok(subscription)
    }

    /// Begin a paid subscription. Access is granted only once the payment
    /// is confirmed; a live trial is converted in place at that point.
    #[instrument(skip(self), fields(merchant_id = %merchant_id, plan_id = %plan_id, cycle = billing_cycle.as_str()))]
    pub async fn subscribe(
        &self,
        merchant_id: Uuid,
        plan_id: Uuid,
        billing_cycle: BillingCycle,
    ) -> Result<SubscribeOutcome> {
        let plan = self.catalog.get_active_plan(plan_id).await?;
        if let Some(live) = self.store.find_live_subscription(merchant_id).await? {
            if live.status == SubscriptionStatus::Active {
                return Err(BillingError::AlreadySubscribed { merchant_id });
            }
        }

        let amount = plan.price_for(billing_cycle);
        if amount <= Decimal::ZERO {
            return match self.activate(merchant_id, &plan, billing_cycle).await? {
                Some(subscription) => Ok(SubscribeOutcome::Activated { subscription }),
                None => Err(BillingError::AlreadySubscribed { merchant_id }),
            };
        }

        let transaction = PaymentTransaction::new(
            CreateTransaction {
                merchant_id,
                subscription_id: None,
                transaction_type: TransactionType::Subscription,
                amount,
                currency: plan.currency.clone(),
                status: TransactionStatus::Pending,
                gateway_charge_id: None,
                metadata: TransactionMetadata {
                    plan_id: Some(plan.plan_id),
                    billing_cycle: Some(billing_cycle),
                    ..Default::default()
                },
            },
            self.clock.now(),
        );
        self.store.insert_transaction(&transaction).await?;

        let created = self.charge_or_fail(&transaction).await?;
        match TransactionStatus::from_charge(created.status) {
            TransactionStatus::Pending => Ok(SubscribeOutcome::PaymentRequired {
                transaction_id: transaction.transaction_id,
                charge_id: created.charge_id,
                payment_url: created.payment_url,
            }),
            status => {
                let settlement = self.settle(transaction.transaction_id, status).await?;
                match settlement.subscription {
                    Some(subscription) if status.is_paid() => {
                        Ok(SubscribeOutcome::Activated { subscription })
                    }
                    _ if status.is_paid() => Err(BillingError::AlreadySubscribed { merchant_id }),
                    _ => Err(BillingError::GatewayRejected(format!(
                        "charge {}",
                        status.as_str()
                    ))),
                }
            }
        }
    }

    /// Move an active subscription to another plan mid-cycle.
    #[instrument(skip(self), fields(merchant_id = %merchant_id, new_plan_id = %new_plan_id))]
    pub async fn upgrade_subscription(
        &self,
        merchant_id: Uuid,
        new_plan_id: Uuid,
    ) -> Result<UpgradeOutcome> {
        let subscription = self
            .store
            .find_live_subscription(merchant_id)
            .await?
            .filter(|s| s.status == SubscriptionStatus::Active)
            .ok_or(BillingError::NoActiveSubscription(merchant_id))?;

        if subscription.plan_id == new_plan_id {
            return Err(BillingError::InvalidPlanChange(
                "already subscribed to this plan".to_string(),
            ));
        }

        let current = self.catalog.get_plan(subscription.plan_id).await?;
        let target = self.catalog.get_active_plan(new_plan_id).await?;
        if current.currency != target.currency {
            return Err(BillingError::InvalidPlanChange(format!(
                "cannot change from {} to {} pricing",
                current.currency, target.currency
            )));
        }

        let cycle = subscription.billing_cycle;
        let proration = prorate(
            subscription.start_date,
            subscription.end_date,
            self.clock.now(),
            current.price_for(cycle),
            target.price_for(cycle),
        );

        debug!(
            remaining_days = proration.remaining_days,
            total_days = proration.total_days,
            credit = %proration.credit,
            charge = %proration.charge,
            net = %proration.net,
            "Proration computed"
        );

        if !proration.is_due() {
            let from_plan = subscription.plan_id;
            let saved = self
                .update_subscription_with(subscription.subscription_id, 1, |s| {
                    (s.status == SubscriptionStatus::Active && s.plan_id == from_plan).then(|| {
                        let mut next = s.clone();
                        next.plan_id = new_plan_id;
                        next
                    })
                })
                .await?
                .ok_or_else(|| version_conflict(subscription.subscription_id))?;

            info!(
                subscription_id = %saved.subscription_id,
                from_plan = %from_plan,
                to_plan = %new_plan_id,
                "Plan changed without charge"
            );
            return Ok(UpgradeOutcome::Applied {
                subscription: saved,
                proration,
            });
        }

        let transaction = PaymentTransaction::new(
            CreateTransaction {
                merchant_id,
                subscription_id: Some(subscription.subscription_id),
                transaction_type: TransactionType::Upgrade,
                amount: proration.net,
                currency: target.currency.clone(),
                status: TransactionStatus::Pending,
                gateway_charge_id: None,
                metadata: TransactionMetadata {
                    plan_id: Some(new_plan_id),
                    billing_cycle: Some(cycle),
                    previous_plan_id: Some(subscription.plan_id),
                    remaining_days: Some(proration.remaining_days),
                    total_days: Some(proration.total_days),
                    proration_credit: Some(proration.credit),
                    proration_charge: Some(proration.charge),
                    ..Default::default()
                },
            },
            self.clock.now(),
        );
        self.store.insert_transaction(&transaction).await?;

        let created = self.charge_or_fail(&transaction).await?;
        match TransactionStatus::from_charge(created.status) {
            status if status.is_paid() => {
                let settlement = self.settle(transaction.transaction_id, status).await?;
                match settlement.subscription {
                    Some(subscription) => Ok(UpgradeOutcome::Applied {
                        subscription,
                        proration,
                    }),
                    None => Err(version_conflict(subscription.subscription_id)),
                }
            }
            TransactionStatus::Pending => Ok(UpgradeOutcome::PaymentRequired {
                transaction_id: transaction.transaction_id,
                charge_id: created.charge_id,
                payment_url: created.payment_url,
                proration,
            }),
            status => {
                self.settle(transaction.transaction_id, status).await?;
                Err(BillingError::GatewayRejected(format!(
                    "charge {}",
                    status.as_str()
                )))
            }
        }
    }

    /// Stop auto-renewal. The subscription keeps working until its end date
    /// and is then marked `cancelled` by the expiry sweep.
    #[instrument(skip(self, reason), fields(merchant_id = %merchant_id))]
    pub async fn cancel_subscription(
        &self,
        merchant_id: Uuid,
        reason: Option<String>,
    ) -> Result<Subscription> {
        let subscription = self
            .store
            .find_live_subscription(merchant_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(merchant_id))?;

        let now = self.clock.now();
        let saved = self
            .update_subscription_with(subscription.subscription_id, EFFECT_ATTEMPTS, |s| {
                s.status.is_live().then(|| {
                    let mut next = s.clone();
                    next.auto_renew = false;
                    next.cancel_requested_at = Some(s.cancel_requested_at.unwrap_or(now));
                    if reason.is_some() {
                        next.cancellation_reason = reason.clone();
                    }
                    next
                })
            })
            .await?
            .ok_or(BillingError::NoActiveSubscription(merchant_id))?;

        info!(
            subscription_id = %saved.subscription_id,
            end_date = %saved.end_date,
            "Cancellation requested"
        );
        Ok(saved)
    }

    /// Charge for the next cycle of a live subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn renew_subscription(&self, subscription_id: Uuid) -> Result<RenewalOutcome> {
        let _guard = self.subscription_locks.lock(subscription_id).await;
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;
        if !subscription.status.is_live() {
            return Err(BillingError::NoActiveSubscription(subscription.merchant_id));
        }
        self.renew_locked(subscription).await
    }

    /// Refund a captured transaction, fully or partially.
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn refund_transaction(
        &self,
        transaction_id: Uuid,
        amount: Option<Decimal>,
    ) -> Result<PaymentTransaction> {
        let _guard = self.transaction_locks.lock(transaction_id).await;
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;

        if transaction.status != TransactionStatus::Captured {
            return Err(BillingError::BadRequest(format!(
                "only captured transactions can be refunded, this one is {}",
                transaction.status.as_str()
            )));
        }
        let charge_id = transaction.gateway_charge_id.clone().ok_or_else(|| {
            BillingError::BadRequest("transaction has no gateway charge".to_string())
        })?;
        let amount = amount.unwrap_or(transaction.amount);
        if amount <= Decimal::ZERO || amount > transaction.amount {
            return Err(BillingError::BadRequest(format!(
                "refund amount must be between 0 and {}",
                transaction.amount
            )));
        }

        let refund = self
            .with_gateway_timeout(self.gateway.refund_charge(
                &charge_id,
                amount,
                &transaction.currency,
            ))
            .await?;

        let now = self.clock.now();
        if !self
            .store
            .update_transaction_status(
                transaction_id,
                TransactionStatus::Captured,
                TransactionStatus::Refunded,
                now,
            )
            .await?
        {
            return Err(BillingError::BadRequest(
                "transaction changed while refunding".to_string(),
            ));
        }

        let record = PaymentTransaction::new(
            CreateTransaction {
                merchant_id: transaction.merchant_id,
                subscription_id: transaction.subscription_id,
                transaction_type: TransactionType::Refund,
                amount,
                currency: transaction.currency.clone(),
                status: TransactionStatus::Captured,
                gateway_charge_id: Some(refund.refund_id.clone()),
                metadata: TransactionMetadata {
                    refunded_transaction_id: Some(transaction_id),
                    ..Default::default()
                },
            },
            now,
        );
        self.store.insert_transaction(&record).await?;

        info!(
            refund_id = %refund.refund_id,
            amount = %amount,
            currency = %transaction.currency,
            "Transaction refunded"
        );
        Ok(record)
    }

    pub async fn test_gateway_connection(&self) -> ConnectionTest {
        tokio::time::timeout(self.config.gateway_timeout(), self.gateway.test_connection())
            .await
            .unwrap_or_else(|_| ConnectionTest {
                success: false,
                message: "gateway did not respond in time".to_string(),
            })
    }

    // =========================================================================
    // Payment callbacks
    // =========================================================================

    /// Apply a charge status reported by the gateway.
    #[instrument(skip(self), fields(charge_id = %charge_id, status = status.as_str()))]
    pub async fn handle_payment_callback(
        &self,
        charge_id: &str,
        status: ChargeStatus,
    ) -> Result<CallbackOutcome> {
        let transaction = self
            .store
            .find_transaction_by_charge(charge_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(charge_id.to_string()))?;
        let transaction_id = transaction.transaction_id;

        let next = TransactionStatus::from_charge(status);
        if next == TransactionStatus::Pending {
            return Ok(CallbackOutcome::Ignored {
                transaction_id,
                reason: "charge still pending".to_string(),
            });
        }
        if transaction.status.is_terminal() {
            if next.is_paid() && transaction.status == TransactionStatus::Cancelled {
                warn!(
                    transaction_id = %transaction_id,
                    "Payment captured for an abandoned transaction; needs manual review"
                );
            }
            return Ok(CallbackOutcome::Ignored {
                transaction_id,
                reason: format!("transaction already {}", transaction.status.as_str()),
            });
        }

        let settlement = self.settle(transaction_id, next).await?;
        if settlement.applied {
            Ok(CallbackOutcome::Applied {
                transaction_id,
                status: settlement.status,
                subscription_id: settlement.subscription.map(|s| s.subscription_id),
            })
        } else {
            Ok(CallbackOutcome::Ignored {
                transaction_id,
                reason: "transaction settled concurrently".to_string(),
            })
        }
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Expire or renew every live subscription past its end date.
    pub async fn check_expired_subscriptions(&self) -> Result<SweepSummary> {
        self.run_expiry_sweep().await
    }

    /// Hourly sweep: reconcile stale pending charges, then process every
    /// live subscription whose end date has passed.
    #[instrument(skip(self))]
    pub async fn run_expiry_sweep(&self) -> Result<SweepSummary> {
        const SWEEP: &str = "expiry";
        let timer = SWEEP_DURATION.with_label_values(&[SWEEP]).start_timer();

        let reconciliation = match self.reconcile_pending_transactions().await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "Pending transaction reconciliation failed");
                record_error(e.kind(), "reconcile");
                None
            }
        };

        let due = match self
            .store
            .list_live_ending_before(self.clock.now())
            .await
        {
            Ok(due) => due,
            Err(e) => {
                record_sweep_run(SWEEP, "failed");
                return Err(e);
            }
        };

        let ids: Vec<Uuid> = due.iter().map(|s| s.subscription_id).collect();
        let results: Vec<_> = stream::iter(ids)
            .map(|id| async move { (id, self.process_due(id).await) })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut summary = SweepSummary {
            checked: due.len(),
            reconciliation,
            ..Default::default()
        };
        for (id, result) in results {
            summary.absorb(SWEEP, id, result);
        }

        self.subscription_locks.prune();
        self.transaction_locks.prune();
        timer.observe_duration();
        record_sweep_run(SWEEP, "completed");
        info!(
            checked = summary.checked,
            expired = summary.expired,
            cancelled = summary.cancelled,
            renewed = summary.renewed,
            pending = summary.pending,
            failed = summary.failed,
            "Expiry sweep completed"
        );
        Ok(summary)
    }

    /// Daily sweep: charge auto-renewing subscriptions ending within the
    /// lookahead window.
    #[instrument(skip(self))]
    pub async fn run_renewal_sweep(&self) -> Result<SweepSummary> {
        const SWEEP: &str = "renewal";
        let timer = SWEEP_DURATION.with_label_values(&[SWEEP]).start_timer();

        let horizon = self.clock.now() + Duration::hours(self.config.renewal_lookahead_hours);
        let candidates: Vec<_> = match self.store.list_live_ending_before(horizon).await {
            Ok(subs) => subs
                .into_iter()
                .filter(|s| s.status == SubscriptionStatus::Active && s.auto_renew)
                .collect(),
            Err(e) => {
                record_sweep_run(SWEEP, "failed");
                return Err(e);
            }
        };

        let ids: Vec<Uuid> = candidates.iter().map(|s| s.subscription_id).collect();
        let results: Vec<_> = stream::iter(ids)
            .map(|id| async move { (id, self.process_renewal(id, horizon).await) })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut summary = SweepSummary {
            checked: candidates.len(),
            ..Default::default()
        };
        for (id, result) in results {
            summary.absorb(SWEEP, id, result);
        }

        self.subscription_locks.prune();
        self.transaction_locks.prune();
        timer.observe_duration();
        record_sweep_run(SWEEP, "completed");
        info!(
            checked = summary.checked,
            renewed = summary.renewed,
            pending = summary.pending,
            failed = summary.failed,
            "Renewal sweep completed"
        );
        Ok(summary)
    }

    /// Send reminders for subscriptions ending within the configured
    /// thresholds.
    pub async fn send_expiry_reminders(&self) -> Result<ReminderSummary> {
        self.run_reminder_sweep().await
    }

    /// Daily sweep: one reminder per threshold per cycle. A subscription
    /// already inside a smaller threshold skips the larger ones it missed.
    #[instrument(skip(self))]
    pub async fn run_reminder_sweep(&self) -> Result<ReminderSummary> {
        const SWEEP: &str = "reminder";
        let timer = SWEEP_DURATION.with_label_values(&[SWEEP]).start_timer();

        let mut thresholds: Vec<i64> = self
            .config
            .reminder_days
            .iter()
            .copied()
            .filter(|d| *d > 0)
            .collect();
        thresholds.sort_unstable();
        thresholds.dedup();
        let Some(&widest) = thresholds.last() else {
            record_sweep_run(SWEEP, "completed");
            return Ok(ReminderSummary::default());
        };

        let now = self.clock.now();
        let candidates: Vec<_> = match self
            .store
            .list_live_ending_before(now + Duration::days(widest))
            .await
        {
            Ok(subs) => subs.into_iter().filter(|s| s.end_date > now).collect(),
            Err(e) => {
                record_sweep_run(SWEEP, "failed");
                return Err(e);
            }
        };

        let thresholds = &thresholds;
        let ids: Vec<Uuid> = candidates.iter().map(|s| s.subscription_id).collect();
        let results: Vec<_> = stream::iter(ids)
            .map(|id| async move { (id, self.process_reminder(id, thresholds).await) })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut summary = ReminderSummary {
            checked: candidates.len(),
            ..Default::default()
        };
        for (id, result) in results {
            let label = match result {
                Ok(true) => {
                    summary.sent += 1;
                    "sent"
                }
                Ok(false) => {
                    summary.skipped += 1;
                    "skipped"
                }
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "Reminder failed");
                    record_error(e.kind(), SWEEP);
                    summary.failed += 1;
                    summary.failures.push(SweepFailure {
                        subscription_id: id,
                        reason: e.to_string(),
                    });
                    "error"
                }
            };
            record_sweep_item(SWEEP, label);
        }

        self.subscription_locks.prune();
        timer.observe_duration();
        record_sweep_run(SWEEP, "completed");
        info!(
            checked = summary.checked,
            sent = summary.sent,
            failed = summary.failed,
            "Reminder sweep completed"
        );
        Ok(summary)
    }

    /// Ask the gateway about pending transactions older than the reconcile
    /// delay; give up on those unpaid past the abandonment window.
    #[instrument(skip(self))]
    pub async fn reconcile_pending_transactions(&self) -> Result<ReconcileSummary> {
        let now = self.clock.now();
        let cutoff = now - Duration::seconds(self.config.reconcile_after_secs);
        let pending = self.store.list_pending_transactions(cutoff).await?;

        let checked = pending.len();
        let results: Vec<_> = stream::iter(pending)
            .map(|tx| async move { (tx.transaction_id, self.reconcile_transaction(tx).await) })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut summary = ReconcileSummary {
            checked,
            ..Default::default()
        };
        for (transaction_id, result) in results {
            match result {
                Ok(Reconciled::StillPending) => summary.still_pending += 1,
                Ok(Reconciled::Settled(s)) if s.status == TransactionStatus::Cancelled => {
                    summary.abandoned += 1
                }
                Ok(Reconciled::Settled(_)) => summary.settled += 1,
                Err(e) => {
                    warn!(transaction_id = %transaction_id, error = %e, "Reconciliation failed");
                    record_error(e.kind(), "reconcile");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Hourly sweep: warn merchants on paid plans whose usage crossed the
    /// alert threshold for a limited quota.
    #[instrument(skip(self))]
    pub async fn run_usage_alert_sweep(&self) -> Result<UsageAlertSummary> {
        const SWEEP: &str = "usage_alert";
        let timer = SWEEP_DURATION.with_label_values(&[SWEEP]).start_timer();

        let policy = self.config.usage_alert_policy();
        let candidates: Vec<_> = match self.store.list_live_subscriptions().await {
            Ok(subs) => subs
                .into_iter()
                .filter(|s| s.status == SubscriptionStatus::Active)
                .collect(),
            Err(e) => {
                record_sweep_run(SWEEP, "failed");
                return Err(e);
            }
        };

        let policy = &policy;
        let ids: Vec<Uuid> = candidates.iter().map(|s| s.subscription_id).collect();
        let results: Vec<_> = stream::iter(ids)
            .map(|id| async move { (id, self.process_usage_alerts(id, policy).await) })
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut summary = UsageAlertSummary {
            checked: candidates.len(),
            ..Default::default()
        };
        for (id, result) in results {
            let label = match result {
                Ok(0) => {
                    summary.skipped += 1;
                    "skipped"
                }
                Ok(sent) => {
                    summary.sent += sent;
                    "sent"
                }
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "Usage alert failed");
                    record_error(e.kind(), SWEEP);
                    summary.failed += 1;
                    summary.failures.push(SweepFailure {
                        subscription_id: id,
                        reason: e.to_string(),
                    });
                    "error"
                }
            };
            record_sweep_item(SWEEP, label);
        }

        self.subscription_locks.prune();
        timer.observe_duration();
        record_sweep_run(SWEEP, "completed");
        info!(
            checked = summary.checked,
            sent = summary.sent,
            failed = summary.failed,
            "Usage alert sweep completed"
        );
        Ok(summary)
    }

    // =========================================================================
    // Sweep items
    // =========================================================================

    async fn process_due(&self, subscription_id: Uuid) -> Result<ItemOutcome> {
        let Some(_guard) = self.subscription_locks.try_lock(subscription_id) else {
            debug!(subscription_id = %subscription_id, "Subscription busy, skipping");
            return Ok(ItemOutcome::Skipped);
        };

        let now = self.clock.now();
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !subscription.status.is_live() || subscription.end_date > now {
            return Ok(ItemOutcome::Skipped);
        }

        if subscription.auto_renew {
            return Ok(self.renew_locked(subscription).await?.into());
        }
        if let Some(pending) = self.store.find_pending_renewal(subscription_id).await? {
            return Ok(self.reconcile_renewal(pending).await?.into());
        }
        self.lapse(subscription).await
    }

    async fn process_renewal(
        &self,
        subscription_id: Uuid,
        horizon: chrono::DateTime<chrono::Utc>,
    ) -> Result<ItemOutcome> {
        let Some(_guard) = self.subscription_locks.try_lock(subscription_id) else {
            return Ok(ItemOutcome::Skipped);
        };
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        if subscription.status != SubscriptionStatus::Active
            || !subscription.auto_renew
            || subscription.end_date > horizon
        {
            return Ok(ItemOutcome::Skipped);
        }
        Ok(self.renew_locked(subscription).await?.into())
    }

    async fn process_reminder(&self, subscription_id: Uuid, thresholds: &[i64]) -> Result<bool> {
        let Some(_guard) = self.subscription_locks.try_lock(subscription_id) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(false);
        };
        if !subscription.status.is_live() || subscription.end_date <= now {
            return Ok(false);
        }

        let remaining = subscription.end_date - now;
        let Some(threshold) = thresholds
            .iter()
            .copied()
            .find(|days| remaining <= Duration::days(*days))
        else {
            return Ok(false);
        };
        let threshold = i32::try_from(threshold).unwrap_or(i32::MAX);
        if subscription
            .last_reminder_days
            .is_some_and(|last| threshold >= last)
        {
            return Ok(false);
        }

        // Record first: a lost notification beats a duplicate one.
        let saved = self
            .update_subscription_with(subscription_id, 1, |s| {
                let mut next = s.clone();
                next.last_reminder_days = Some(threshold);
                Some(next)
            })
            .await?;
        let Some(saved) = saved else {
            return Ok(false);
        };

        // Whole days left, counting a partial day as one.
        let seconds_left = (saved.end_date - now).num_seconds().max(0);
        let days_remaining = (seconds_left + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
        let template = if saved.auto_renew {
            NotificationTemplate::RenewalUpcoming
        } else {
            NotificationTemplate::ExpiryReminder
        };
        let plan_name = self
            .catalog
            .get_plan(saved.plan_id)
            .await
            .map(|p| p.name)
            .unwrap_or_default();
        self.notify(
            saved.merchant_id,
            template,
            vars([
                ("subscription_id", saved.subscription_id.to_string()),
                ("days_remaining", days_remaining.to_string()),
                ("end_date", saved.end_date.to_rfc3339()),
                ("plan_name", plan_name),
            ]),
        )
        .await;

        info!(
            subscription_id = %subscription_id,
            threshold,
            days_remaining,
            template = template.as_str(),
            "Expiry reminder sent"
        );
        Ok(true)
    }

    /// Warnings sent for one subscription.
    async fn process_usage_alerts(
        &self,
        subscription_id: Uuid,
        policy: &UsageAlertPolicy,
    ) -> Result<usize> {
        let Some(_guard) = self.subscription_locks.try_lock(subscription_id) else {
            return Ok(0);
        };
        let Some(subscription) = self.store.get_subscription(subscription_id).await? else {
            return Ok(0);
        };
        if subscription.status != SubscriptionStatus::Active {
            return Ok(0);
        }

        let report = self.usage.report_for(&subscription).await?;
        let kinds = report.approaching_limits(policy.threshold_percent);
        if kinds.is_empty() {
            return Ok(0);
        }
        let plan_name = self
            .catalog
            .get_plan(subscription.plan_id)
            .await
            .map(|p| p.name)
            .unwrap_or_default();

        let now = self.clock.now();
        let mut sent = 0;
        for kind in kinds {
            let metric = report.metric(kind);
            let previous = self.store.get_usage_alert(subscription_id, kind).await?;
            if !policy.should_alert(metric, report.period_start, previous.as_ref(), now) {
                continue;
            }

            let alert = UsageAlert {
                subscription_id,
                merchant_id: subscription.merchant_id,
                kind,
                period_start: report.period_start,
                percentage: metric.percentage,
                sent_at: now,
            };
            // Record first: a lost warning beats a duplicate one.
            if !self
                .store
                .record_usage_alert(&alert, previous.map(|p| p.sent_at))
                .await?
            {
                continue;
            }

            self.notify(
                subscription.merchant_id,
                NotificationTemplate::UsageWarning,
                vars([
                    ("subscription_id", subscription_id.to_string()),
                    ("kind", kind.as_str().to_string()),
                    ("used", metric.used.to_string()),
                    ("limit", metric.limit.unwrap_or_default().to_string()),
                    ("percentage", format!("{:.1}", metric.percentage)),
                    ("plan_name", plan_name.clone()),
                ]),
            )
            .await;
            info!(
                subscription_id = %subscription_id,
                kind = kind.as_str(),
                percentage = metric.percentage,
                "Usage warning sent"
            );
            sent += 1;
        }
        Ok(sent)
    }

    /// End a subscription that reached its end date without renewing.
    async fn lapse(&self, subscription: Subscription) -> Result<ItemOutcome> {
        let now = self.clock.now();
        let saved = self
            .update_subscription_with(subscription.subscription_id, 1, |s| {
                (s.status.is_live() && s.end_date <= now && !s.auto_renew).then(|| {
                    let mut next = s.clone();
                    next.status = s.lapse_status();
                    next
                })
            })
            .await?;
        let Some(saved) = saved else {
            return Ok(ItemOutcome::Skipped);
        };

        let (template, outcome) = match saved.status {
            SubscriptionStatus::Cancelled => (
                NotificationTemplate::SubscriptionCancelled,
                ItemOutcome::Cancelled,
            ),
            _ => (
                NotificationTemplate::SubscriptionExpired,
                ItemOutcome::Expired,
            ),
        };
        self.notify(
            saved.merchant_id,
            template,
            vars([
                ("subscription_id", saved.subscription_id.to_string()),
                ("end_date", saved.end_date.to_rfc3339()),
            ]),
        )
        .await;

        info!(
            subscription_id = %saved.subscription_id,
            status = saved.status.as_str(),
            "Subscription lapsed"
        );
        Ok(outcome)
    }

    /// Renew with the subscription lock already held.
    async fn renew_locked(&self, subscription: Subscription) -> Result<RenewalOutcome> {
        if let Some(pending) = self
            .store
            .find_pending_renewal(subscription.subscription_id)
            .await?
        {
            return self.reconcile_renewal(pending).await;
        }

        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        let amount = plan.price_for(subscription.billing_cycle);
        let transaction = PaymentTransaction::new(
            CreateTransaction {
                merchant_id: subscription.merchant_id,
                subscription_id: Some(subscription.subscription_id),
                transaction_type: TransactionType::Renewal,
                amount,
                currency: plan.currency.clone(),
                status: TransactionStatus::Pending,
                gateway_charge_id: None,
                metadata: TransactionMetadata {
                    plan_id: Some(plan.plan_id),
                    billing_cycle: Some(subscription.billing_cycle),
                    auto_renewal: true,
                    renews_from: Some(subscription.end_date),
                    ..Default::default()
                },
            },
            self.clock.now(),
        );
        self.store.insert_transaction(&transaction).await?;
        let transaction_id = transaction.transaction_id;

        if amount <= Decimal::ZERO {
            let settlement = self
                .settle(transaction_id, TransactionStatus::Captured)
                .await?;
            return Ok(renewal_outcome(transaction_id, settlement, None));
        }

        match self.request_charge(&transaction).await {
            Ok(created) => {
                self.store
                    .set_gateway_charge_id(transaction_id, &created.charge_id, self.clock.now())
                    .await?;
                match TransactionStatus::from_charge(created.status) {
                    TransactionStatus::Pending => Ok(RenewalOutcome::Pending { transaction_id }),
                    status => {
                        let settlement = self.settle(transaction_id, status).await?;
                        Ok(renewal_outcome(transaction_id, settlement, None))
                    }
                }
            }
            Err(e) if e.is_indeterminate() => {
                warn!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Renewal charge outcome unknown; will reconcile"
                );
                Ok(RenewalOutcome::Pending { transaction_id })
            }
            Err(e) => {
                let reason = e.to_string();
                let settlement = self
                    .settle(transaction_id, TransactionStatus::Failed)
                    .await?;
                Ok(renewal_outcome(transaction_id, settlement, Some(reason)))
            }
        }
    }

    async fn reconcile_renewal(&self, pending: PaymentTransaction) -> Result<RenewalOutcome> {
        let transaction_id = pending.transaction_id;
        match self.reconcile_transaction(pending).await? {
            Reconciled::StillPending => Ok(RenewalOutcome::Pending { transaction_id }),
            Reconciled::Settled(settlement) => Ok(renewal_outcome(transaction_id, settlement, None)),
        }
    }

    /// Look a pending transaction up at the gateway and apply what it says.
    async fn reconcile_transaction(&self, transaction: PaymentTransaction) -> Result<Reconciled> {
        let transaction_id = transaction.transaction_id;
        let now = self.clock.now();

        let charge_status = match &transaction.gateway_charge_id {
            Some(charge_id) => {
                match self
                    .with_gateway_timeout(self.gateway.retrieve_charge(charge_id))
                    .await
                {
                    Ok(status) => Some(status),
                    Err(e) => {
                        warn!(transaction_id = %transaction_id, error = %e, "Charge lookup failed");
                        return Ok(Reconciled::StillPending);
                    }
                }
            }
            None => {
                let reference = transaction_id.to_string();
                match self
                    .with_gateway_timeout(self.gateway.find_charge_by_reference(&reference))
                    .await
                {
                    Ok(Some(snapshot)) => {
                        self.store
                            .set_gateway_charge_id(transaction_id, &snapshot.charge_id, now)
                            .await?;
                        Some(snapshot.status)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(transaction_id = %transaction_id, error = %e, "Charge lookup failed");
                        return Ok(Reconciled::StillPending);
                    }
                }
            }
        };

        let abandoned = now - transaction.created_utc
            >= Duration::hours(self.config.abandon_pending_after_hours);
        let next = match charge_status.map(TransactionStatus::from_charge) {
            Some(TransactionStatus::Pending) | None if abandoned => TransactionStatus::Cancelled,
            Some(TransactionStatus::Pending) | None => return Ok(Reconciled::StillPending),
            Some(status) => status,
        };

        if next == TransactionStatus::Cancelled && abandoned {
            info!(transaction_id = %transaction_id, "Abandoning unpaid transaction");
        }
        Ok(Reconciled::Settled(self.settle(transaction_id, next).await?))
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Move a transaction to `next`, applying its effect first.
    async fn settle(&self, transaction_id: Uuid, next: TransactionStatus) -> Result<Settlement> {
        let _guard = self.transaction_locks.lock(transaction_id).await;
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;

        let ignored = Settlement {
            applied: false,
            status: next,
            subscription: None,
        };
        if transaction.status == next || !transaction.status.can_transition_to(next) {
            debug!(
                transaction_id = %transaction_id,
                current = transaction.status.as_str(),
                requested = next.as_str(),
                "Transaction status change ignored"
            );
            return Ok(ignored);
        }

        let subscription = if next.is_paid() && !transaction.status.is_paid() {
            record_charge_amount(
                &transaction.currency,
                transaction.transaction_type.as_str(),
                transaction.amount.to_f64().unwrap_or_default(),
            );
            self.apply_payment(&transaction).await?
        } else if matches!(
            next,
            TransactionStatus::Failed | TransactionStatus::Cancelled
        ) {
            self.apply_payment_failure(&transaction).await?
        } else {
            None
        };

        let updated = self
            .store
            .update_transaction_status(transaction_id, transaction.status, next, self.clock.now())
            .await?;
        if !updated {
            warn!(transaction_id = %transaction_id, "Transaction settled concurrently");
            return Ok(ignored);
        }

        info!(
            transaction_id = %transaction_id,
            transaction_type = transaction.transaction_type.as_str(),
            from = transaction.status.as_str(),
            to = next.as_str(),
            "Transaction settled"
        );
        Ok(Settlement {
            applied: true,
            status: next,
            subscription,
        })
    }

    async fn apply_payment(&self, transaction: &PaymentTransaction) -> Result<Option<Subscription>> {
        match transaction.transaction_type {
            TransactionType::Subscription => self.activate_from(transaction).await,
            TransactionType::Upgrade => self.apply_upgrade(transaction).await,
            TransactionType::Renewal => self.apply_renewal(transaction).await,
            TransactionType::Refund => Ok(None),
        }
    }

    async fn apply_payment_failure(
        &self,
        transaction: &PaymentTransaction,
    ) -> Result<Option<Subscription>> {
        match transaction.transaction_type {
            TransactionType::Renewal => self.fail_renewal(transaction).await,
            TransactionType::Subscription | TransactionType::Upgrade => {
                self.notify(
                    transaction.merchant_id,
                    NotificationTemplate::PaymentFailed,
                    vars([
                        ("transaction_id", transaction.transaction_id.to_string()),
                        ("amount", transaction.amount.to_string()),
                        ("currency", transaction.currency.clone()),
                    ]),
                )
                .await;
                Ok(None)
            }
            TransactionType::Refund => Ok(None),
        }
    }

    async fn activate_from(&self, transaction: &PaymentTransaction) -> Result<Option<Subscription>> {
        let plan_id = transaction.metadata.plan_id.ok_or_else(|| {
            BillingError::Internal(anyhow::anyhow!(
                "transaction {} carries no plan",
                transaction.transaction_id
            ))
        })?;
        let cycle = transaction
            .metadata
            .billing_cycle
            .unwrap_or(BillingCycle::Monthly);
        let plan = self.catalog.get_plan(plan_id).await?;

        let subscription = self
            .activate(transaction.merchant_id, &plan, cycle)
            .await?;
        if let Some(subscription) = &subscription {
            self.store
                .link_transaction_subscription(
                    transaction.transaction_id,
                    subscription.subscription_id,
                )
                .await?;
        }
        Ok(subscription)
    }

    /// Give the merchant a paid subscription: convert a live trial in place
    /// or create a new record. `None` when a paid subscription is already
    /// live; the payment stays recorded for audit.
    async fn activate(
        &self,
        merchant_id: Uuid,
        plan: &Plan,
        cycle: BillingCycle,
    ) -> Result<Option<Subscription>> {
        let now = self.clock.now();
        let end_date = cycle.advance(now);
        let auto_renew = self.config.auto_renew_paid_subscriptions;

        for _ in 0..EFFECT_ATTEMPTS {
            match self.store.find_live_subscription(merchant_id).await? {
                Some(live) if live.status == SubscriptionStatus::Active => {
                    warn!(
                        merchant_id = %merchant_id,
                        subscription_id = %live.subscription_id,
                        "Merchant already has an active subscription; payment kept for audit"
                    );
                    return Ok(None);
                }
                Some(trial) => {
                    let mut next = trial.clone();
                    next.status = SubscriptionStatus::Active;
                    next.plan_id = plan.plan_id;
                    next.billing_cycle = cycle;
                    next.start_date = now;
                    next.end_date = end_date;
                    next.billing_anchor = now;
                    next.auto_renew = auto_renew;
                    next.cancel_requested_at = None;
                    next.cancellation_reason = None;
                    next.last_reminder_days = None;
                    next.updated_utc = now;

                    match self.store.update_subscription(&next, trial.version).await {
                        Ok(saved) => {
                            record_transition(
                                SubscriptionStatus::Trial.as_str(),
                                SubscriptionStatus::Active.as_str(),
                            );
                            return self.finish_activation(saved, now).await.map(Some);
                        }
                        Err(BillingError::ConcurrentModification { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                None => {
                    let subscription = Subscription::new(
                        CreateSubscription {
                            merchant_id,
                            plan_id: plan.plan_id,
                            billing_cycle: cycle,
                            status: SubscriptionStatus::Active,
                            start_date: now,
                            end_date,
                            auto_renew,
                        },
                        now,
                    );
                    match self.store.insert_subscription(&subscription).await {
                        Ok(()) => {
                            record_transition("none", SubscriptionStatus::Active.as_str());
                            return self.finish_activation(subscription, now).await.map(Some);
                        }
                        Err(BillingError::AlreadySubscribed { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(BillingError::AlreadySubscribed { merchant_id })
    }

    async fn finish_activation(
        &self,
        subscription: Subscription,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Subscription> {
        self.usage.open_period(&subscription, now).await?;
        info!(
            subscription_id = %subscription.subscription_id,
            plan_id = %subscription.plan_id,
            end_date = %subscription.end_date,
            "Subscription activated"
        );
        self.notify(
            subscription.merchant_id,
            NotificationTemplate::SubscriptionActivated,
            vars([
                ("subscription_id", subscription.subscription_id.to_string()),
                ("end_date", subscription.end_date.to_rfc3339()),
            ]),
        )
        .await;
        Ok(subscription)
    }

    async fn apply_upgrade(&self, transaction: &PaymentTransaction) -> Result<Option<Subscription>> {
        let (Some(subscription_id), Some(new_plan_id)) =
            (transaction.subscription_id, transaction.metadata.plan_id)
        else {
            return Err(BillingError::Internal(anyhow::anyhow!(
                "upgrade transaction {} is missing its subscription or plan",
                transaction.transaction_id
            )));
        };
        let from_plan = transaction.metadata.previous_plan_id;

        let saved = self
            .update_subscription_with(subscription_id, EFFECT_ATTEMPTS, |s| {
                (s.status == SubscriptionStatus::Active && Some(s.plan_id) == from_plan).then(
                    || {
                        let mut next = s.clone();
                        next.plan_id = new_plan_id;
                        next
                    },
                )
            })
            .await?;

        match &saved {
            Some(s) => info!(subscription_id = %s.subscription_id, plan_id = %new_plan_id, "Upgrade applied"),
            None => warn!(
                transaction_id = %transaction.transaction_id,
                "Upgrade paid but subscription changed; kept for audit"
            ),
        }
        Ok(saved)
    }

    async fn apply_renewal(&self, transaction: &PaymentTransaction) -> Result<Option<Subscription>> {
        let Some(subscription_id) = transaction.subscription_id else {
            return Err(BillingError::Internal(anyhow::anyhow!(
                "renewal transaction {} has no subscription",
                transaction.transaction_id
            )));
        };
        let renews_from = transaction.metadata.renews_from;

        let saved = self
            .update_subscription_with(subscription_id, EFFECT_ATTEMPTS, |s| {
                (s.status.is_live() && Some(s.end_date) == renews_from).then(|| {
                    let mut next = s.clone();
                    next.status = SubscriptionStatus::Active;
                    next.start_date = s.end_date;
                    next.end_date = s.billing_cycle.next_boundary(s.billing_anchor, s.end_date);
                    next.last_reminder_days = None;
                    next
                })
            })
            .await?;

        let Some(saved) = saved else {
            warn!(
                transaction_id = %transaction.transaction_id,
                "Renewal paid but subscription moved on; kept for audit"
            );
            return Ok(None);
        };

        record_transition(
            SubscriptionStatus::Active.as_str(),
            SubscriptionStatus::Active.as_str(),
        );
        self.usage.current_period(&saved).await?;
        self.notify(
            saved.merchant_id,
            NotificationTemplate::RenewalSucceeded,
            vars([
                ("subscription_id", saved.subscription_id.to_string()),
                ("end_date", saved.end_date.to_rfc3339()),
                ("amount", transaction.amount.to_string()),
                ("currency", transaction.currency.clone()),
            ]),
        )
        .await;
        info!(
            subscription_id = %saved.subscription_id,
            end_date = %saved.end_date,
            "Subscription renewed"
        );
        Ok(Some(saved))
    }

    /// A failed renewal ends the subscription for this cycle: immediately if
    /// it is already due, otherwise at its end date with no further charge.
    async fn fail_renewal(&self, transaction: &PaymentTransaction) -> Result<Option<Subscription>> {
        let Some(subscription_id) = transaction.subscription_id else {
            return Ok(None);
        };
        let renews_from = transaction.metadata.renews_from;
        let now = self.clock.now();

        let saved = self
            .update_subscription_with(subscription_id, EFFECT_ATTEMPTS, |s| {
                (s.status.is_live() && Some(s.end_date) == renews_from).then(|| {
                    let mut next = s.clone();
                    if s.end_date <= now {
                        next.status = SubscriptionStatus::Expired;
                    } else {
                        next.auto_renew = false;
                    }
                    next
                })
            })
            .await?;

        if let Some(saved) = &saved {
            warn!(
                subscription_id = %saved.subscription_id,
                status = saved.status.as_str(),
                "Renewal failed"
            );
            self.notify(
                saved.merchant_id,
                NotificationTemplate::RenewalFailed,
                vars([
                    ("subscription_id", saved.subscription_id.to_string()),
                    ("end_date", saved.end_date.to_rfc3339()),
                    ("amount", transaction.amount.to_string()),
                    ("currency", transaction.currency.clone()),
                ]),
            )
            .await;
        }
        Ok(saved)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Read-modify-write a subscription under the version check. `apply`
    /// returns `None` when the change no longer applies. A lost race is
    /// retried up to `attempts` times against a fresh read.
    async fn update_subscription_with<F>(
        &self,
        subscription_id: Uuid,
        attempts: usize,
        mut apply: F,
    ) -> Result<Option<Subscription>>
    where
        F: FnMut(&Subscription) -> Option<Subscription> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .store
                .get_subscription(subscription_id)
                .await?
                .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

            let Some(mut next) = apply(&current) else {
                return Ok(None);
            };
            check_transition(subscription_id, current.status, next.status)?;
            next.updated_utc = self.clock.now();

            match self.store.update_subscription(&next, current.version).await {
                Ok(saved) => {
                    if current.status != saved.status {
                        record_transition(current.status.as_str(), saved.status.as_str());
                    }
                    return Ok(Some(saved));
                }
                Err(BillingError::ConcurrentModification { .. }) if attempt < attempts => {
                    debug!(subscription_id = %subscription_id, attempt, "Version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn with_gateway_timeout<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, GatewayError>>,
    ) -> std::result::Result<T, GatewayError> {
        tokio::time::timeout(self.config.gateway_timeout(), call)
            .await
            .unwrap_or(Err(GatewayError::Timeout))
    }

    async fn request_charge(
        &self,
        transaction: &PaymentTransaction,
    ) -> std::result::Result<CreatedCharge, GatewayError> {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "transaction_id".to_string(),
            transaction.transaction_id.to_string(),
        );
        metadata.insert(
            "merchant_id".to_string(),
            transaction.merchant_id.to_string(),
        );
        metadata.insert(
            "type".to_string(),
            transaction.transaction_type.as_str().to_string(),
        );
        if let Some(plan_id) = transaction.metadata.plan_id {
            metadata.insert("plan_id".to_string(), plan_id.to_string());
        }
        if let Some(cycle) = transaction.metadata.billing_cycle {
            metadata.insert("billing_cycle".to_string(), cycle.as_str().to_string());
        }

        let request = ChargeRequest {
            amount: transaction.amount,
            currency: transaction.currency.clone(),
            customer: ChargeCustomer {
                merchant_id: transaction.merchant_id,
                email: None,
                phone: None,
            },
            redirect_url: self.redirect_url.clone(),
            reference: transaction.transaction_id.to_string(),
            metadata,
        };
        self.with_gateway_timeout(self.gateway.create_charge(&request))
            .await
    }

    /// Charge for a merchant-initiated transaction. Rejections fail the
    /// transaction; an unknown outcome leaves it pending for reconciliation.
    async fn charge_or_fail(&self, transaction: &PaymentTransaction) -> Result<CreatedCharge> {
        match self.request_charge(transaction).await {
            Ok(created) => {
                self.store
                    .set_gateway_charge_id(
                        transaction.transaction_id,
                        &created.charge_id,
                        self.clock.now(),
                    )
                    .await?;
                info!(
                    transaction_id = %transaction.transaction_id,
                    charge_id = %created.charge_id,
                    "Charge created"
                );
                Ok(created)
            }
            Err(e) if e.is_indeterminate() => {
                warn!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Charge outcome unknown; transaction left pending"
                );
                Err(e.into())
            }
            Err(e) => {
                self.store
                    .update_transaction_status(
                        transaction.transaction_id,
                        TransactionStatus::Pending,
                        TransactionStatus::Failed,
                        self.clock.now(),
                    )
                    .await?;
                warn!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Charge request failed"
                );
                Err(e.into())
            }
        }
    }

    async fn notify(
        &self,
        merchant_id: Uuid,
        template: NotificationTemplate,
        variables: NotificationVars,
    ) {
        dispatch(
            self.notifier.as_ref(),
            self.config.notification_timeout(),
            merchant_id,
            template,
            variables,
        )
        .await;
    }
}

fn renewal_outcome(
    transaction_id: Uuid,
    settlement: Settlement,
    reason: Option<String>,
) -> RenewalOutcome {
    if settlement.status.is_paid() {
        match settlement.subscription {
            Some(subscription) => RenewalOutcome::Renewed { subscription },
            None => RenewalOutcome::Superseded { transaction_id },
        }
    } else if settlement.status == TransactionStatus::Pending {
        RenewalOutcome::Pending { transaction_id }
    } else {
        RenewalOutcome::Failed {
            transaction_id,
            reason: reason.unwrap_or_else(|| format!("charge {}", settlement.status.as_str())),
        }
    }
}
