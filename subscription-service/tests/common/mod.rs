//! Shared harness for subscription-service integration tests.
//!
//! Wires a [`SubscriptionManager`] to the in-memory store, a manual clock, a
//! scripted gateway and a notifier that records what it was asked to send.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use subscription_service::config::LifecycleConfig;
use subscription_service::models::{CreatePlan, Plan, PlanFeatures, PlanQuotas, Quota};
use subscription_service::services::gateway::{
    ChargeRequest, ChargeSnapshot, ChargeStatus, ConnectionTest, CreatedCharge, GatewayError,
    PaymentGateway, RefundResult,
};
use subscription_service::services::notifier::{
    NotificationTemplate, NotificationVars, Notifier, NotifyError,
};
use subscription_service::services::{
    init_metrics, InMemoryStore, ManualClock, SubscriptionManager, SubscriptionStore,
};
use uuid::Uuid;

pub const CURRENCY: &str = "SAR";

/// 2026-04-01 00:00 UTC.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
}

pub fn dec(value: i64) -> Decimal {
    Decimal::from(value)
}

/// What the next `create_charge` call returns.
#[derive(Debug, Clone)]
pub enum ChargeScript {
    Status(ChargeStatus),
    Error(GatewayError),
    /// Never answers; exercises the caller's timeout.
    Hang,
}

#[derive(Default)]
struct GatewayState {
    script: VecDeque<ChargeScript>,
    charges: Vec<ChargeRequest>,
    /// Status returned by `retrieve_charge`, per charge id.
    statuses: HashMap<String, ChargeStatus>,
    /// Charges `find_charge_by_reference` can see, per reference.
    by_reference: HashMap<String, ChargeSnapshot>,
    refunds: Vec<(String, Decimal)>,
    lookup_error: Option<GatewayError>,
}

/// Scripted gateway. Unscripted charges come back `Initiated` with a
/// payment URL, the usual hosted-checkout flow.
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<GatewayState>,
    next_id: AtomicUsize,
    retrieve_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, step: ChargeScript) {
        self.state.lock().unwrap().script.push_back(step);
    }

    pub fn set_status(&self, charge_id: &str, status: ChargeStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(charge_id.to_string(), status);
    }

    pub fn register_reference(&self, reference: &str, charge_id: &str, status: ChargeStatus) {
        self.state.lock().unwrap().by_reference.insert(
            reference.to_string(),
            ChargeSnapshot {
                charge_id: charge_id.to_string(),
                status,
            },
        );
    }

    pub fn fail_lookups(&self, error: Option<GatewayError>) {
        self.state.lock().unwrap().lookup_error = error;
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.state.lock().unwrap().charges.clone()
    }

    pub fn charge_count(&self) -> usize {
        self.state.lock().unwrap().charges.len()
    }

    pub fn refunds(&self) -> Vec<(String, Decimal)> {
        self.state.lock().unwrap().refunds.clone()
    }

    pub fn retrieve_calls(&self) -> usize {
        self.retrieve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<CreatedCharge, GatewayError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.charges.push(request.clone());
            state
                .script
                .pop_front()
                .unwrap_or(ChargeScript::Status(ChargeStatus::Initiated))
        };

        let status = match step {
            ChargeScript::Status(status) => status,
            ChargeScript::Error(e) => return Err(e),
            ChargeScript::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        };

        let charge_id = format!("chg_{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut state = self.state.lock().unwrap();
        state.statuses.insert(charge_id.clone(), status);
        state.by_reference.insert(
            request.reference.clone(),
            ChargeSnapshot {
                charge_id: charge_id.clone(),
                status,
            },
        );
        Ok(CreatedCharge {
            payment_url: matches!(status, ChargeStatus::Initiated | ChargeStatus::Pending)
                .then(|| format!("https://checkout.test/{}", charge_id)),
            charge_id,
            status,
        })
    }

    async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.lookup_error {
            return Err(e.clone());
        }
        state
            .statuses
            .get(charge_id)
            .copied()
            .ok_or_else(|| GatewayError::Rejected(format!("no such charge {}", charge_id)))
    }

    async fn find_charge_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ChargeSnapshot>, GatewayError> {
        let state = self.state.lock().unwrap();
        if let Some(e) = &state.lookup_error {
            return Err(e.clone());
        }
        Ok(state.by_reference.get(reference).cloned())
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: Decimal,
        _currency: &str,
    ) -> Result<RefundResult, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.refunds.push((charge_id.to_string(), amount));
        Ok(RefundResult {
            refund_id: format!("re_{}", state.refunds.len()),
            status: "PENDING".to_string(),
        })
    }

    async fn test_connection(&self) -> ConnectionTest {
        ConnectionTest {
            success: true,
            message: "ok".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub merchant_id: Uuid,
    pub template: NotificationTemplate,
    pub variables: NotificationVars,
}

/// Records deliveries; can be switched to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: std::sync::atomic::AtomicBool,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, template: NotificationTemplate) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.template == template)
            .count()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(
        &self,
        merchant_id: Uuid,
        template: NotificationTemplate,
        variables: &NotificationVars,
    ) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected(503));
        }
        self.sent.lock().unwrap().push(SentNotification {
            merchant_id,
            template,
            variables: variables.clone(),
        });
        Ok(())
    }
}

pub struct Plans {
    pub free: Plan,
    pub basic: Plan,
    pub pro: Plan,
}

/// Test application wrapper.
pub struct TestApp {
    pub manager: Arc<SubscriptionManager>,
    pub store: Arc<InMemoryStore>,
    pub clock: ManualClock,
    pub gateway: Arc<MockGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub plans: Plans,
}

pub fn lifecycle_config() -> LifecycleConfig {
    LifecycleConfig {
        gateway_timeout_secs: 5,
        notification_timeout_secs: 2,
        reconcile_after_secs: 0,
        ..LifecycleConfig::default()
    }
}

fn plan_input(name: &str, monthly: i64, sort_order: i32, quotas: PlanQuotas) -> CreatePlan {
    CreatePlan {
        name: name.to_string(),
        monthly_price: dec(monthly),
        yearly_price: dec(monthly * 10),
        currency: CURRENCY.to_string(),
        quotas,
        features: PlanFeatures::default(),
        sort_order,
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::with_config(lifecycle_config()).await
    }

    pub async fn with_config(config: LifecycleConfig) -> Self {
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(start_time());
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let manager = Arc::new(SubscriptionManager::new(
            store.clone() as Arc<dyn SubscriptionStore>,
            gateway.clone(),
            notifier.clone(),
            Arc::new(clock.clone()),
            config,
            "https://merchant.test/billing/return",
        ));

        let catalog = manager.catalog();
        let free = catalog
            .create_plan(plan_input(
                "free",
                0,
                0,
                PlanQuotas {
                    max_conversations_per_month: Quota::Limited(100),
                    max_messages_per_month: Quota::Limited(1000),
                    max_voice_messages_per_month: Quota::Limited(0),
                    ..PlanQuotas::default()
                },
            ))
            .await
            .unwrap();
        let basic = catalog
            .create_plan(plan_input(
                "basic",
                100,
                1,
                PlanQuotas {
                    max_conversations_per_month: Quota::Limited(1000),
                    max_messages_per_month: Quota::Limited(10_000),
                    max_voice_messages_per_month: Quota::Limited(100),
                    ..PlanQuotas::default()
                },
            ))
            .await
            .unwrap();
        let pro = catalog
            .create_plan(plan_input("pro", 200, 2, PlanQuotas::default()))
            .await
            .unwrap();

        Self {
            manager,
            store,
            clock,
            gateway,
            notifier,
            plans: Plans { free, basic, pro },
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> DateTime<Utc> {
        use subscription_service::services::Clock;
        self.clock.now()
    }

    /// Subscribe to `plan` monthly and confirm the payment through the
    /// callback path.
    pub async fn paid_subscription(
        &self,
        merchant_id: Uuid,
        plan: &Plan,
    ) -> subscription_service::models::Subscription {
        self.paid_subscription_with_cycle(
            merchant_id,
            plan,
            subscription_service::models::BillingCycle::Monthly,
        )
        .await
    }

    pub async fn paid_subscription_with_cycle(
        &self,
        merchant_id: Uuid,
        plan: &Plan,
        cycle: subscription_service::models::BillingCycle,
    ) -> subscription_service::models::Subscription {
        use subscription_service::services::SubscribeOutcome;

        let outcome = self
            .manager
            .subscribe(merchant_id, plan.plan_id, cycle)
            .await
            .unwrap();
        let SubscribeOutcome::PaymentRequired { charge_id, .. } = outcome else {
            panic!("expected a payment step, got {:?}", outcome);
        };
        self.manager
            .handle_payment_callback(&charge_id, ChargeStatus::Captured)
            .await
            .unwrap();
        self.manager
            .current_subscription(merchant_id)
            .await
            .unwrap()
            .expect("subscription should be live after payment")
    }
}

