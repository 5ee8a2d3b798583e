//! Plan catalog. Read-mostly access to plan definitions.

use crate::error::{BillingError, Result};
use crate::models::{CreatePlan, Plan, PlanChange, UpdatePlan};
use crate::services::clock::Clock;
use crate::services::store::SubscriptionStore;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))
    }

    /// A plan that can be sold to new subscribers.
    pub async fn get_active_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let plan = self.get_plan(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanInactive(plan_id));
        }
        Ok(plan)
    }

    /// Active plans ordered by ascending monthly price.
    pub async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        self.store.list_active_plans().await
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_plan(&self, input: CreatePlan) -> Result<Plan> {
        if input.monthly_price < Decimal::ZERO || input.yearly_price < Decimal::ZERO {
            return Err(BillingError::BadRequest(
                "plan prices must not be negative".to_string(),
            ));
        }
        if input.currency.len() != 3 {
            return Err(BillingError::BadRequest(format!(
                "invalid currency code: {}",
                input.currency
            )));
        }
        let plan = Plan::new(input, self.clock.now());
        self.store.upsert_plan(&plan).await?;
        Ok(plan)
    }

    /// Edit a plan and record one audit entry per field that changed.
    /// Existing subscriptions see new quotas from their next check; prices
    /// apply from their next charge.
    #[instrument(skip(self, update), fields(plan_id = %plan_id))]
    pub async fn update_plan(
        &self,
        plan_id: Uuid,
        update: UpdatePlan,
        changed_by: Option<Uuid>,
    ) -> Result<(Plan, Vec<PlanChange>)> {
        let negative = |price: Option<Decimal>| price.is_some_and(|p| p < Decimal::ZERO);
        if negative(update.monthly_price) || negative(update.yearly_price) {
            return Err(BillingError::BadRequest(
                "plan prices must not be negative".to_string(),
            ));
        }
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(BillingError::BadRequest(
                "plan name must not be empty".to_string(),
            ));
        }

        let mut plan = self.get_plan(plan_id).await?;
        let changes = plan.apply_update(update, changed_by, self.clock.now());
        if changes.is_empty() {
            return Ok((plan, changes));
        }

        self.store.save_plan_changes(&plan, &changes).await?;
        info!(
            plan_id = %plan_id,
            fields = ?changes.iter().map(|c| c.field_name.as_str()).collect::<Vec<_>>(),
            "Plan edited"
        );
        Ok((plan, changes))
    }

    /// Audit trail of plan edits, newest first.
    pub async fn plan_changes(&self, plan_id: Option<Uuid>) -> Result<Vec<PlanChange>> {
        self.store.list_plan_changes(plan_id).await
    }

    /// Stop selling a plan. Existing subscriptions keep it.
    pub async fn deactivate_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let update = UpdatePlan {
            is_active: Some(false),
            ..Default::default()
        };
        let (plan, _) = self.update_plan(plan_id, update, None).await?;
        Ok(plan)
    }

    /// Plan attached to new trials: the configured one, else the cheapest.
    pub async fn trial_plan(&self, preferred: Option<Uuid>) -> Result<Plan> {
        if let Some(plan_id) = preferred {
            return self.get_active_plan(plan_id).await;
        }
        self.list_active_plans()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BillingError::BadRequest("no active plans configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanFeatures, PlanQuotas, Quota};
    use crate::services::clock::{ManualClock, SystemClock};
    use chrono::Utc;
    use crate::services::memory_store::InMemoryStore;

    fn input(name: &str, monthly: i64, sort_order: i32) -> CreatePlan {
        CreatePlan {
            name: name.to_string(),
            monthly_price: Decimal::from(monthly),
            yearly_price: Decimal::from(monthly * 10),
            currency: "SAR".to_string(),
            quotas: PlanQuotas::default(),
            features: PlanFeatures::default(),
            sort_order,
        }
    }

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(Arc::new(InMemoryStore::new()), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn lists_active_plans_by_price() {
        let catalog = catalog();
        catalog.create_plan(input("pro", 299, 2)).await.unwrap();
        let basic = catalog.create_plan(input("basic", 99, 1)).await.unwrap();
        let retired = catalog.create_plan(input("legacy", 49, 0)).await.unwrap();
        catalog.deactivate_plan(retired.plan_id).await.unwrap();

        let plans = catalog.list_active_plans().await.unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["basic", "pro"]);

        let trial = catalog.trial_plan(None).await.unwrap();
        assert_eq!(trial.plan_id, basic.plan_id);
    }

    #[tokio::test]
    async fn plan_edits_are_audited_per_field() {
        let clock = ManualClock::new(Utc::now());
        let catalog = PlanCatalog::new(Arc::new(InMemoryStore::new()), Arc::new(clock.clone()));
        let plan = catalog.create_plan(input("basic", 99, 1)).await.unwrap();
        let admin = Uuid::new_v4();

        let (edited, changes) = catalog
            .update_plan(
                plan.plan_id,
                UpdatePlan {
                    monthly_price: Some(Decimal::from(129)),
                    yearly_price: Some(plan.yearly_price),
                    quotas: Some(PlanQuotas {
                        max_messages_per_month: Quota::Limited(20_000),
                        ..plan.quotas.clone()
                    }),
                    ..Default::default()
                },
                Some(admin),
            )
            .await
            .unwrap();

        assert_eq!(edited.monthly_price, Decimal::from(129));
        let fields: Vec<_> = changes.iter().map(|c| c.field_name.as_str()).collect();
        assert_eq!(fields, vec!["monthly_price", "max_messages_per_month"]);
        assert_eq!(changes[0].old_value.as_deref(), Some("99"));
        assert_eq!(changes[0].new_value, "129");
        assert!(changes.iter().all(|c| c.changed_by == Some(admin)));

        let stored = catalog.get_plan(plan.plan_id).await.unwrap();
        assert_eq!(stored.monthly_price, Decimal::from(129));

        clock.advance(chrono::Duration::minutes(5));
        catalog.deactivate_plan(plan.plan_id).await.unwrap();
        let log = catalog.plan_changes(Some(plan.plan_id)).await.unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].field_name, "is_active");
        assert!(catalog.plan_changes(Some(Uuid::new_v4())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn negative_price_edit_is_rejected() {
        let catalog = catalog();
        let plan = catalog.create_plan(input("basic", 99, 1)).await.unwrap();

        let err = catalog
            .update_plan(
                plan.plan_id,
                UpdatePlan {
                    yearly_price: Some(Decimal::from(-1)),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::BadRequest(_)));
        assert!(catalog.plan_changes(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_inactive_plans() {
        let catalog = catalog();
        let missing = Uuid::new_v4();
        assert!(matches!(
            catalog.get_plan(missing).await,
            Err(BillingError::PlanNotFound(id)) if id == missing
        ));

        let plan = catalog.create_plan(input("old", 10, 0)).await.unwrap();
        catalog.deactivate_plan(plan.plan_id).await.unwrap();
        assert!(matches!(
            catalog.get_active_plan(plan.plan_id).await,
            Err(BillingError::PlanInactive(_))
        ));
    }
}
