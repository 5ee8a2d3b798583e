//! Postgres-backed [`SubscriptionStore`].

use crate::error::{BillingError, Result};
use crate::models::{
    BillingCycle, PaymentTransaction, Plan, PlanChange, PlanFeatures, PlanQuotas, Quota,
    Subscription, SubscriptionStatus, TransactionMetadata, TransactionStatus, TransactionType,
    UsageAlert, UsageKind, UsagePeriod,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{check_transition, version_conflict, SubscriptionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const PLAN_COLUMNS: &str = "plan_id, name, monthly_price, yearly_price, currency, \
    max_conversations_per_month, max_messages_per_month, max_voice_messages_per_month, \
    max_customers, max_whatsapp_numbers, features, is_active, sort_order, created_utc, updated_utc";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, merchant_id, plan_id, billing_cycle, status, \
    start_date, end_date, billing_anchor, auto_renew, cancel_requested_at, cancellation_reason, \
    last_reminder_days, version, created_utc, updated_utc";

const USAGE_COLUMNS: &str = "subscription_id, merchant_id, period_start, period_end, \
    conversations_used, messages_used, voice_messages_used, last_reset_at, next_reset_at";

const USAGE_ALERT_COLUMNS: &str =
    "subscription_id, kind, merchant_id, period_start, percentage, sent_at";

const PLAN_CHANGE_COLUMNS: &str =
    "change_id, plan_id, changed_by, field_name, old_value, new_value, created_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, merchant_id, subscription_id, transaction_type, \
    amount, currency, status, gateway_charge_id, metadata, created_utc, updated_utc";

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> BillingError {
    move |e| BillingError::Database(anyhow::anyhow!("{}: {}", context, e))
}

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    name: String,
    monthly_price: Decimal,
    yearly_price: Decimal,
    currency: String,
    max_conversations_per_month: i64,
    max_messages_per_month: i64,
    max_voice_messages_per_month: i64,
    max_customers: i64,
    max_whatsapp_numbers: i64,
    features: Json<PlanFeatures>,
    is_active: bool,
    sort_order: i32,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            plan_id: row.plan_id,
            name: row.name,
            monthly_price: row.monthly_price,
            yearly_price: row.yearly_price,
            currency: row.currency,
            quotas: PlanQuotas {
                max_conversations_per_month: Quota::from_raw(row.max_conversations_per_month),
                max_messages_per_month: Quota::from_raw(row.max_messages_per_month),
                max_voice_messages_per_month: Quota::from_raw(row.max_voice_messages_per_month),
                max_customers: Quota::from_raw(row.max_customers),
                max_whatsapp_numbers: Quota::from_raw(row.max_whatsapp_numbers),
            },
            features: row.features.0,
            is_active: row.is_active,
            sort_order: row.sort_order,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    merchant_id: Uuid,
    plan_id: Uuid,
    billing_cycle: String,
    status: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    billing_anchor: DateTime<Utc>,
    auto_renew: bool,
    cancel_requested_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    last_reminder_days: Option<i32>,
    version: i64,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            subscription_id: row.subscription_id,
            merchant_id: row.merchant_id,
            plan_id: row.plan_id,
            billing_cycle: BillingCycle::from_string(&row.billing_cycle),
            status: SubscriptionStatus::from_string(&row.status),
            start_date: row.start_date,
            end_date: row.end_date,
            billing_anchor: row.billing_anchor,
            auto_renew: row.auto_renew,
            cancel_requested_at: row.cancel_requested_at,
            cancellation_reason: row.cancellation_reason,
            last_reminder_days: row.last_reminder_days,
            version: row.version,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct UsageRow {
    subscription_id: Uuid,
    merchant_id: Uuid,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    conversations_used: i64,
    messages_used: i64,
    voice_messages_used: i64,
    last_reset_at: DateTime<Utc>,
    next_reset_at: DateTime<Utc>,
}

impl From<UsageRow> for UsagePeriod {
    fn from(row: UsageRow) -> Self {
        UsagePeriod {
            subscription_id: row.subscription_id,
            merchant_id: row.merchant_id,
            period_start: row.period_start,
            period_end: row.period_end,
            conversations_used: row.conversations_used,
            messages_used: row.messages_used,
            voice_messages_used: row.voice_messages_used,
            last_reset_at: row.last_reset_at,
            next_reset_at: row.next_reset_at,
        }
    }
}

#[derive(FromRow)]
struct UsageAlertRow {
    subscription_id: Uuid,
    kind: String,
    merchant_id: Uuid,
    period_start: DateTime<Utc>,
    percentage: f64,
    sent_at: DateTime<Utc>,
}

impl From<UsageAlertRow> for UsageAlert {
    fn from(row: UsageAlertRow) -> Self {
        UsageAlert {
            subscription_id: row.subscription_id,
            merchant_id: row.merchant_id,
            kind: UsageKind::from_string(&row.kind),
            period_start: row.period_start,
            percentage: row.percentage,
            sent_at: row.sent_at,
        }
    }
}

#[derive(FromRow)]
struct PlanChangeRow {
    change_id: Uuid,
    plan_id: Uuid,
    changed_by: Option<Uuid>,
    field_name: String,
    old_value: Option<String>,
    new_value: String,
    created_utc: DateTime<Utc>,
}

impl From<PlanChangeRow> for PlanChange {
    fn from(row: PlanChangeRow) -> Self {
        PlanChange {
            change_id: row.change_id,
            plan_id: row.plan_id,
            changed_by: row.changed_by,
            field_name: row.field_name,
            old_value: row.old_value,
            new_value: row.new_value,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    merchant_id: Uuid,
    subscription_id: Option<Uuid>,
    transaction_type: String,
    amount: Decimal,
    currency: String,
    status: String,
    gateway_charge_id: Option<String>,
    metadata: Json<TransactionMetadata>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<TransactionRow> for PaymentTransaction {
    fn from(row: TransactionRow) -> Self {
        PaymentTransaction {
            transaction_id: row.transaction_id,
            merchant_id: row.merchant_id,
            subscription_id: row.subscription_id,
            transaction_type: TransactionType::from_string(&row.transaction_type),
            amount: row.amount,
            currency: row.currency,
            status: TransactionStatus::from_string(&row.status),
            gateway_charge_id: row.gateway_charge_id,
            metadata: row.metadata.0,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn upsert_plan_query(plan: &Plan) -> PgQuery<'_> {
    sqlx::query(
        r#"
        INSERT INTO plans (plan_id, name, monthly_price, yearly_price, currency, max_conversations_per_month, max_messages_per_month, max_voice_messages_per_month, max_customers, max_whatsapp_numbers, features, is_active, sort_order, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (plan_id) DO UPDATE SET
            name = EXCLUDED.name,
            monthly_price = EXCLUDED.monthly_price,
            yearly_price = EXCLUDED.yearly_price,
            currency = EXCLUDED.currency,
            max_conversations_per_month = EXCLUDED.max_conversations_per_month,
            max_messages_per_month = EXCLUDED.max_messages_per_month,
            max_voice_messages_per_month = EXCLUDED.max_voice_messages_per_month,
            max_customers = EXCLUDED.max_customers,
            max_whatsapp_numbers = EXCLUDED.max_whatsapp_numbers,
            features = EXCLUDED.features,
            is_active = EXCLUDED.is_active,
            sort_order = EXCLUDED.sort_order,
            updated_utc = EXCLUDED.updated_utc
        "#,
    )
    .bind(plan.plan_id)
    .bind(&plan.name)
    .bind(plan.monthly_price)
    .bind(plan.yearly_price)
    .bind(&plan.currency)
    .bind(plan.quotas.max_conversations_per_month.as_raw())
    .bind(plan.quotas.max_messages_per_month.as_raw())
    .bind(plan.quotas.max_voice_messages_per_month.as_raw())
    .bind(plan.quotas.max_customers.as_raw())
    .bind(plan.quotas.max_whatsapp_numbers.as_raw())
    .bind(Json(&plan.features))
    .bind(plan.is_active)
    .bind(plan.sort_order)
    .bind(plan.created_utc)
    .bind(plan.updated_utc)
}

/// Postgres connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "subscription-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_error("Failed to connect"))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    // =========================================================================
    // Plans
    // =========================================================================

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<Plan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans WHERE plan_id = $1",
            PLAN_COLUMNS
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get plan"))?;

        timer.observe_duration();
        Ok(row.map(Plan::from))
    }

    #[instrument(skip(self))]
    async fn list_active_plans(&self) -> Result<Vec<Plan>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_plans"])
            .start_timer();

        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {} FROM plans WHERE is_active = TRUE ORDER BY monthly_price, sort_order",
            PLAN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list plans"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    #[instrument(skip(self, plan), fields(plan_id = %plan.plan_id))]
    async fn upsert_plan(&self, plan: &Plan) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_plan"])
            .start_timer();

        upsert_plan_query(plan)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to upsert plan"))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, name = %plan.name, "Plan saved");
        Ok(())
    }

    #[instrument(skip(self, plan, changes), fields(plan_id = %plan.plan_id, changes = changes.len()))]
    async fn save_plan_changes(&self, plan: &Plan, changes: &[PlanChange]) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_plan_changes"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        upsert_plan_query(plan)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to upsert plan"))?;

        for change in changes {
            sqlx::query(&format!(
                "INSERT INTO plan_changes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                PLAN_CHANGE_COLUMNS
            ))
            .bind(change.change_id)
            .bind(change.plan_id)
            .bind(change.changed_by)
            .bind(&change.field_name)
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(change.created_utc)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to record plan change"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit plan changes"))?;

        timer.observe_duration();
        info!(plan_id = %plan.plan_id, changes = changes.len(), "Plan updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_plan_changes(&self, plan_id: Option<Uuid>) -> Result<Vec<PlanChange>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_plan_changes"])
            .start_timer();

        let rows = sqlx::query_as::<_, PlanChangeRow>(&format!(
            r#"
            SELECT {}
            FROM plan_changes
            WHERE $1::uuid IS NULL OR plan_id = $1
            ORDER BY created_utc DESC
            "#,
            PLAN_CHANGE_COLUMNS
        ))
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list plan changes"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(PlanChange::from).collect())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self, subscription), fields(merchant_id = %subscription.merchant_id, subscription_id = %subscription.subscription_id))]
    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (subscription_id, merchant_id, plan_id, billing_cycle, status, start_date, end_date, billing_anchor, auto_renew, cancel_requested_at, cancellation_reason, last_reminder_days, version, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(subscription.subscription_id)
        .bind(subscription.merchant_id)
        .bind(subscription.plan_id)
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.billing_anchor)
        .bind(subscription.auto_renew)
        .bind(subscription.cancel_requested_at)
        .bind(&subscription.cancellation_reason)
        .bind(subscription.last_reminder_days)
        .bind(subscription.version)
        .bind(subscription.created_utc)
        .bind(subscription.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::AlreadySubscribed {
                    merchant_id: subscription.merchant_id,
                }
            }
            _ => BillingError::Database(anyhow::anyhow!("Failed to insert subscription: {}", e)),
        })?;

        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, status = subscription.status.as_str(), "Subscription created");
        Ok(())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(&self, subscription_id: Uuid) -> Result<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get subscription"))?;

        timer.observe_duration();
        Ok(row.map(Subscription::from))
    }

    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    async fn find_live_subscription(&self, merchant_id: Uuid) -> Result<Option<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_live_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE merchant_id = $1 AND status IN ('trial', 'active')",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find live subscription"))?;

        timer.observe_duration();
        Ok(row.map(Subscription::from))
    }

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, expected_version))]
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected_version: i64,
    ) -> Result<Subscription> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let entry_states: Vec<String> = SubscriptionStatus::ALL
            .iter()
            .filter(|from| from.can_transition_to(subscription.status))
            .map(|from| from.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $3, billing_cycle = $4, status = $5, start_date = $6, end_date = $7,
                billing_anchor = $8, auto_renew = $9, cancel_requested_at = $10,
                cancellation_reason = $11, last_reminder_days = $12, version = version + 1,
                updated_utc = $13
            WHERE subscription_id = $1 AND version = $2
              AND (status = $5 OR status = ANY($14))
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.subscription_id)
        .bind(expected_version)
        .bind(subscription.plan_id)
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.billing_anchor)
        .bind(subscription.auto_renew)
        .bind(subscription.cancel_requested_at)
        .bind(&subscription.cancellation_reason)
        .bind(subscription.last_reminder_days)
        .bind(subscription.updated_utc)
        .bind(entry_states)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::AlreadySubscribed {
                    merchant_id: subscription.merchant_id,
                }
            }
            _ => BillingError::Database(anyhow::anyhow!("Failed to update subscription: {}", e)),
        })?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(row.into()),
            None => match self.get_subscription(subscription.subscription_id).await? {
                Some(current) if current.version == expected_version => {
                    check_transition(
                        subscription.subscription_id,
                        current.status,
                        subscription.status,
                    )?;
                    Err(version_conflict(subscription.subscription_id))
                }
                Some(_) => Err(version_conflict(subscription.subscription_id)),
                None => Err(BillingError::SubscriptionNotFound(
                    subscription.subscription_id,
                )),
            },
        }
    }

    #[instrument(skip(self))]
    async fn list_live_ending_before(&self, until: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_live_ending_before"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('trial', 'active') AND end_date <= $1
            ORDER BY end_date
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list due subscriptions"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_live_subscriptions(&self) -> Result<Vec<Subscription>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_live_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE status IN ('trial', 'active')
            ORDER BY created_utc
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list live subscriptions"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    // =========================================================================
    // Usage
    // =========================================================================

    #[instrument(skip(self, period), fields(subscription_id = %period.subscription_id))]
    async fn replace_usage_period(&self, period: &UsagePeriod) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["replace_usage_period"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO usage_periods (subscription_id, merchant_id, period_start, period_end, conversations_used, messages_used, voice_messages_used, last_reset_at, next_reset_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_id) DO UPDATE SET
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                conversations_used = EXCLUDED.conversations_used,
                messages_used = EXCLUDED.messages_used,
                voice_messages_used = EXCLUDED.voice_messages_used,
                last_reset_at = EXCLUDED.last_reset_at,
                next_reset_at = EXCLUDED.next_reset_at
            "#,
        )
        .bind(period.subscription_id)
        .bind(period.merchant_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .bind(period.conversations_used)
        .bind(period.messages_used)
        .bind(period.voice_messages_used)
        .bind(period.last_reset_at)
        .bind(period.next_reset_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to save usage period"))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_usage_period(&self, subscription_id: Uuid) -> Result<Option<UsagePeriod>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_usage_period"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageRow>(&format!(
            "SELECT {} FROM usage_periods WHERE subscription_id = $1",
            USAGE_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get usage period"))?;

        timer.observe_duration();
        Ok(row.map(UsagePeriod::from))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, kind = kind.as_str()))]
    async fn increment_usage(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
        count: i64,
    ) -> Result<Option<UsagePeriod>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_usage"])
            .start_timer();

        // Column names come from a closed enum, never from input.
        let column = kind.column();
        let row = sqlx::query_as::<_, UsageRow>(&format!(
            "UPDATE usage_periods SET {col} = {col} + $2 WHERE subscription_id = $1 RETURNING {cols}",
            col = column,
            cols = USAGE_COLUMNS
        ))
        .bind(subscription_id)
        .bind(count)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to increment usage"))?;

        timer.observe_duration();
        Ok(row.map(UsagePeriod::from))
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn reset_usage_period(
        &self,
        subscription_id: Uuid,
        expected_next_reset: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        reset_at: DateTime<Utc>,
    ) -> Result<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reset_usage_period"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE usage_periods
            SET period_start = $3, period_end = $4, conversations_used = 0, messages_used = 0,
                voice_messages_used = 0, last_reset_at = $5, next_reset_at = $4
            WHERE subscription_id = $1 AND next_reset_at = $2
            "#,
        )
        .bind(subscription_id)
        .bind(expected_next_reset)
        .bind(start)
        .bind(end)
        .bind(reset_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to reset usage period"))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, kind = kind.as_str()))]
    async fn get_usage_alert(
        &self,
        subscription_id: Uuid,
        kind: UsageKind,
    ) -> Result<Option<UsageAlert>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_usage_alert"])
            .start_timer();

        let row = sqlx::query_as::<_, UsageAlertRow>(&format!(
            "SELECT {} FROM usage_alerts WHERE subscription_id = $1 AND kind = $2",
            USAGE_ALERT_COLUMNS
        ))
        .bind(subscription_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get usage alert"))?;

        timer.observe_duration();
        Ok(row.map(UsageAlert::from))
    }

    #[instrument(skip(self, alert), fields(subscription_id = %alert.subscription_id, kind = alert.kind.as_str()))]
    async fn record_usage_alert(
        &self,
        alert: &UsageAlert,
        previous_sent_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_usage_alert"])
            .start_timer();

        let query = match previous_sent_at {
            None => sqlx::query(
                r#"
                INSERT INTO usage_alerts (subscription_id, kind, merchant_id, period_start, percentage, sent_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (subscription_id, kind) DO NOTHING
                "#,
            ),
            Some(_) => sqlx::query(
                r#"
                UPDATE usage_alerts
                SET merchant_id = $3, period_start = $4, percentage = $5, sent_at = $6
                WHERE subscription_id = $1 AND kind = $2 AND sent_at = $7
                "#,
            ),
        };

        let mut query = query
            .bind(alert.subscription_id)
            .bind(alert.kind.as_str())
            .bind(alert.merchant_id)
            .bind(alert.period_start)
            .bind(alert.percentage)
            .bind(alert.sent_at);
        if let Some(previous) = previous_sent_at {
            query = query.bind(previous);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to record usage alert"))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Payment transactions
    // =========================================================================

    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.transaction_id, merchant_id = %transaction.merchant_id))]
    async fn insert_transaction(&self, transaction: &PaymentTransaction) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO payment_transactions (transaction_id, merchant_id, subscription_id, transaction_type, amount, currency, status, gateway_charge_id, metadata, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(transaction.transaction_id)
        .bind(transaction.merchant_id)
        .bind(transaction.subscription_id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(transaction.status.as_str())
        .bind(&transaction.gateway_charge_id)
        .bind(Json(&transaction.metadata))
        .bind(transaction.created_utc)
        .bind(transaction.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::BadRequest(format!(
                    "charge {} already recorded",
                    transaction.gateway_charge_id.as_deref().unwrap_or_default()
                ))
            }
            _ => BillingError::Database(anyhow::anyhow!("Failed to insert transaction: {}", e)),
        })?;

        timer.observe_duration();
        info!(transaction_id = %transaction.transaction_id, transaction_type = transaction.transaction_type.as_str(), "Payment transaction recorded");
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get transaction"))?;

        timer.observe_duration();
        Ok(row.map(PaymentTransaction::from))
    }

    #[instrument(skip(self), fields(charge_id = %charge_id))]
    async fn find_transaction_by_charge(
        &self,
        charge_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_transaction_by_charge"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM payment_transactions WHERE gateway_charge_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(charge_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find transaction by charge"))?;

        timer.observe_duration();
        Ok(row.map(PaymentTransaction::from))
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, expected = expected.as_str(), next = next.as_str()))]
    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        next: TransactionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_status"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $3, updated_utc = $4
            WHERE transaction_id = $1 AND status = $2
            "#,
        )
        .bind(transaction_id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to update transaction status"))?;

        timer.observe_duration();

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_transaction(transaction_id).await? {
            Some(_) => Ok(false),
            None => Err(BillingError::TransactionNotFound(transaction_id.to_string())),
        }
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, charge_id = %charge_id))]
    async fn set_gateway_charge_id(
        &self,
        transaction_id: Uuid,
        charge_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_gateway_charge_id"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE payment_transactions SET gateway_charge_id = $2, updated_utc = $3 WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .bind(charge_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to set gateway charge id"))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(BillingError::TransactionNotFound(transaction_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id, subscription_id = %subscription_id))]
    async fn link_transaction_subscription(
        &self,
        transaction_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["link_transaction_subscription"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE payment_transactions SET subscription_id = $2 WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to link transaction"))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(BillingError::TransactionNotFound(transaction_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_pending_transactions(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_pending_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {}
            FROM payment_transactions
            WHERE status = 'pending' AND created_utc <= $1
            ORDER BY created_utc
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list pending transactions"))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(PaymentTransaction::from).collect())
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn find_pending_renewal(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<PaymentTransaction>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_pending_renewal"])
            .start_timer();

        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            r#"
            SELECT {}
            FROM payment_transactions
            WHERE subscription_id = $1 AND transaction_type = 'renewal' AND status = 'pending'
            ORDER BY created_utc DESC
            LIMIT 1
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find pending renewal"))?;

        timer.observe_duration();
        Ok(row.map(PaymentTransaction::from))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<()> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check failed"))?;

        timer.observe_duration();
        Ok(())
    }
}
