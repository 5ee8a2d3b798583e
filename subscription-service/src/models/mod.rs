//! Domain models for subscription-service.

mod plan;
mod subscription;
mod transaction;
mod usage;

pub use plan::{
    CreatePlan, Plan, PlanChange, PlanFeatures, PlanQuotas, Quota, UpdatePlan, UNLIMITED_QUOTA,
};
pub use subscription::{BillingCycle, CreateSubscription, Subscription, SubscriptionStatus};
pub use transaction::{
    CreateTransaction, PaymentTransaction, TransactionMetadata, TransactionStatus,
    TransactionType,
};
pub use usage::{
    LimitCheck, UsageAlert, UsageAlertPolicy, UsageKind, UsageMetric, UsagePeriod, UsageReport,
};
