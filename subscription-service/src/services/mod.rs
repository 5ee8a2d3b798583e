//! Services module for subscription-service.

pub mod catalog;
pub mod clock;
pub mod database;
pub mod gateway;
pub mod lifecycle;
pub mod memory_store;
pub mod metrics;
pub mod notifier;
pub mod proration;
pub mod store;
pub mod usage;

pub use catalog::PlanCatalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::PgStore;
pub use gateway::{PaymentGateway, TapGateway};
pub use lifecycle::{
    CallbackOutcome, ReconcileSummary, ReminderSummary, RenewalOutcome, SubscribeOutcome,
    SubscriptionManager, SweepFailure, SweepSummary, UpgradeOutcome, UsageAlertSummary,
};
pub use memory_store::InMemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{LogNotifier, NotificationTemplate, Notifier, WebhookNotifier};
pub use store::SubscriptionStore;
pub use usage::UsageMeter;
