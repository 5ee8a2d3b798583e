//! Subscription plan model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BillingCycle, UsageKind};

/// Raw storage value for "no limit".
pub const UNLIMITED_QUOTA: i64 = -1;

/// Upper bound on a plan resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quota {
    Limited(i64),
    Unlimited,
}

impl Quota {
    /// Decode the persisted representation (`-1` means unlimited).
    pub fn from_raw(value: i64) -> Self {
        if value < 0 {
            Quota::Unlimited
        } else {
            Quota::Limited(value)
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            Quota::Limited(limit) => *limit,
            Quota::Unlimited => UNLIMITED_QUOTA,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Quota::Unlimited)
    }

    /// Numeric limit, `None` when unlimited.
    pub fn limit(&self) -> Option<i64> {
        match self {
            Quota::Limited(limit) => Some(*limit),
            Quota::Unlimited => None,
        }
    }

    /// Whether `used` has reached the quota.
    pub fn is_exhausted(&self, used: i64) -> bool {
        match self {
            Quota::Limited(limit) => used >= *limit,
            Quota::Unlimited => false,
        }
    }
}

/// Per-plan quotas. Usage counters reset every billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanQuotas {
    pub max_conversations_per_month: Quota,
    pub max_messages_per_month: Quota,
    pub max_voice_messages_per_month: Quota,
    pub max_customers: Quota,
    pub max_whatsapp_numbers: Quota,
}

impl Default for PlanQuotas {
    fn default() -> Self {
        Self {
            max_conversations_per_month: Quota::Unlimited,
            max_messages_per_month: Quota::Unlimited,
            max_voice_messages_per_month: Quota::Unlimited,
            max_customers: Quota::Unlimited,
            max_whatsapp_numbers: Quota::Limited(1),
        }
    }
}

impl PlanQuotas {
    /// Per-period quota for a metered kind.
    pub fn for_kind(&self, kind: UsageKind) -> Quota {
        match kind {
            UsageKind::Conversation => self.max_conversations_per_month,
            UsageKind::Message => self.max_messages_per_month,
            UsageKind::VoiceMessage => self.max_voice_messages_per_month,
        }
    }
}

/// Feature flags granted by a plan.
///
/// Stored as JSON; flags missing from older rows decode as `false`, so new
/// flags can be added without touching existing plans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanFeatures {
    pub analytics: bool,
    pub automation: bool,
    pub api_access: bool,
    pub voice_messages: bool,
    pub priority_support: bool,
    pub custom_branding: bool,
}

/// Subscription plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub currency: String,
    pub quotas: PlanQuotas,
    pub features: PlanFeatures,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Plan {
    pub fn new(input: CreatePlan, now: DateTime<Utc>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            name: input.name,
            monthly_price: input.monthly_price,
            yearly_price: input.yearly_price,
            currency: input.currency,
            quotas: input.quotas,
            features: input.features,
            is_active: true,
            sort_order: input.sort_order,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Price charged for one full cycle.
    pub fn price_for(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Yearly => self.yearly_price,
        }
    }
}

/// Partial edit of a plan. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    pub name: Option<String>,
    pub monthly_price: Option<Decimal>,
    pub yearly_price: Option<Decimal>,
    pub quotas: Option<PlanQuotas>,
    pub features: Option<PlanFeatures>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i32>,
}

/// Audit record of one field changed on a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChange {
    pub change_id: Uuid,
    pub plan_id: Uuid,
    /// Operator who made the change, when known.
    pub changed_by: Option<Uuid>,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub created_utc: DateTime<Utc>,
}

impl Plan {
    /// Apply `update` and return one change record per field that actually
    /// moved.
    pub fn apply_update(
        &mut self,
        update: UpdatePlan,
        changed_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Vec<PlanChange> {
        let mut fields: Vec<(&'static str, String, String)> = Vec::new();

        if let Some(name) = update.name {
            if name != self.name {
                let old = std::mem::replace(&mut self.name, name);
                fields.push(("name", old, self.name.clone()));
            }
        }
        if let Some(price) = update.monthly_price {
            if price != self.monthly_price {
                fields.push(("monthly_price", self.monthly_price.to_string(), price.to_string()));
                self.monthly_price = price;
            }
        }
        if let Some(price) = update.yearly_price {
            if price != self.yearly_price {
                fields.push(("yearly_price", self.yearly_price.to_string(), price.to_string()));
                self.yearly_price = price;
            }
        }
        if let Some(quotas) = update.quotas {
            let pairs = [
                (
                    "max_conversations_per_month",
                    self.quotas.max_conversations_per_month,
                    quotas.max_conversations_per_month,
                ),
                (
                    "max_messages_per_month",
                    self.quotas.max_messages_per_month,
                    quotas.max_messages_per_month,
                ),
                (
                    "max_voice_messages_per_month",
                    self.quotas.max_voice_messages_per_month,
                    quotas.max_voice_messages_per_month,
                ),
                ("max_customers", self.quotas.max_customers, quotas.max_customers),
                (
                    "max_whatsapp_numbers",
                    self.quotas.max_whatsapp_numbers,
                    quotas.max_whatsapp_numbers,
                ),
            ];
            for (field, old, new) in pairs {
                if old != new {
                    fields.push((field, old.as_raw().to_string(), new.as_raw().to_string()));
                }
            }
            self.quotas = quotas;
        }
        if let Some(features) = update.features {
            if features != self.features {
                let encode = |f: &PlanFeatures| serde_json::to_string(f).unwrap_or_default();
                fields.push(("features", encode(&self.features), encode(&features)));
                self.features = features;
            }
        }
        if let Some(is_active) = update.is_active {
            if is_active != self.is_active {
                fields.push(("is_active", self.is_active.to_string(), is_active.to_string()));
                self.is_active = is_active;
            }
        }
        if let Some(sort_order) = update.sort_order {
            if sort_order != self.sort_order {
                fields.push(("sort_order", self.sort_order.to_string(), sort_order.to_string()));
                self.sort_order = sort_order;
            }
        }

        if !fields.is_empty() {
            self.updated_utc = now;
        }
        fields
            .into_iter()
            .map(|(field, old, new)| PlanChange {
                change_id: Uuid::new_v4(),
                plan_id: self.plan_id,
                changed_by,
                field_name: field.to_string(),
                old_value: Some(old),
                new_value: new,
                created_utc: now,
            })
            .collect()
    }
}

/// Input for creating or replacing a plan.
#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub currency: String,
    pub quotas: PlanQuotas,
    pub features: PlanFeatures,
    pub sort_order: i32,
}
