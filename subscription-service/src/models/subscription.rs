//! Subscription model.

use chrono::{DateTime, Datelike, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing cycle for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "yearly" => BillingCycle::Yearly,
            _ => BillingCycle::Monthly,
        }
    }

    fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }

    /// Advance `from` by one calendar cycle.
    ///
    /// Day-of-month is clamped to the last day of the target month
    /// (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.nth_boundary(from, 1)
    }

    /// The boundary `n` cycles after `anchor`.
    ///
    /// Always counted from the anchor, so a clamped month does not carry
    /// over: Jan 31, Feb 28, Mar 31.
    pub fn nth_boundary(&self, anchor: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        anchor
            .checked_add_months(Months::new(self.months().saturating_mul(n)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// First boundary of the anchor's series strictly after `after`.
    pub fn next_boundary(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> DateTime<Utc> {
        self.nth_boundary(anchor, self.index_after(anchor, after))
    }

    /// The anchored window `[start, end)` that contains `at`. Before the
    /// anchor this is the first window.
    pub fn window_containing(
        &self,
        anchor: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let n = self.index_after(anchor, at);
        (self.nth_boundary(anchor, n - 1), self.nth_boundary(anchor, n))
    }

    /// Smallest `n >= 1` whose boundary lies after `after`.
    fn index_after(&self, anchor: DateTime<Utc>, after: DateTime<Utc>) -> u32 {
        let elapsed_months =
            (after.year() - anchor.year()) * 12 + after.month() as i32 - anchor.month() as i32;
        // One cycle short of the month estimate is never past `after`.
        let mut n = u32::try_from(elapsed_months / self.months() as i32 - 1)
            .unwrap_or(0)
            .max(1);
        loop {
            let boundary = self.nth_boundary(anchor, n);
            if boundary > after || boundary == DateTime::<Utc>::MAX_UTC {
                return n;
            }
            n += 1;
        }
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "trial" => SubscriptionStatus::Trial,
            "active" => SubscriptionStatus::Active,
            "cancelled" => SubscriptionStatus::Cancelled,
            _ => SubscriptionStatus::Expired,
        }
    }

    /// Trial and active subscriptions grant access; at most one per merchant.
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Trial | SubscriptionStatus::Active)
    }

    pub const ALL: [SubscriptionStatus; 4] = [
        SubscriptionStatus::Trial,
        SubscriptionStatus::Active,
        SubscriptionStatus::Expired,
        SubscriptionStatus::Cancelled,
    ];

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Trial, Active)
                | (Trial, Expired)
                | (Trial, Cancelled)
                | (Active, Active)
                | (Active, Expired)
                | (Active, Cancelled)
        )
    }
}

/// Merchant subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub merchant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Start of the first paid (or trial) period; every later period
    /// boundary is counted from here.
    pub billing_anchor: DateTime<Utc>,
    pub auto_renew: bool,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    /// Smallest reminder threshold (in days) already sent for this cycle.
    pub last_reminder_days: Option<i32>,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    /// Build a new subscription record at version 0.
    pub fn new(input: CreateSubscription, now: DateTime<Utc>) -> Self {
        Self {
            subscription_id: Uuid::new_v4(),
            merchant_id: input.merchant_id,
            plan_id: input.plan_id,
            billing_cycle: input.billing_cycle,
            status: input.status,
            start_date: input.start_date,
            end_date: input.end_date.max(input.start_date),
            billing_anchor: input.start_date,
            auto_renew: input.auto_renew,
            cancel_requested_at: None,
            cancellation_reason: None,
            last_reminder_days: None,
            version: 0,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Whether the merchant asked to stop renewing this subscription.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    /// Terminal status to apply when this subscription reaches its end date
    /// without renewing.
    pub fn lapse_status(&self) -> SubscriptionStatus {
        if self.is_cancel_requested() {
            SubscriptionStatus::Cancelled
        } else {
            SubscriptionStatus::Expired
        }
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub merchant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub auto_renew: bool,
}
