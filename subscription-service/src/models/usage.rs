//! Usage period model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BillingCycle, Quota};

/// Metered resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Conversation,
    Message,
    VoiceMessage,
}

impl UsageKind {
    pub const ALL: [UsageKind; 3] = [
        UsageKind::Conversation,
        UsageKind::Message,
        UsageKind::VoiceMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Conversation => "conversation",
            UsageKind::Message => "message",
            UsageKind::VoiceMessage => "voice_message",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "message" => UsageKind::Message,
            "voice_message" => UsageKind::VoiceMessage,
            _ => UsageKind::Conversation,
        }
    }

    /// Counter column backing this kind.
    pub fn column(&self) -> &'static str {
        match self {
            UsageKind::Conversation => "conversations_used",
            UsageKind::Message => "messages_used",
            UsageKind::VoiceMessage => "voice_messages_used",
        }
    }
}

/// Current metering window of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub subscription_id: Uuid,
    pub merchant_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub conversations_used: i64,
    pub messages_used: i64,
    pub voice_messages_used: i64,
    pub last_reset_at: DateTime<Utc>,
    pub next_reset_at: DateTime<Utc>,
}

impl UsagePeriod {
    /// Fresh, zeroed window of one cycle starting at `start`.
    pub fn open(
        subscription_id: Uuid,
        merchant_id: Uuid,
        cycle: BillingCycle,
        start: DateTime<Utc>,
    ) -> Self {
        Self::with_window(subscription_id, merchant_id, start, cycle.advance(start))
    }

    /// Fresh, zeroed window `[start, end)`.
    pub fn with_window(
        subscription_id: Uuid,
        merchant_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id,
            merchant_id,
            period_start: start,
            period_end: end,
            conversations_used: 0,
            messages_used: 0,
            voice_messages_used: 0,
            last_reset_at: start,
            next_reset_at: end,
        }
    }

    pub fn used(&self, kind: UsageKind) -> i64 {
        match kind {
            UsageKind::Conversation => self.conversations_used,
            UsageKind::Message => self.messages_used,
            UsageKind::VoiceMessage => self.voice_messages_used,
        }
    }

    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_reset_at
    }

    /// Window following this one that contains `now`.
    ///
    /// Windows are counted from the subscription's billing anchor, so a
    /// sweep that ran late still lands on the calendar-aligned window and a
    /// clamped month end does not shift later windows. Returns `None` when
    /// the current window has not elapsed.
    pub fn next_window(
        &self,
        cycle: BillingCycle,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.is_elapsed(now) {
            return None;
        }
        let (start, end) = cycle.window_containing(anchor, now);
        Some((start.max(self.next_reset_at), end))
    }
}

/// Usage of one metered kind against its quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetric {
    pub used: i64,
    /// `None` for unlimited quotas.
    pub limit: Option<i64>,
    pub unlimited: bool,
    /// `used / limit * 100`, not clamped. Zero for unlimited quotas.
    pub percentage: f64,
}

impl UsageMetric {
    pub fn new(used: i64, quota: Quota) -> Self {
        let percentage = match quota {
            Quota::Limited(0) if used > 0 => f64::INFINITY,
            Quota::Limited(0) => 0.0,
            Quota::Limited(limit) => used as f64 / limit as f64 * 100.0,
            Quota::Unlimited => 0.0,
        };
        Self {
            used,
            limit: quota.limit(),
            unlimited: quota.is_unlimited(),
            percentage,
        }
    }
}

/// Usage snapshot for a merchant's current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub merchant_id: Uuid,
    pub subscription_id: Uuid,
    pub conversations: UsageMetric,
    pub messages: UsageMetric,
    pub voice_messages: UsageMetric,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub last_reset_at: DateTime<Utc>,
    pub next_reset_at: DateTime<Utc>,
}

impl UsageReport {
    pub fn metric(&self, kind: UsageKind) -> &UsageMetric {
        match kind {
            UsageKind::Conversation => &self.conversations,
            UsageKind::Message => &self.messages,
            UsageKind::VoiceMessage => &self.voice_messages,
        }
    }

    /// Limited kinds at or above `threshold_percent`.
    pub fn approaching_limits(&self, threshold_percent: f64) -> Vec<UsageKind> {
        UsageKind::ALL
            .into_iter()
            .filter(|kind| {
                let metric = self.metric(*kind);
                !metric.unlimited && metric.percentage >= threshold_percent
            })
            .collect()
    }
}

/// Last usage warning sent for one metered kind of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAlert {
    pub subscription_id: Uuid,
    pub merchant_id: Uuid,
    pub kind: UsageKind,
    /// Usage window the warning was about.
    pub period_start: DateTime<Utc>,
    pub percentage: f64,
    pub sent_at: DateTime<Utc>,
}

/// When a usage warning is sent and repeated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageAlertPolicy {
    pub threshold_percent: f64,
    pub step_percent: f64,
    pub repeat_after: Duration,
}

impl UsageAlertPolicy {
    /// Whether `metric` deserves a warning given the last one sent.
    ///
    /// Only limited quotas between the threshold and 100% warn; past the
    /// limit the merchant is already blocked. A repeat needs the share to
    /// have grown by a step or the repeat interval to have passed. A new
    /// window starts over.
    pub fn should_alert(
        &self,
        metric: &UsageMetric,
        period_start: DateTime<Utc>,
        previous: Option<&UsageAlert>,
        now: DateTime<Utc>,
    ) -> bool {
        if metric.unlimited
            || metric.percentage < self.threshold_percent
            || metric.percentage >= 100.0
        {
            return false;
        }
        match previous {
            None => true,
            Some(last) if last.period_start != period_start => true,
            Some(last) => {
                metric.percentage - last.percentage >= self.step_percent
                    || now - last.sent_at >= self.repeat_after
            }
        }
    }
}

/// Result of a quota check before consuming a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub kind: UsageKind,
    pub allowed: bool,
    pub used: i64,
    pub limit: Option<i64>,
}
