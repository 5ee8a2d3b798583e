//! Payment transaction model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BillingCycle;
use crate::services::gateway::ChargeStatus;

/// Why money is being collected (or returned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    Renewal,
    Upgrade,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Subscription => "subscription",
            TransactionType::Renewal => "renewal",
            TransactionType::Upgrade => "upgrade",
            TransactionType::Refund => "refund",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "renewal" => TransactionType::Renewal,
            "upgrade" => TransactionType::Upgrade,
            "refund" => TransactionType::Refund,
            _ => TransactionType::Subscription,
        }
    }
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Captured,
    Failed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Captured => "captured",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "authorized" => TransactionStatus::Authorized,
            "captured" => TransactionStatus::Captured,
            "failed" => TransactionStatus::Failed,
            "cancelled" => TransactionStatus::Cancelled,
            "refunded" => TransactionStatus::Refunded,
            _ => TransactionStatus::Pending,
        }
    }

    /// Map a gateway charge status onto the transaction lifecycle.
    pub fn from_charge(status: ChargeStatus) -> Self {
        match status {
            ChargeStatus::Initiated | ChargeStatus::Pending => TransactionStatus::Pending,
            ChargeStatus::Authorized => TransactionStatus::Authorized,
            ChargeStatus::Captured => TransactionStatus::Captured,
            ChargeStatus::Failed => TransactionStatus::Failed,
            ChargeStatus::Cancelled => TransactionStatus::Cancelled,
        }
    }

    /// Captured, failed, cancelled and refunded rows never change again,
    /// except captured → refunded through an explicit refund.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Captured
                | TransactionStatus::Failed
                | TransactionStatus::Cancelled
                | TransactionStatus::Refunded
        )
    }

    /// Money has been (or will certainly be) collected.
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Authorized | TransactionStatus::Captured
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Pending, Pending) => false,
            (Pending, _) => true,
            (Authorized, Captured | Failed | Cancelled) => true,
            (Captured, Refunded) => true,
            _ => false,
        }
    }
}

/// Plan and cycle context captured when the transaction was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionMetadata {
    pub plan_id: Option<Uuid>,
    pub billing_cycle: Option<BillingCycle>,
    pub previous_plan_id: Option<Uuid>,
    pub auto_renewal: bool,
    pub remaining_days: Option<i64>,
    pub total_days: Option<i64>,
    pub proration_credit: Option<Decimal>,
    pub proration_charge: Option<Decimal>,
    /// End date of the cycle a renewal extends; guards against applying it twice.
    pub renews_from: Option<DateTime<Utc>>,
    /// Transaction a refund row refers back to.
    pub refunded_transaction_id: Option<Uuid>,
}

/// Payment transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub transaction_id: Uuid,
    pub merchant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_charge_id: Option<String>,
    pub metadata: TransactionMetadata,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn new(input: CreateTransaction, now: DateTime<Utc>) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            merchant_id: input.merchant_id,
            subscription_id: input.subscription_id,
            transaction_type: input.transaction_type,
            amount: input.amount,
            currency: input.currency,
            status: input.status,
            gateway_charge_id: input.gateway_charge_id,
            metadata: input.metadata,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Input for recording a transaction.
#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub merchant_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_charge_id: Option<String>,
    pub metadata: TransactionMetadata,
}
