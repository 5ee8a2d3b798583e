//! Payment gateway capability.
//!
//! The lifecycle manager only sees [`PaymentGateway`]; wire details live in
//! the adapters. Adapters never retry, retry policy belongs to the caller.

mod tap;

pub use tap::{map_tap_status, TapGateway};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Charge status as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Initiated,
    Pending,
    Authorized,
    Captured,
    Failed,
    Cancelled,
}

impl ChargeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Initiated => "initiated",
            ChargeStatus::Pending => "pending",
            ChargeStatus::Authorized => "authorized",
            ChargeStatus::Captured => "captured",
            ChargeStatus::Failed => "failed",
            ChargeStatus::Cancelled => "cancelled",
        }
    }
}

/// Gateway failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    #[error("gateway timed out")]
    Timeout,
    /// The gateway answered but the outcome could not be read.
    #[error("gateway response could not be interpreted: {0}")]
    Indeterminate(String),
}

impl GatewayError {
    /// The charge may or may not exist; only a later lookup can tell.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Indeterminate(_))
    }
}

/// Who is paying.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeCustomer {
    pub merchant_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Charge creation request.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,
    pub customer: ChargeCustomer,
    pub redirect_url: String,
    /// Internal transaction id, lets a lost response be found again.
    pub reference: String,
    pub metadata: BTreeMap<String, String>,
}

/// Charge created at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCharge {
    pub charge_id: String,
    /// Hosted payment page; absent when the charge settled without one.
    pub payment_url: Option<String>,
    pub status: ChargeStatus,
}

/// Charge as looked up at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeSnapshot {
    pub charge_id: String,
    pub status: ChargeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundResult {
    pub refund_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<CreatedCharge, GatewayError>;

    async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError>;

    /// Look a charge up by the reference it was created with.
    async fn find_charge_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ChargeSnapshot>, GatewayError>;

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<RefundResult, GatewayError>;

    async fn test_connection(&self) -> ConnectionTest;
}

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(payload: &[u8], secret: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Rejected("invalid signing key".to_string()))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a webhook body against its hex signature in constant time.
pub fn verify_webhook_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    match compute_signature(payload, secret) {
        Ok(expected) => {
            let provided = signature.trim().to_ascii_lowercase();
            expected.as_bytes().ct_eq(provided.as_bytes()).into()
        }
        Err(_) => false,
    }
}
