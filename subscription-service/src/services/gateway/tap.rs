//! Tap Payments client.
//!
//! Implements charge creation, lookup and refunds against the Tap v2 API.

use super::{
    ChargeRequest, ChargeSnapshot, ChargeStatus, ConnectionTest, CreatedCharge, GatewayError,
    PaymentGateway, RefundResult,
};
use crate::config::GatewayConfig;
use crate::services::metrics::{record_gateway_call, GATEWAY_CALL_DURATION};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Tap client for interacting with the Tap API.
#[derive(Clone)]
pub struct TapGateway {
    client: Client,
    config: GatewayConfig,
}

#[derive(Debug, Serialize)]
struct CreateChargeBody<'a> {
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    currency: &'a str,
    customer: TapCustomer<'a>,
    source: TapSource,
    redirect: TapUrl<'a>,
    reference: TapReference<'a>,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct TapCustomer<'a> {
    first_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<TapPhone<'a>>,
}

#[derive(Debug, Serialize)]
struct TapPhone<'a> {
    country_code: &'a str,
    number: &'a str,
}

#[derive(Debug, Serialize)]
struct TapSource {
    id: &'static str,
}

#[derive(Debug, Serialize)]
struct TapUrl<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct TapReference<'a> {
    transaction: &'a str,
}

/// Charge object returned by Tap.
#[derive(Debug, Deserialize)]
struct TapCharge {
    id: String,
    status: String,
    #[serde(default)]
    transaction: Option<TapTransaction>,
}

#[derive(Debug, Deserialize)]
struct TapTransaction {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TapChargeList {
    #[serde(default)]
    charges: Vec<TapCharge>,
}

#[derive(Debug, Deserialize)]
struct TapRefund {
    id: String,
    status: String,
}

/// Tap API error response.
#[derive(Debug, Deserialize)]
struct TapErrorBody {
    #[serde(default)]
    errors: Vec<TapErrorDetail>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TapErrorDetail {
    code: Option<String>,
    description: Option<String>,
}

/// Map a Tap charge status onto [`ChargeStatus`].
///
/// Only explicit outcomes are terminal. Anything else (`UNKNOWN`, or a
/// status Tap adds later) stays pending until a lookup settles it.
pub fn map_tap_status(status: &str) -> ChargeStatus {
    match status.to_ascii_uppercase().as_str() {
        "INITIATED" => ChargeStatus::Initiated,
        "IN_PROGRESS" | "PENDING" | "UNKNOWN" => ChargeStatus::Pending,
        "AUTHORIZED" => ChargeStatus::Authorized,
        "CAPTURED" => ChargeStatus::Captured,
        "FAILED" | "DECLINED" | "TIMEDOUT" => ChargeStatus::Failed,
        "CANCELLED" | "ABANDONED" | "VOID" => ChargeStatus::Cancelled,
        _ => ChargeStatus::Pending,
    }
}

impl TapGateway {
    /// Create a new Tap client.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("failed to build client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Check if Tap is configured (secret key set).
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn ensure_configured(&self) -> Result<(), GatewayError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(GatewayError::Unavailable(
                "Tap secret key not configured".to_string(),
            ))
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<String, GatewayError> {
        let timer = GATEWAY_CALL_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let result = request
            .bearer_auth(self.config.secret_key.expose_secret())
            .send()
            .await;

        let outcome = match result {
            Ok(response) => Self::read_body(response).await,
            Err(e) if e.is_timeout() => Err(GatewayError::Timeout),
            Err(e) => Err(GatewayError::Unavailable(e.to_string())),
        };

        timer.observe_duration();
        record_gateway_call(
            operation,
            match &outcome {
                Ok(_) => "ok",
                Err(GatewayError::Unavailable(_)) => "unavailable",
                Err(GatewayError::Rejected(_)) => "rejected",
                Err(GatewayError::Timeout) => "timeout",
                Err(GatewayError::Indeterminate(_)) => "indeterminate",
            },
        );
        outcome
    }

    async fn read_body(response: Response) -> Result<String, GatewayError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Unavailable(e.to_string())
            }
        })?;

        tracing::debug!(status = %status, "Tap response received");

        if status.is_success() {
            return Ok(body);
        }

        let reason = serde_json::from_str::<TapErrorBody>(&body)
            .ok()
            .and_then(|err| {
                err.errors
                    .into_iter()
                    .find_map(|d| match (d.code, d.description) {
                        (Some(code), Some(desc)) => Some(format!("{} - {}", code, desc)),
                        (None, Some(desc)) => Some(desc),
                        (Some(code), None) => Some(code),
                        (None, None) => None,
                    })
                    .or(err.message)
            })
            .unwrap_or_else(|| format!("HTTP {}", status));

        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            tracing::warn!(status = %status, reason = %reason, "Tap unavailable");
            Err(GatewayError::Unavailable(reason))
        } else {
            tracing::error!(status = %status, reason = %reason, "Tap rejected request");
            Err(GatewayError::Rejected(reason))
        }
    }

    /// Decode a 2xx body. The request was accepted, so a body we cannot
    /// read leaves the outcome unknown rather than failed.
    fn parse<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, GatewayError> {
        serde_json::from_str(body).map_err(|e| {
            tracing::warn!(error = %e, "Unreadable Tap response");
            GatewayError::Indeterminate(format!("unexpected Tap response: {}", e))
        })
    }
}

#[async_trait]
impl PaymentGateway for TapGateway {
    async fn create_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<CreatedCharge, GatewayError> {
        self.ensure_configured()?;

        let body = CreateChargeBody {
            amount: request.amount,
            currency: &request.currency,
            customer: TapCustomer {
                first_name: format!("merchant-{}", request.customer.merchant_id),
                email: request.customer.email.as_deref(),
                phone: request.customer.phone.as_deref().map(|number| TapPhone {
                    country_code: "966",
                    number,
                }),
            },
            source: TapSource { id: "src_all" },
            redirect: TapUrl {
                url: &request.redirect_url,
            },
            reference: TapReference {
                transaction: &request.reference,
            },
            metadata: &request.metadata,
        };

        let response = self
            .send(
                "create_charge",
                self.client.post(self.url("charges")).json(&body),
            )
            .await?;
        let charge: TapCharge = Self::parse(&response)?;

        tracing::info!(
            charge_id = %charge.id,
            reference = %request.reference,
            amount = %request.amount,
            currency = %request.currency,
            "Tap charge created"
        );

        Ok(CreatedCharge {
            status: map_tap_status(&charge.status),
            payment_url: charge.transaction.and_then(|t| t.url),
            charge_id: charge.id,
        })
    }

    async fn retrieve_charge(&self, charge_id: &str) -> Result<ChargeStatus, GatewayError> {
        self.ensure_configured()?;

        let response = self
            .send(
                "retrieve_charge",
                self.client.get(self.url(&format!("charges/{}", charge_id))),
            )
            .await?;
        let charge: TapCharge = Self::parse(&response)?;
        Ok(map_tap_status(&charge.status))
    }

    async fn find_charge_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<ChargeSnapshot>, GatewayError> {
        self.ensure_configured()?;

        let body = json!({
            "limit": 1,
            "reference": { "transaction": reference },
        });
        let response = self
            .send(
                "find_charge",
                self.client.post(self.url("charges/list")).json(&body),
            )
            .await?;
        let list: TapChargeList = Self::parse(&response)?;

        Ok(list.charges.into_iter().next().map(|charge| ChargeSnapshot {
            status: map_tap_status(&charge.status),
            charge_id: charge.id,
        }))
    }

    async fn refund_charge(
        &self,
        charge_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<RefundResult, GatewayError> {
        self.ensure_configured()?;

        let body = json!({
            "charge_id": charge_id,
            "amount": amount.to_f64().unwrap_or_default(),
            "currency": currency,
            "reason": "requested_by_customer",
        });
        let response = self
            .send("refund_charge", self.client.post(self.url("refunds")).json(&body))
            .await?;
        let refund: TapRefund = Self::parse(&response)?;

        tracing::info!(charge_id = %charge_id, refund_id = %refund.id, "Tap refund created");

        Ok(RefundResult {
            refund_id: refund.id,
            status: refund.status,
        })
    }

    async fn test_connection(&self) -> ConnectionTest {
        if !self.is_configured() {
            return ConnectionTest {
                success: false,
                message: "Tap secret key is not configured".to_string(),
            };
        }

        let body = json!({ "limit": 1 });
        match self
            .send(
                "test_connection",
                self.client.post(self.url("charges/list")).json(&body),
            )
            .await
        {
            Ok(_) => ConnectionTest {
                success: true,
                message: "Connected to Tap".to_string(),
            },
            Err(e) => ConnectionTest {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_tap_statuses() {
        assert_eq!(map_tap_status("INITIATED"), ChargeStatus::Initiated);
        assert_eq!(map_tap_status("IN_PROGRESS"), ChargeStatus::Pending);
        assert_eq!(map_tap_status("CAPTURED"), ChargeStatus::Captured);
        assert_eq!(map_tap_status("authorized"), ChargeStatus::Authorized);
        assert_eq!(map_tap_status("ABANDONED"), ChargeStatus::Cancelled);
        assert_eq!(map_tap_status("DECLINED"), ChargeStatus::Failed);
        assert_eq!(map_tap_status("TIMEDOUT"), ChargeStatus::Failed);
    }

    #[test]
    fn unlisted_statuses_stay_pending() {
        for status in ["UNKNOWN", "RESTRICTED", "", "SOMETHING_NEW"] {
            assert_eq!(map_tap_status(status), ChargeStatus::Pending, "{}", status);
        }
    }

    #[test]
    fn unreadable_success_body_is_indeterminate() {
        let err = TapGateway::parse::<TapCharge>("<html>ok</html>").unwrap_err();
        assert!(matches!(err, GatewayError::Indeterminate(_)));
        assert!(err.is_indeterminate());
    }
}
