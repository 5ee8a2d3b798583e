use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use subscription_service::config::GatewayConfig;
use subscription_service::services::gateway::{
    ChargeCustomer, ChargeRequest, ChargeStatus, GatewayError, PaymentGateway, TapGateway,
};
use subscription_service::services::init_metrics;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET_KEY: &str = "sk_test_123";

fn gateway_for(server: &MockServer, secret_key: &str, timeout_secs: u64) -> TapGateway {
    init_metrics();
    TapGateway::new(GatewayConfig {
        base_url: format!("{}/v2", server.uri()),
        secret_key: Secret::new(secret_key.to_string()),
        webhook_secret: Secret::new("whsec".to_string()),
        timeout_secs,
        redirect_url: "https://merchant.test/return".to_string(),
    })
    .unwrap()
}

fn charge_request(reference: &str) -> ChargeRequest {
    ChargeRequest {
        amount: Decimal::new(9950, 2),
        currency: "SAR".to_string(),
        customer: ChargeCustomer {
            merchant_id: Uuid::new_v4(),
            email: Some("owner@merchant.test".to_string()),
            phone: None,
        },
        redirect_url: "https://merchant.test/return".to_string(),
        reference: reference.to_string(),
        metadata: BTreeMap::from([("plan".to_string(), "basic".to_string())]),
    }
}

#[tokio::test]
async fn create_charge_returns_hosted_payment_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(body_partial_json(json!({
            "amount": 99.5,
            "currency": "SAR",
            "reference": { "transaction": "txn-1" },
            "source": { "id": "src_all" },
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chg_TS01",
            "status": "INITIATED",
            "transaction": { "url": "https://checkout.tap.test/chg_TS01" },
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = gateway_for(&server, SECRET_KEY, 5)
        .create_charge(&charge_request("txn-1"))
        .await
        .unwrap();

    assert_eq!(created.charge_id, "chg_TS01");
    assert_eq!(created.status, ChargeStatus::Initiated);
    assert_eq!(
        created.payment_url.as_deref(),
        Some("https://checkout.tap.test/chg_TS01")
    );
}

#[tokio::test]
async fn client_errors_are_rejections_with_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{ "code": "1126", "description": "Invalid amount" }],
        })))
        .mount(&server)
        .await;

    let err = gateway_for(&server, SECRET_KEY, 5)
        .create_charge(&charge_request("txn-2"))
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::Rejected("1126 - Invalid amount".to_string()));
}

#[tokio::test]
async fn server_errors_are_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = gateway_for(&server, SECRET_KEY, 5)
        .create_charge(&charge_request("txn-3"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Unavailable(_)));
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/charges/chg_slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "chg_slow", "status": "CAPTURED" }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let err = gateway_for(&server, SECRET_KEY, 1)
        .retrieve_charge("chg_slow")
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::Timeout);
}

#[tokio::test]
async fn unreadable_success_is_indeterminate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/charges/chg_odd"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "CAPTURED" })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, SECRET_KEY, 5);
    let err = gateway
        .create_charge(&charge_request("txn-5"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Indeterminate(_)));
    assert!(err.is_indeterminate());

    let err = gateway.retrieve_charge("chg_odd").await.unwrap_err();
    assert!(matches!(err, GatewayError::Indeterminate(_)));
}

#[tokio::test]
async fn retrieve_maps_tap_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/charges/chg_A"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "chg_A", "status": "CAPTURED" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/charges/chg_B"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "chg_B", "status": "DECLINED" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/charges/chg_C"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "chg_C", "status": "UNKNOWN" })),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, SECRET_KEY, 5);
    assert_eq!(
        gateway.retrieve_charge("chg_C").await.unwrap(),
        ChargeStatus::Pending
    );
    assert_eq!(
        gateway.retrieve_charge("chg_A").await.unwrap(),
        ChargeStatus::Captured
    );
    assert_eq!(
        gateway.retrieve_charge("chg_B").await.unwrap(),
        ChargeStatus::Failed
    );
}

#[tokio::test]
async fn lost_charge_is_found_by_reference() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges/list"))
        .and(body_partial_json(json!({ "reference": { "transaction": "txn-lost" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "charges": [{ "id": "chg_L", "status": "IN_PROGRESS" }],
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/charges/list"))
        .and(body_partial_json(json!({ "reference": { "transaction": "txn-none" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "charges": [] })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, SECRET_KEY, 5);
    let found = gateway
        .find_charge_by_reference("txn-lost")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.charge_id, "chg_L");
    assert_eq!(found.status, ChargeStatus::Pending);

    assert!(gateway
        .find_charge_by_reference("txn-none")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn refund_posts_amount_for_charge() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/refunds"))
        .and(body_partial_json(json!({
            "charge_id": "chg_R",
            "amount": 25.0,
            "currency": "SAR",
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "re_1", "status": "PENDING" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let refund = gateway_for(&server, SECRET_KEY, 5)
        .refund_charge("chg_R", Decimal::from(25), "SAR")
        .await
        .unwrap();

    assert_eq!(refund.refund_id, "re_1");
    assert_eq!(refund.status, "PENDING");
}

#[tokio::test]
async fn unconfigured_key_never_calls_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let gateway = gateway_for(&server, "", 5);
    assert!(!gateway.is_configured());

    let err = gateway
        .create_charge(&charge_request("txn-4"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unavailable(_)));

    let check = gateway.test_connection().await;
    assert!(!check.success);
}

#[tokio::test]
async fn connection_check_lists_charges() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/charges/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "charges": [] })))
        .mount(&server)
        .await;

    let check = gateway_for(&server, SECRET_KEY, 5).test_connection().await;
    assert!(check.success);
}
