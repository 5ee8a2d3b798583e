mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::TestApp;
use http_body_util::BodyExt;
use secrecy::Secret;
use serde_json::{json, Value};
use subscription_service::handlers::{router, webhooks::SIGNATURE_HEADER};
use subscription_service::models::{BillingCycle, SubscriptionStatus, UsageKind};
use subscription_service::services::gateway::compute_signature;
use subscription_service::services::SubscribeOutcome;
use subscription_service::startup::AppState;
use tower::util::ServiceExt;
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_test";

fn app_router(app: &TestApp) -> Router {
    router(AppState::new(
        "subscription-service",
        app.manager.clone(),
        Secret::new(WEBHOOK_SECRET.to_string()),
    ))
}

fn signed_webhook(body: &Value, secret: &str) -> Request<Body> {
    let payload = body.to_string();
    let signature = compute_signature(payload.as_bytes(), secret).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/tap")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(payload))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn pending_charge(app: &TestApp, merchant: Uuid) -> String {
    match app
        .manager
        .subscribe(merchant, app.plans.basic.plan_id, BillingCycle::Monthly)
        .await
        .unwrap()
    {
        SubscribeOutcome::PaymentRequired { charge_id, .. } => charge_id,
        other => panic!("expected a payment step, got {:?}", other),
    }
}

#[tokio::test]
async fn signed_capture_activates_subscription() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let charge_id = pending_charge(&app, merchant).await;

    let response = app_router(&app)
        .oneshot(signed_webhook(
            &json!({ "id": charge_id, "status": "CAPTURED" }),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["result"], "applied");
    assert_eq!(body["status"], "captured");

    let sub = app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan_id, app.plans.basic.plan_id);
}

#[tokio::test]
async fn redelivered_webhook_is_acknowledged_without_effect() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let charge_id = pending_charge(&app, merchant).await;
    let event = json!({ "id": charge_id, "status": "CAPTURED" });

    let first = app_router(&app)
        .oneshot(signed_webhook(&event, WEBHOOK_SECRET))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let end_date = app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .unwrap()
        .end_date;

    let second = app_router(&app)
        .oneshot(signed_webhook(&event, WEBHOOK_SECRET))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(json_body(second).await["result"], "ignored");

    let sub = app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.end_date, end_date);
}

#[tokio::test]
async fn declined_charge_leaves_merchant_without_subscription() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let charge_id = pending_charge(&app, merchant).await;

    let response = app_router(&app)
        .oneshot(signed_webhook(
            &json!({ "id": charge_id, "status": "DECLINED" }),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "failed");
    assert!(app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unlisted_status_keeps_charge_open_until_capture() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let charge_id = pending_charge(&app, merchant).await;

    for status in ["UNKNOWN", "RESTRICTED"] {
        let response = app_router(&app)
            .oneshot(signed_webhook(
                &json!({ "id": charge_id, "status": status }),
                WEBHOOK_SECRET,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"], "ignored");
    }
    assert!(app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .is_none());

    let response = app_router(&app)
        .oneshot(signed_webhook(
            &json!({ "id": charge_id, "status": "CAPTURED" }),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["result"], "applied");

    let sub = app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let charge_id = pending_charge(&app, merchant).await;

    let response = app_router(&app)
        .oneshot(signed_webhook(
            &json!({ "id": charge_id, "status": "CAPTURED" }),
            "some-other-secret",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app
        .manager
        .current_subscription(merchant)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/tap")
                .body(Body::from(
                    json!({ "id": "chg_1", "status": "CAPTURED" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_charge_is_acknowledged() {
    let app = TestApp::spawn().await;

    let response = app_router(&app)
        .oneshot(signed_webhook(
            &json!({ "id": "chg_unknown", "status": "CAPTURED" }),
            WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["result"], "ignored");
    assert_eq!(body["reason"], "unknown charge");
}

#[tokio::test]
async fn malformed_payload_is_bad_request() {
    let app = TestApp::spawn().await;

    let response = app_router(&app)
        .oneshot(signed_webhook(&json!({ "object": "charge" }), WEBHOOK_SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn usage_alert_sweep_can_be_triggered() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.paid_subscription(merchant, &app.plans.basic).await;
    app.manager
        .usage()
        .record_usage(merchant, UsageKind::Conversation, 820)
        .await
        .unwrap();

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/internal/sweeps/usage-alerts")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["checked"], 1);
    assert_eq!(body["sent"], 1);
}

#[tokio::test]
async fn health_reports_service_name() {
    let app = TestApp::spawn().await;

    let response = app_router(&app)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "subscription-service");
}

#[tokio::test]
async fn usage_endpoint_reports_current_period() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.paid_subscription(merchant, &app.plans.basic).await;
    app.manager
        .usage()
        .record_usage(merchant, UsageKind::Conversation, 950)
        .await
        .unwrap();

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .uri(format!("/merchants/{}/usage", merchant))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["conversations"]["used"], 950);
    assert_eq!(body["conversations"]["limit"], 1000);
}

#[tokio::test]
async fn usage_for_unknown_merchant_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .uri(format!("/merchants/{}/usage", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expiry_sweep_can_be_triggered() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager.start_trial(merchant).await.unwrap();
    app.advance(chrono::Duration::days(8));

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/internal/sweeps/expiry")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["expired"], 1);
}
