mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{dec, lifecycle_config, ChargeScript, TestApp};
use subscription_service::config::LifecycleConfig;
use subscription_service::models::{
    BillingCycle, SubscriptionStatus, TransactionStatus, TransactionType, UsageKind,
};
use subscription_service::services::gateway::{ChargeStatus, GatewayError};
use subscription_service::services::NotificationTemplate;
use uuid::Uuid;

fn renewal_transactions(app: &TestApp) -> Vec<subscription_service::models::PaymentTransaction> {
    app.store
        .transactions()
        .into_iter()
        .filter(|t| t.transaction_type == TransactionType::Renewal)
        .collect()
}

#[tokio::test]
async fn expired_trial_is_closed_once() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager.start_trial(merchant).await.unwrap();
    app.advance(Duration::days(8));

    let first = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(first.checked, 1);
    assert_eq!(first.expired, 1);
    assert!(first.failures.is_empty());

    let second = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(second.checked, 0);
    assert_eq!(second.expired, 0);

    assert!(app.manager.current_subscription(merchant).await.unwrap().is_none());
    assert_eq!(
        app.store.subscriptions_for(merchant)[0].status,
        SubscriptionStatus::Expired
    );
    assert_eq!(app.notifier.count(NotificationTemplate::SubscriptionExpired), 1);
}

#[tokio::test]
async fn subscriptions_not_yet_due_are_left_alone() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager.start_trial(merchant).await.unwrap();
    app.advance(Duration::days(6));

    let summary = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(summary.checked, 0);
    assert_eq!(
        app.manager.current_subscription(merchant).await.unwrap().unwrap().status,
        SubscriptionStatus::Trial
    );
}

#[tokio::test]
async fn concurrent_sweeps_expire_each_subscription_once() {
    let app = TestApp::spawn().await;
    for _ in 0..5 {
        app.manager.start_trial(Uuid::new_v4()).await.unwrap();
    }
    app.advance(Duration::days(8));

    let (a, b) = tokio::join!(
        app.manager.run_expiry_sweep(),
        app.manager.run_expiry_sweep()
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.expired + b.expired, 5);
    assert_eq!(app.notifier.count(NotificationTemplate::SubscriptionExpired), 5);
}

#[tokio::test]
async fn notification_failure_does_not_block_expiry() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager.start_trial(merchant).await.unwrap();
    app.notifier.set_failing(true);
    app.advance(Duration::days(8));

    let summary = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(summary.expired, 1);
    assert!(app.manager.current_subscription(merchant).await.unwrap().is_none());
}

#[tokio::test]
async fn due_subscription_renews_for_next_cycle() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;
    app.manager
        .usage()
        .record_usage(merchant, UsageKind::Message, 40)
        .await
        .unwrap();

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date + Duration::hours(1));

    let summary = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(summary.renewed, 1);
    assert_eq!(summary.expired, 0);

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.subscription_id, sub.subscription_id);
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.start_date, sub.end_date);
    assert_eq!(renewed.end_date, BillingCycle::Monthly.advance(sub.end_date));

    let renewals = renewal_transactions(&app);
    assert_eq!(renewals.len(), 1);
    assert_eq!(renewals[0].status, TransactionStatus::Captured);
    assert_eq!(renewals[0].metadata.renews_from, Some(sub.end_date));

    let usage = app.manager.usage().get_usage(merchant).await.unwrap();
    assert_eq!(usage.messages.used, 0);
    assert_eq!(usage.period_start, sub.end_date);

    // Nothing left to do on the next run.
    let again = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(again.checked, 0);
    assert_eq!(renewal_transactions(&app).len(), 1);
    assert_eq!(app.notifier.count(NotificationTemplate::RenewalSucceeded), 1);
}

#[tokio::test]
async fn declined_renewal_expires_subscription() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.gateway.script(ChargeScript::Error(GatewayError::Rejected(
        "insufficient funds".to_string(),
    )));
    app.clock.set(sub.end_date + Duration::hours(1));

    let summary = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].subscription_id, sub.subscription_id);
    assert!(summary.failures[0].reason.contains("insufficient funds"));

    assert!(app.manager.current_subscription(merchant).await.unwrap().is_none());
    assert_eq!(
        app.store.subscriptions_for(merchant)[0].status,
        SubscriptionStatus::Expired
    );
    assert_eq!(renewal_transactions(&app)[0].status, TransactionStatus::Failed);
    assert_eq!(app.notifier.count(NotificationTemplate::RenewalFailed), 1);
}

#[tokio::test]
async fn pending_renewal_settles_on_a_later_sweep() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.gateway.script(ChargeScript::Status(ChargeStatus::Pending));
    app.clock.set(sub.end_date + Duration::hours(1));

    let first = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(first.pending, 1);
    let live = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(live.end_date, sub.end_date);

    // Still pending: no second charge is created.
    let second = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(second.pending, 1);
    assert_eq!(renewal_transactions(&app).len(), 1);

    let charge_id = renewal_transactions(&app)[0]
        .gateway_charge_id
        .clone()
        .unwrap();
    app.gateway.set_status(&charge_id, ChargeStatus::Captured);
    app.advance(Duration::hours(1));

    let third = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(third.reconciliation.unwrap().settled, 1);

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.end_date, BillingCycle::Monthly.advance(sub.end_date));
    assert_eq!(renewal_transactions(&app).len(), 1);
    assert_eq!(app.gateway.charge_count(), 2);
}

#[tokio::test]
async fn unreadable_renewal_response_is_reconciled_not_failed() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.gateway.script(ChargeScript::Error(GatewayError::Indeterminate(
        "unexpected Tap response".to_string(),
    )));
    app.clock.set(sub.end_date + Duration::hours(1));

    let first = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(first.pending, 1);
    assert_eq!(first.failed, 0);
    let renewal = renewal_transactions(&app).remove(0);
    assert_eq!(renewal.status, TransactionStatus::Pending);
    let live = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(live.status, SubscriptionStatus::Active);
    assert_eq!(app.notifier.count(NotificationTemplate::RenewalFailed), 0);

    // The charge did go through; reconciliation finds it by reference.
    app.gateway.register_reference(
        &renewal.transaction_id.to_string(),
        "chg_late",
        ChargeStatus::Captured,
    );
    app.advance(Duration::hours(1));

    let second = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(second.reconciliation.unwrap().settled, 1);
    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.end_date, BillingCycle::Monthly.advance(sub.end_date));
    assert_eq!(renewal_transactions(&app).len(), 1);
    assert_eq!(
        renewal_transactions(&app)[0].gateway_charge_id.as_deref(),
        Some("chg_late")
    );
}

#[tokio::test]
async fn yearly_subscription_renews_for_a_year_at_yearly_price() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app
        .paid_subscription_with_cycle(merchant, &app.plans.basic, BillingCycle::Yearly)
        .await;
    assert_eq!(sub.end_date, Utc.with_ymd_and_hms(2027, 4, 1, 0, 0, 0).unwrap());

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date + Duration::hours(1));

    let summary = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(summary.renewed, 1);

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.billing_cycle, BillingCycle::Yearly);
    assert_eq!(renewed.start_date, sub.end_date);
    assert_eq!(
        renewed.end_date,
        Utc.with_ymd_and_hms(2028, 4, 1, 0, 0, 0).unwrap()
    );

    let renewals = renewal_transactions(&app);
    assert_eq!(renewals.len(), 1);
    assert_eq!(renewals[0].amount, app.plans.basic.yearly_price);
    assert_eq!(renewals[0].amount, dec(1000));
    assert_eq!(renewals[0].metadata.billing_cycle, Some(BillingCycle::Yearly));
}

#[tokio::test]
async fn month_end_renewals_keep_the_anchor_day() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.clock
        .set(Utc.with_ymd_and_hms(2026, 1, 31, 10, 0, 0).unwrap());
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;
    assert_eq!(
        sub.end_date,
        Utc.with_ymd_and_hms(2026, 2, 28, 10, 0, 0).unwrap()
    );

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date + Duration::hours(1));
    app.manager.run_expiry_sweep().await.unwrap();

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(
        renewed.end_date,
        Utc.with_ymd_and_hms(2026, 3, 31, 10, 0, 0).unwrap()
    );
    let usage = app.manager.usage().get_usage(merchant).await.unwrap();
    assert_eq!(usage.period_start, sub.end_date);
    assert_eq!(usage.period_end, renewed.end_date);
}

#[tokio::test(start_paused = true)]
async fn unanswered_renewal_is_abandoned_after_grace_window() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.gateway.script(ChargeScript::Hang);
    app.clock.set(sub.end_date + Duration::hours(1));

    let first = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(first.pending, 1);
    assert_eq!(renewal_transactions(&app)[0].status, TransactionStatus::Pending);

    let second = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(second.pending, 1);
    assert_eq!(app.gateway.charge_count(), 2);

    app.advance(Duration::hours(49));
    let third = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(third.reconciliation.unwrap().abandoned, 1);

    assert_eq!(renewal_transactions(&app)[0].status, TransactionStatus::Cancelled);
    assert_eq!(
        app.store.subscriptions_for(merchant)[0].status,
        SubscriptionStatus::Expired
    );
}

#[tokio::test]
async fn lookup_failures_leave_transactions_pending() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager
        .subscribe(merchant, app.plans.basic.plan_id, BillingCycle::Monthly)
        .await
        .unwrap();
    app.gateway
        .fail_lookups(Some(GatewayError::Unavailable("maintenance".to_string())));
    app.advance(Duration::hours(72));

    let summary = app.manager.reconcile_pending_transactions().await.unwrap();
    assert_eq!(summary.still_pending, 1);
    assert_eq!(app.store.transactions()[0].status, TransactionStatus::Pending);
}

#[tokio::test]
async fn renewal_sweep_charges_ahead_of_end_date() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.clock.set(sub.end_date - Duration::hours(30));
    let early = app.manager.run_renewal_sweep().await.unwrap();
    assert_eq!(early.checked, 0);

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date - Duration::hours(12));
    let summary = app.manager.run_renewal_sweep().await.unwrap();
    assert_eq!(summary.renewed, 1);

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.end_date, BillingCycle::Monthly.advance(sub.end_date));

    // The hourly sweep at the old end date has nothing to do.
    app.clock.set(sub.end_date + Duration::hours(1));
    let expiry = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(expiry.checked, 0);
    assert_eq!(renewal_transactions(&app).len(), 1);
}

#[tokio::test]
async fn early_renewal_failure_stops_auto_renew_but_keeps_access() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.gateway.script(ChargeScript::Status(ChargeStatus::Failed));
    app.clock.set(sub.end_date - Duration::hours(6));
    let summary = app.manager.run_renewal_sweep().await.unwrap();
    assert_eq!(summary.failed, 1);

    let live = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(live.status, SubscriptionStatus::Active);
    assert!(!live.auto_renew);

    app.clock.set(sub.end_date + Duration::hours(1));
    let expiry = app.manager.run_expiry_sweep().await.unwrap();
    assert_eq!(expiry.expired, 1);
    assert_eq!(renewal_transactions(&app).len(), 1);
}

#[tokio::test]
async fn reminders_fire_once_per_threshold() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.clock.set(sub.end_date - Duration::days(6));
    let first = app.manager.run_reminder_sweep().await.unwrap();
    assert_eq!(first.sent, 1);

    let repeat = app.manager.run_reminder_sweep().await.unwrap();
    assert_eq!(repeat.sent, 0);
    assert_eq!(repeat.skipped, 1);

    app.clock.set(sub.end_date - Duration::days(2));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 1);

    app.clock.set(sub.end_date - Duration::hours(12));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 1);

    let days: Vec<_> = app
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.template == NotificationTemplate::RenewalUpcoming)
        .map(|n| n.variables["days_remaining"].clone())
        .collect();
    assert_eq!(days, vec!["6", "2", "1"]);
    assert_eq!(app.notifier.count(NotificationTemplate::ExpiryReminder), 0);
}

#[tokio::test]
async fn late_reminder_skips_missed_thresholds() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.manager.start_trial(merchant).await.unwrap();
    app.advance(Duration::days(5));

    let summary = app.manager.run_reminder_sweep().await.unwrap();
    assert_eq!(summary.sent, 1);

    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, NotificationTemplate::ExpiryReminder);
    assert_eq!(sent[0].variables["days_remaining"], "2");

    app.advance(Duration::hours(1));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 0);
}

#[tokio::test]
async fn renewal_resets_reminders_for_next_cycle() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.clock.set(sub.end_date - Duration::hours(12));
    app.manager.run_reminder_sweep().await.unwrap();

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date + Duration::hours(1));
    app.manager.run_expiry_sweep().await.unwrap();

    let renewed = app.manager.current_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(renewed.last_reminder_days, None);

    app.clock.set(renewed.end_date - Duration::days(6));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 1);
}

#[tokio::test]
async fn reminder_thresholds_come_from_config() {
    let app = TestApp::with_config(LifecycleConfig {
        reminder_days: vec![14],
        ..lifecycle_config()
    })
    .await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;

    app.clock.set(sub.end_date - Duration::days(10));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 1);
    app.clock.set(sub.end_date - Duration::days(2));
    assert_eq!(app.manager.run_reminder_sweep().await.unwrap().sent, 0);
}

#[tokio::test]
async fn usage_warning_is_sent_once_per_step() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    app.paid_subscription(merchant, &app.plans.basic).await;
    let usage = app.manager.usage();
    usage
        .record_usage(merchant, UsageKind::Conversation, 850)
        .await
        .unwrap();
    usage.record_usage(merchant, UsageKind::Message, 100).await.unwrap();

    let first = app.manager.run_usage_alert_sweep().await.unwrap();
    assert_eq!(first.checked, 1);
    assert_eq!(first.sent, 1);

    let warnings: Vec<_> = app
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.template == NotificationTemplate::UsageWarning)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].merchant_id, merchant);
    assert_eq!(warnings[0].variables["kind"], "conversation");
    assert_eq!(warnings[0].variables["used"], "850");
    assert_eq!(warnings[0].variables["limit"], "1000");
    assert_eq!(warnings[0].variables["percentage"], "85.0");
    assert_eq!(warnings[0].variables["plan_name"], "basic");

    let repeat = app.manager.run_usage_alert_sweep().await.unwrap();
    assert_eq!(repeat.sent, 0);
    assert_eq!(repeat.skipped, 1);

    usage
        .record_usage(merchant, UsageKind::Conversation, 50)
        .await
        .unwrap();
    assert_eq!(app.manager.run_usage_alert_sweep().await.unwrap().sent, 1);

    app.advance(Duration::hours(25));
    assert_eq!(app.manager.run_usage_alert_sweep().await.unwrap().sent, 1);

    // Past the limit the merchant is blocked, not warned.
    usage
        .record_usage(merchant, UsageKind::Conversation, 100)
        .await
        .unwrap();
    app.advance(Duration::hours(25));
    assert_eq!(app.manager.run_usage_alert_sweep().await.unwrap().sent, 0);
    assert_eq!(app.notifier.count(NotificationTemplate::UsageWarning), 3);
}

#[tokio::test]
async fn usage_warnings_skip_trials_and_unlimited_quotas() {
    let app = TestApp::spawn().await;
    let usage = app.manager.usage();

    let trial = Uuid::new_v4();
    app.manager.start_trial(trial).await.unwrap();
    usage.record_usage(trial, UsageKind::Conversation, 90).await.unwrap();

    let unlimited = Uuid::new_v4();
    app.paid_subscription(unlimited, &app.plans.pro).await;
    usage
        .record_usage(unlimited, UsageKind::Conversation, 50_000)
        .await
        .unwrap();

    let free = Uuid::new_v4();
    app.manager
        .subscribe(free, app.plans.free.plan_id, BillingCycle::Monthly)
        .await
        .unwrap();
    usage.record_usage(free, UsageKind::VoiceMessage, 3).await.unwrap();

    let summary = app.manager.run_usage_alert_sweep().await.unwrap();
    assert_eq!(summary.checked, 2);
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.skipped, 2);
    assert_eq!(app.notifier.count(NotificationTemplate::UsageWarning), 0);
}

#[tokio::test]
async fn usage_warning_starts_over_in_a_new_period() {
    let app = TestApp::spawn().await;
    let merchant = Uuid::new_v4();
    let sub = app.paid_subscription(merchant, &app.plans.basic).await;
    app.manager
        .usage()
        .record_usage(merchant, UsageKind::Message, 8_500)
        .await
        .unwrap();
    assert_eq!(app.manager.run_usage_alert_sweep().await.unwrap().sent, 1);

    app.gateway.script(ChargeScript::Status(ChargeStatus::Captured));
    app.clock.set(sub.end_date + Duration::hours(1));
    app.manager.run_expiry_sweep().await.unwrap();
    app.manager
        .usage()
        .record_usage(merchant, UsageKind::Message, 8_100)
        .await
        .unwrap();

    assert_eq!(app.manager.run_usage_alert_sweep().await.unwrap().sent, 1);
    assert_eq!(app.notifier.count(NotificationTemplate::UsageWarning), 2);
}
