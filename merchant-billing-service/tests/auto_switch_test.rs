//! Subscription auto-switch integration tests.

mod common;

use chrono::{Duration, Utc};
use common::{SubscriptionSeed, TestApp};
use futures::future::join_all;
use reqwest::StatusCode;
use serde_json::Value;

#[tokio::test]
async fn suspended_deposit_with_balance_is_reactivated() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", false).await;
    app.seed_subscription(
        merchant,
        SubscriptionSeed {
            subscription_type: "DEPOSIT",
            status: "SUSPENDED",
            trial_ends_at: None,
            current_period_end: None,
        },
    )
    .await;
    app.seed_balance(merchant, 25000).await;

    let response = app.evaluate(merchant).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["action"], "REACTIVATED");
    assert_eq!(body["data"]["newStatus"], "ACTIVE");
    assert_eq!(body["data"]["storeOpened"], true);
    assert!(app.store_is_open(merchant).await);

    let history = app
        .count(
            "SELECT COUNT(*) FROM subscription_history WHERE merchant_id = $1 AND event_type = 'REACTIVATED' AND triggered_by = 'MERCHANT_REQUEST'",
            merchant,
        )
        .await;
    assert_eq!(history, 1);

    app.cleanup().await;
}

#[tokio::test]
async fn expired_trial_without_funds_is_suspended_and_kept_closed() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", true).await;
    app.seed_subscription(
        merchant,
        SubscriptionSeed {
            subscription_type: "TRIAL",
            status: "ACTIVE",
            trial_ends_at: Some(Utc::now() - Duration::days(10)),
            current_period_end: None,
        },
    )
    .await;

    let response = app.evaluate(merchant).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["action"], "SUSPENDED");
    assert_eq!(body["data"]["storeClosed"], true);
    assert!(!app.store_is_open(merchant).await);

    let suspended = app.db.get_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(suspended.status, "SUSPENDED");
    assert!(suspended.suspended_at.is_some());

    // Merchant reopens manually while still suspended.
    sqlx::query("UPDATE merchants SET is_open = TRUE, is_manual_override = TRUE WHERE id = $1")
        .bind(merchant)
        .execute(app.db.pool())
        .await
        .unwrap();

    let second: Value = app.evaluate(merchant).await.json().await.unwrap();
    assert_eq!(second["data"]["action"], "SUSPENDED");
    assert_eq!(second["data"]["storeClosed"], true);
    assert!(!app.store_is_open(merchant).await);

    let resuspended = app.db.get_subscription(merchant).await.unwrap().unwrap();
    assert_eq!(resuspended.suspended_at, suspended.suspended_at);

    let history = app
        .count(
            "SELECT COUNT(*) FROM subscription_history WHERE merchant_id = $1 AND event_type = 'SUSPENDED'",
            merchant,
        )
        .await;
    assert_eq!(history, 2);

    app.cleanup().await;
}

#[tokio::test]
async fn trial_within_grace_is_left_alone() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", true).await;
    app.seed_subscription(
        merchant,
        SubscriptionSeed {
            subscription_type: "TRIAL",
            status: "ACTIVE",
            trial_ends_at: Some(Utc::now() - Duration::days(1)),
            current_period_end: None,
        },
    )
    .await;

    let body: Value = app.evaluate(merchant).await.json().await.unwrap();
    assert_eq!(body["data"]["action"], "NO_CHANGE");
    assert_eq!(body["data"]["newType"], "TRIAL");
    assert!(app.store_is_open(merchant).await);

    app.cleanup().await;
}

#[tokio::test]
async fn exhausted_deposit_waits_for_nightly_suspension() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", true).await;
    app.seed_subscription(
        merchant,
        SubscriptionSeed {
            subscription_type: "DEPOSIT",
            status: "ACTIVE",
            trial_ends_at: None,
            current_period_end: None,
        },
    )
    .await;
    app.seed_balance(merchant, 0).await;

    let body: Value = app.evaluate(merchant).await.json().await.unwrap();
    assert_eq!(body["data"]["action"], "NO_CHANGE");
    assert!(body["data"]["reason"]
        .as_str()
        .unwrap()
        .contains("nightly"));
    assert!(app.store_is_open(merchant).await);

    app.cleanup().await;
}

#[tokio::test]
async fn missing_subscription_is_provisioned_as_trial() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", true).await;

    let body: Value = app.evaluate(merchant).await.json().await.unwrap();
    assert_eq!(body["data"]["action"], "AUTO_SWITCHED");
    assert_eq!(body["data"]["newType"], "TRIAL");
    assert!(body["data"]["previousType"].is_null());

    let overview: Value = app
        .merchant_request(
            reqwest::Method::GET,
            "/merchant/subscription",
            merchant,
            "MERCHANT_STAFF",
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(overview["data"]["subscription"]["type"], "TRIAL");
    assert_eq!(overview["data"]["isSuspended"], false);

    let history: Value = app
        .merchant_request(
            reqwest::Method::GET,
            "/merchant/subscription/history?limit=5",
            merchant,
            "MERCHANT_STAFF",
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["data"]["total"], 1);
    assert_eq!(history["data"]["limit"], 5);

    app.cleanup().await;
}

#[tokio::test]
async fn staff_cannot_trigger_evaluation() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let merchant = app.seed_merchant("IDR", true).await;

    let response = app
        .merchant_request(
            reqwest::Method::POST,
            "/merchant/subscription/evaluate",
            merchant,
            "MERCHANT_STAFF",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let rows = app
        .count(
            "SELECT COUNT(*) FROM merchant_subscriptions WHERE merchant_id = $1",
            merchant,
        )
        .await;
    assert_eq!(rows, 0);

    app.cleanup().await;
}

#[tokio::test]
async fn plan_row_terms_apply_under_concurrent_evaluations() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    app.seed_plan("EUR", 14, 20).await;

    let graced = app.seed_merchant("EUR", true).await;
    app.seed_subscription(
        graced,
        SubscriptionSeed {
            subscription_type: "TRIAL",
            status: "ACTIVE",
            trial_ends_at: Some(Utc::now() - Duration::days(10)),
            current_period_end: None,
        },
    )
    .await;
    let body: Value = app.evaluate(graced).await.json().await.unwrap();
    assert_eq!(body["data"]["action"], "NO_CHANGE");

    // More evaluations in flight than the service pool has connections.
    let mut merchants = Vec::new();
    for _ in 0..30 {
        merchants.push(app.seed_merchant("EUR", true).await);
    }
    let started = Utc::now();
    let responses = join_all(merchants.iter().map(|m| app.evaluate(*m))).await;
    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
    }

    for merchant in merchants {
        let trial = app.db.get_subscription(merchant).await.unwrap().unwrap();
        let ends = trial.trial_ends_at.unwrap();
        assert!(ends >= started + Duration::days(14) - Duration::seconds(1));
        assert!(ends < started + Duration::days(15));
    }

    app.cleanup().await;
}
