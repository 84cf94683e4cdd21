//! Test helper module for merchant-billing-service integration tests.
//!
//! Each `TestApp` runs against its own PostgreSQL schema. Tests are skipped when
//! `TEST_DATABASE_URL` is not set.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use merchant_billing_service::config::{
    BillingConfig, DatabaseConfig, DiscountServiceConfig, PlanDefaultsConfig,
};
use merchant_billing_service::services::{init_metrics, Database};
use merchant_billing_service::startup::Application;
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

// Counter for unique schema names
static SCHEMA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Database URL for testing, if configured.
pub fn get_test_database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .ok()
        .filter(|url| !url.is_empty())
}

/// Generate a unique schema name for test isolation.
fn unique_schema_name() -> String {
    let counter = SCHEMA_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("test_merchant_billing_{}_{}", std::process::id(), counter)
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub db: Database,
    pub client: reqwest::Client,
    base_url: String,
    schema_name: String,
}

/// Voucher row to seed. Defaults to an active, unrestricted IDR balance voucher.
pub struct VoucherSeed {
    pub code: String,
    pub voucher_type: &'static str,
    pub value: Decimal,
    pub currency: Option<&'static str>,
    pub max_usage: Option<i32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl VoucherSeed {
    pub fn balance(code: &str, value: i64) -> Self {
        Self {
            code: code.to_string(),
            voucher_type: "BALANCE",
            value: Decimal::from(value),
            currency: Some("IDR"),
            max_usage: None,
            valid_from: None,
            valid_until: None,
            is_active: true,
        }
    }

    pub fn days(code: &str, days: i64) -> Self {
        Self {
            voucher_type: "SUBSCRIPTION_DAYS",
            currency: None,
            ..Self::balance(code, days)
        }
    }
}

/// Subscription row to seed.
pub struct SubscriptionSeed {
    pub subscription_type: &'static str,
    pub status: &'static str,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

impl TestApp {
    /// Spawn with the discount service pointed at an unused port.
    pub async fn spawn() -> Option<Self> {
        Self::spawn_with_discount_url("http://127.0.0.1:9").await
    }

    /// Spawn a new test application on a random port. Returns `None` (and the
    /// test should return early) when no test database is configured.
    pub async fn spawn_with_discount_url(discount_url: &str) -> Option<Self> {
        let Some(base_url) = get_test_database_url() else {
            eprintln!("TEST_DATABASE_URL not set; skipping integration test");
            return None;
        };

        // Initialize metrics (required for metrics endpoint test)
        init_metrics();

        let schema_name = unique_schema_name();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&base_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name))
            .execute(&pool)
            .await
            .ok();
        sqlx::query(&format!("CREATE SCHEMA {}", schema_name))
            .execute(&pool)
            .await
            .expect("Failed to create test schema");

        pool.close().await;

        // Use ? or & depending on whether URL already has query parameters
        let separator = if base_url.contains('?') { "&" } else { "?" };
        let db_url_with_schema = format!(
            "{}{}options=-c search_path%3D{}",
            base_url, separator, schema_name
        );

        let config = BillingConfig {
            common: CoreConfig { port: 0 }, // Random port
            service_name: "merchant-billing-service-test".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: db_url_with_schema.clone(),
                max_connections: 20,
                min_connections: 1,
            },
            plan_defaults: PlanDefaultsConfig::default(),
            discount_service: DiscountServiceConfig {
                url: discount_url.to_string(),
                timeout_secs: 2,
            },
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");

        let port = app.http_port();
        let db = Database::new(&db_url_with_schema, 5, 1)
            .await
            .expect("Failed to create test database");

        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for HTTP server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        Some(TestApp {
            address,
            port,
            db,
            client,
            base_url,
            schema_name,
        })
    }

    /// Insert a merchant and return its id.
    pub async fn seed_merchant(&self, currency: &str, is_open: bool) -> Uuid {
        let id = Uuid::new_v4();
        let code = format!("M{}", &id.simple().to_string()[..10]);
        sqlx::query(
            r#"
            INSERT INTO merchants (id, code, name, currency, is_open, is_manual_override)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&code)
        .bind(format!("Merchant {}", code))
        .bind(currency)
        .bind(is_open)
        .bind(!is_open)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed merchant");
        id
    }

    pub async fn merchant_code(&self, merchant_id: Uuid) -> String {
        sqlx::query_scalar::<_, String>("SELECT code FROM merchants WHERE id = $1")
            .bind(merchant_id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to read merchant code")
    }

    pub async fn seed_voucher(&self, seed: VoucherSeed) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO vouchers (id, code, voucher_type, value, currency, max_usage, valid_from, valid_until, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&seed.code)
        .bind(seed.voucher_type)
        .bind(seed.value)
        .bind(seed.currency)
        .bind(seed.max_usage)
        .bind(seed.valid_from)
        .bind(seed.valid_until)
        .bind(seed.is_active)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed voucher");
        id
    }

    pub async fn seed_subscription(&self, merchant_id: Uuid, seed: SubscriptionSeed) {
        let suspended_at = (seed.status == "SUSPENDED").then(Utc::now);
        sqlx::query(
            r#"
            INSERT INTO merchant_subscriptions (
                id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                current_period_start, current_period_end, suspended_at, suspend_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(merchant_id)
        .bind(seed.subscription_type)
        .bind(seed.status)
        .bind(seed.trial_ends_at.map(|end| end - chrono::Duration::days(30)))
        .bind(seed.trial_ends_at)
        .bind(seed.current_period_end.map(|end| end - chrono::Duration::days(30)))
        .bind(seed.current_period_end)
        .bind(suspended_at)
        .bind(suspended_at.map(|_| "seeded"))
        .execute(self.db.pool())
        .await
        .expect("Failed to seed subscription");
    }

    /// Insert an active plan row for `currency`.
    pub async fn seed_plan(&self, currency: &str, trial_days: i32, grace_period_days: i32) {
        sqlx::query(
            r#"
            INSERT INTO subscription_plans (id, name, currency, trial_days, grace_period_days)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(format!("{} plan", currency))
        .bind(currency)
        .bind(trial_days)
        .bind(grace_period_days)
        .execute(self.db.pool())
        .await
        .expect("Failed to seed plan");
    }

    pub async fn seed_balance(&self, merchant_id: Uuid, balance: i64) {
        sqlx::query("INSERT INTO merchant_balances (merchant_id, balance) VALUES ($1, $2)")
            .bind(merchant_id)
            .bind(Decimal::from(balance))
            .execute(self.db.pool())
            .await
            .expect("Failed to seed balance");
    }

    pub async fn store_is_open(&self, merchant_id: Uuid) -> bool {
        sqlx::query_scalar::<_, bool>("SELECT is_open FROM merchants WHERE id = $1")
            .bind(merchant_id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to read store flag")
    }

    pub async fn count(&self, sql: &str, merchant_id: Uuid) -> i64 {
        sqlx::query_scalar::<_, i64>(sql)
            .bind(merchant_id)
            .fetch_one(self.db.pool())
            .await
            .expect("Failed to count rows")
    }

    /// Request builder carrying merchant headers.
    pub fn merchant_request(
        &self,
        method: reqwest::Method,
        path: &str,
        merchant_id: Uuid,
        role: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.address, path))
            .header("X-Merchant-ID", merchant_id.to_string())
            .header("X-User-ID", Uuid::new_v4().to_string())
            .header("X-User-Role", role)
    }

    /// Redeem `code` as the merchant owner.
    pub async fn redeem(&self, merchant_id: Uuid, code: &str) -> reqwest::Response {
        self.merchant_request(
            reqwest::Method::POST,
            "/merchant/vouchers/redeem",
            merchant_id,
            "MERCHANT_OWNER",
        )
        .json(&serde_json::json!({ "code": code }))
        .send()
        .await
        .expect("Failed to execute request")
    }

    /// Evaluate the subscription as the merchant owner.
    pub async fn evaluate(&self, merchant_id: Uuid) -> reqwest::Response {
        self.merchant_request(
            reqwest::Method::POST,
            "/merchant/subscription/evaluate",
            merchant_id,
            "MERCHANT_OWNER",
        )
        .send()
        .await
        .expect("Failed to execute request")
    }

    /// Cleanup test resources (schema).
    pub async fn cleanup(&self) {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.base_url)
            .await
            .ok();

        if let Some(pool) = pool {
            let _ = sqlx::query(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                self.schema_name
            ))
            .execute(&pool)
            .await;
            pool.close().await;
        }
    }
}
