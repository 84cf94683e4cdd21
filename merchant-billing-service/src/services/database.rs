//! Database service for merchant-billing-service.
//!
//! Pool-level reads and best-effort writes are methods on [`Database`]. Steps that
//! must run inside a caller-owned transaction are associated functions taking a
//! `&mut PgConnection` (pass `&mut *tx`).

use crate::models::{
    BalanceTransaction, BalanceTransactionType, MerchantAccount, MerchantBalance,
    MerchantSubscription, NewHistoryEntry, NewRedemption, PlanTerms, SubscriptionHistory,
    SubscriptionType, Voucher, VoucherRedemption,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "merchant-billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Start a READ COMMITTED transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })
    }

    // =========================================================================
    // Merchant & Plan Reads
    // =========================================================================

    /// Look up a merchant by its public code.
    #[instrument(skip(self))]
    pub async fn get_merchant_by_code(
        &self,
        code: &str,
    ) -> Result<Option<MerchantAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_merchant_by_code"])
            .start_timer();

        let merchant = sqlx::query_as::<_, MerchantAccount>(
            r#"
            SELECT id, currency, is_open, is_manual_override, is_active
            FROM merchants
            WHERE UPPER(code) = UPPER($1)
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get merchant: {}", e)))?;

        timer.observe_duration();
        Ok(merchant)
    }

    // =========================================================================
    // Store Visibility
    // =========================================================================

    /// Open a closed store and clear its manual override. Returns whether a row changed.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn reopen_store(&self, merchant_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reopen_store"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE merchants
            SET is_open = TRUE, is_manual_override = FALSE, updated_at = NOW()
            WHERE id = $1 AND is_open = FALSE
            "#,
        )
        .bind(merchant_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to reopen store: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    /// Close an open store and clear its manual override. Returns whether a row changed.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn close_store(&self, merchant_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["close_store"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE merchants
            SET is_open = FALSE, is_manual_override = FALSE, updated_at = NOW()
            WHERE id = $1 AND is_open = TRUE
            "#,
        )
        .bind(merchant_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to close store: {}", e)))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // History & Redemption Follow-ups
    // =========================================================================

    /// Append a subscription history row.
    #[instrument(skip(self, entry), fields(merchant_id = %entry.merchant_id, event_type = entry.event_type.as_str()))]
    pub async fn insert_history(
        &self,
        entry: &NewHistoryEntry,
    ) -> Result<SubscriptionHistory, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_history"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            INSERT INTO subscription_history (
                id, merchant_id, event_type, previous_type, new_type, previous_status, new_status,
                previous_balance, new_balance, previous_period_end, new_period_end, reason, metadata, triggered_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id, merchant_id, event_type, previous_type, new_type, previous_status, new_status,
                      previous_balance, new_balance, previous_period_end, new_period_end, reason, metadata,
                      triggered_by, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.merchant_id)
        .bind(entry.event_type.as_str())
        .bind(entry.previous_type.map(|t| t.as_str()))
        .bind(entry.new_type.map(|t| t.as_str()))
        .bind(entry.previous_status.map(|s| s.as_str()))
        .bind(entry.new_status.map(|s| s.as_str()))
        .bind(entry.previous_balance)
        .bind(entry.new_balance)
        .bind(entry.previous_period_end)
        .bind(entry.new_period_end)
        .bind(&entry.reason)
        .bind(&entry.metadata)
        .bind(&entry.triggered_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to insert history: {}", e)))?;

        timer.observe_duration();
        Ok(row)
    }

    /// Record the auto-switch that followed a committed redemption.
    #[instrument(skip(self), fields(redemption_id = %redemption_id))]
    pub async fn mark_redemption_auto_switch(
        &self,
        redemption_id: Uuid,
        previous_sub_type: Option<SubscriptionType>,
        new_sub_type: Option<SubscriptionType>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_redemption_auto_switch"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE voucher_redemptions
            SET auto_switch_triggered = TRUE, previous_sub_type = $2, new_sub_type = $3
            WHERE id = $1
            "#,
        )
        .bind(redemption_id)
        .bind(previous_sub_type.map(|t| t.as_str()))
        .bind(new_sub_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update redemption: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Merchant-facing Reads
    // =========================================================================

    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn get_balance(&self, merchant_id: Uuid) -> Result<Option<MerchantBalance>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_balance"])
            .start_timer();

        let balance = sqlx::query_as::<_, MerchantBalance>(
            r#"
            SELECT merchant_id, balance, last_topup_at, created_at, updated_at
            FROM merchant_balances
            WHERE merchant_id = $1
            "#,
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get balance: {}", e)))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn get_subscription(
        &self,
        merchant_id: Uuid,
    ) -> Result<Option<MerchantSubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, MerchantSubscription>(
            r#"
            SELECT id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                   current_period_start, current_period_end, suspended_at, suspend_reason,
                   created_at, updated_at
            FROM merchant_subscriptions
            WHERE merchant_id = $1
            "#,
        )
        .bind(merchant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e))
        })?;

        timer.observe_duration();
        Ok(subscription)
    }

    /// Ledger entries, newest first, with the total count.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn list_balance_transactions(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<BalanceTransaction>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_balance_transactions"])
            .start_timer();

        let rows = sqlx::query_as::<_, BalanceTransaction>(
            r#"
            SELECT id, merchant_id, transaction_type, amount, balance_before, balance_after,
                   description, created_by, created_at
            FROM balance_transactions
            WHERE merchant_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(merchant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list transactions: {}", e))
        })?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM balance_transactions WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to count transactions: {}", e))
        })?;

        timer.observe_duration();
        Ok((rows, total))
    }

    /// Subscription history, newest first, with the total count.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn list_subscription_history(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<SubscriptionHistory>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscription_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionHistory>(
            r#"
            SELECT id, merchant_id, event_type, previous_type, new_type, previous_status, new_status,
                   previous_balance, new_balance, previous_period_end, new_period_end, reason, metadata,
                   triggered_by, created_at
            FROM subscription_history
            WHERE merchant_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(merchant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list history: {}", e)))?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscription_history WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count history: {}", e)))?;

        timer.observe_duration();
        Ok((rows, total))
    }

    /// Redemptions made by a merchant, newest first, with the total count.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn list_redemptions(
        &self,
        merchant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<VoucherRedemption>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_redemptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, VoucherRedemption>(
            r#"
            SELECT id, voucher_id, merchant_id, voucher_code, voucher_type, value_applied, currency,
                   balance_before, balance_after, subscription_end_before, subscription_end_after,
                   auto_switch_triggered, previous_sub_type, new_sub_type, redeemed_by, redeemed_at
            FROM voucher_redemptions
            WHERE merchant_id = $1
            ORDER BY redeemed_at DESC, id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(merchant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list redemptions: {}", e))
        })?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM voucher_redemptions WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to count redemptions: {}", e))
        })?;

        timer.observe_duration();
        Ok((rows, total))
    }

    // =========================================================================
    // Transaction-scoped Operations
    // =========================================================================

    /// Block until the transaction-scoped advisory lock for `key` is held.
    /// Released automatically on commit or rollback.
    pub async fn acquire_advisory_lock(conn: &mut PgConnection, key: i64) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["acquire_advisory_lock"])
            .start_timer();

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key)
            .execute(conn)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to acquire advisory lock: {}", e))
            })?;

        timer.observe_duration();
        Ok(())
    }

    pub async fn find_merchant(
        conn: &mut PgConnection,
        merchant_id: Uuid,
    ) -> Result<Option<MerchantAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_merchant"])
            .start_timer();

        let merchant = sqlx::query_as::<_, MerchantAccount>(
            r#"
            SELECT id, currency, is_open, is_manual_override, is_active
            FROM merchants
            WHERE id = $1
            "#,
        )
        .bind(merchant_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get merchant: {}", e)))?;

        timer.observe_duration();
        Ok(merchant)
    }

    /// Trial and grace lengths of the newest active plan for a currency.
    pub async fn get_plan_terms(
        conn: &mut PgConnection,
        currency: &str,
    ) -> Result<Option<PlanTerms>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan_terms"])
            .start_timer();

        let row = sqlx::query_as::<_, (i32, i32)>(
            r#"
            SELECT trial_days, grace_period_days
            FROM subscription_plans
            WHERE UPPER(currency) = UPPER($1) AND is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(currency)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan terms: {}", e)))?;

        timer.observe_duration();
        Ok(row.map(|(trial_days, grace_period_days)| PlanTerms {
            trial_days: i64::from(trial_days),
            grace_period_days: i64::from(grace_period_days),
        }))
    }

    /// Load a voucher by normalized code under an exclusive row lock.
    pub async fn lock_voucher_by_code(
        conn: &mut PgConnection,
        normalized_code: &str,
    ) -> Result<Option<Voucher>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_voucher_by_code"])
            .start_timer();

        let voucher = sqlx::query_as::<_, Voucher>(
            r#"
            SELECT id, code, voucher_type, value, currency, max_usage, current_usage,
                   valid_from, valid_until, is_active, description, created_at, updated_at
            FROM vouchers
            WHERE UPPER(code) = $1
            FOR UPDATE
            "#,
        )
        .bind(normalized_code)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock voucher: {}", e)))?;

        timer.observe_duration();
        Ok(voucher)
    }

    pub async fn redemption_exists(
        conn: &mut PgConnection,
        voucher_id: Uuid,
        merchant_id: Uuid,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["redemption_exists"])
            .start_timer();

        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM voucher_redemptions WHERE voucher_id = $1 AND merchant_id = $2
            )
            "#,
        )
        .bind(voucher_id)
        .bind(merchant_id)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to check redemption: {}", e))
        })?;

        timer.observe_duration();
        Ok(exists)
    }

    /// Load the merchant's balance row under an exclusive lock, creating it at zero first.
    pub async fn lock_or_create_balance(
        conn: &mut PgConnection,
        merchant_id: Uuid,
    ) -> Result<MerchantBalance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_or_create_balance"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO merchant_balances (merchant_id, balance)
            VALUES ($1, 0)
            ON CONFLICT (merchant_id) DO NOTHING
            "#,
        )
        .bind(merchant_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create balance: {}", e)))?;

        let balance = sqlx::query_as::<_, MerchantBalance>(
            r#"
            SELECT merchant_id, balance, last_topup_at, created_at, updated_at
            FROM merchant_balances
            WHERE merchant_id = $1
            FOR UPDATE
            "#,
        )
        .bind(merchant_id)
        .fetch_one(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock balance: {}", e)))?;

        timer.observe_duration();
        Ok(balance)
    }

    /// Current balance, zero when the merchant has never been credited.
    pub async fn current_balance(
        conn: &mut PgConnection,
        merchant_id: Uuid,
    ) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["current_balance"])
            .start_timer();

        let balance = sqlx::query_scalar::<_, Decimal>(
            "SELECT balance FROM merchant_balances WHERE merchant_id = $1",
        )
        .bind(merchant_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to read balance: {}", e)))?;

        timer.observe_duration();
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    pub async fn set_balance(
        conn: &mut PgConnection,
        merchant_id: Uuid,
        new_balance: Decimal,
        topped_up_at: DateTime<Utc>,
    ) -> Result<MerchantBalance, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_balance"])
            .start_timer();

        let balance = sqlx::query_as::<_, MerchantBalance>(
            r#"
            UPDATE merchant_balances
            SET balance = $2, last_topup_at = $3, updated_at = NOW()
            WHERE merchant_id = $1
            RETURNING merchant_id, balance, last_topup_at, created_at, updated_at
            "#,
        )
        .bind(merchant_id)
        .bind(new_balance)
        .bind(topped_up_at)
        .fetch_one(conn)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update balance: {}", e)))?;

        timer.observe_duration();
        Ok(balance)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_balance_transaction(
        conn: &mut PgConnection,
        merchant_id: Uuid,
        transaction_type: BalanceTransactionType,
        amount: Decimal,
        balance_before: Decimal,
        balance_after: Decimal,
        description: &str,
        created_by: Uuid,
    ) -> Result<BalanceTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_balance_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, BalanceTransaction>(
            r#"
            INSERT INTO balance_transactions (
                id, merchant_id, transaction_type, amount, balance_before, balance_after, description, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, merchant_id, transaction_type, amount, balance_before, balance_after,
                      description, created_by, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(merchant_id)
        .bind(transaction_type.as_str())
        .bind(amount)
        .bind(balance_before)
        .bind(balance_after)
        .bind(description)
        .bind(created_by)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert balance transaction: {}", e))
        })?;

        timer.observe_duration();
        Ok(row)
    }

    /// Load the merchant's subscription under an exclusive row lock.
    pub async fn lock_subscription(
        conn: &mut PgConnection,
        merchant_id: Uuid,
    ) -> Result<Option<MerchantSubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, MerchantSubscription>(
            r#"
            SELECT id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                   current_period_start, current_period_end, suspended_at, suspend_reason,
                   created_at, updated_at
            FROM merchant_subscriptions
            WHERE merchant_id = $1
            FOR UPDATE
            "#,
        )
        .bind(merchant_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to lock subscription: {}", e))
        })?;

        timer.observe_duration();
        Ok(subscription)
    }

    /// Insert a subscription row and return it locked. Returns `None` when a
    /// concurrent writer provisioned the merchant first.
    pub async fn insert_subscription(
        conn: &mut PgConnection,
        subscription: &MerchantSubscription,
    ) -> Result<Option<MerchantSubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_subscription"])
            .start_timer();

        let inserted = sqlx::query_as::<_, MerchantSubscription>(
            r#"
            INSERT INTO merchant_subscriptions (
                id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                current_period_start, current_period_end, suspended_at, suspend_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (merchant_id) DO NOTHING
            RETURNING id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                      current_period_start, current_period_end, suspended_at, suspend_reason,
                      created_at, updated_at
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.merchant_id)
        .bind(&subscription.subscription_type)
        .bind(&subscription.status)
        .bind(subscription.trial_started_at)
        .bind(subscription.trial_ends_at)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.suspended_at)
        .bind(&subscription.suspend_reason)
        .fetch_optional(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert subscription: {}", e))
        })?;

        timer.observe_duration();
        Ok(inserted)
    }

    /// Persist every mutable field of a locked subscription row.
    pub async fn update_subscription(
        conn: &mut PgConnection,
        subscription: &MerchantSubscription,
    ) -> Result<MerchantSubscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let updated = sqlx::query_as::<_, MerchantSubscription>(
            r#"
            UPDATE merchant_subscriptions
            SET subscription_type = $2, status = $3, trial_started_at = $4, trial_ends_at = $5,
                current_period_start = $6, current_period_end = $7, suspended_at = $8,
                suspend_reason = $9, updated_at = NOW()
            WHERE id = $1
            RETURNING id, merchant_id, subscription_type, status, trial_started_at, trial_ends_at,
                      current_period_start, current_period_end, suspended_at, suspend_reason,
                      created_at, updated_at
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.subscription_type)
        .bind(&subscription.status)
        .bind(subscription.trial_started_at)
        .bind(subscription.trial_ends_at)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.suspended_at)
        .bind(&subscription.suspend_reason)
        .fetch_one(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update subscription: {}", e))
        })?;

        timer.observe_duration();
        Ok(updated)
    }

    /// Insert a redemption row. A duplicate (voucher, merchant) pair surfaces as
    /// [`AppError::Conflict`].
    pub async fn insert_redemption(
        conn: &mut PgConnection,
        input: &NewRedemption,
    ) -> Result<VoucherRedemption, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_redemption"])
            .start_timer();

        let result = sqlx::query_as::<_, VoucherRedemption>(
            r#"
            INSERT INTO voucher_redemptions (
                id, voucher_id, merchant_id, voucher_code, voucher_type, value_applied, currency,
                balance_before, balance_after, subscription_end_before, subscription_end_after,
                auto_switch_triggered, previous_sub_type, new_sub_type, redeemed_by, redeemed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING id, voucher_id, merchant_id, voucher_code, voucher_type, value_applied, currency,
                      balance_before, balance_after, subscription_end_before, subscription_end_after,
                      auto_switch_triggered, previous_sub_type, new_sub_type, redeemed_by, redeemed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.voucher_id)
        .bind(input.merchant_id)
        .bind(&input.voucher_code)
        .bind(input.voucher_type.as_str())
        .bind(input.value_applied)
        .bind(&input.currency)
        .bind(input.balance_before)
        .bind(input.balance_after)
        .bind(input.subscription_end_before)
        .bind(input.subscription_end_after)
        .bind(input.auto_switch_triggered)
        .bind(&input.previous_sub_type)
        .bind(&input.new_sub_type)
        .bind(input.redeemed_by)
        .bind(input.redeemed_at)
        .fetch_one(conn)
        .await;

        let redemption = match result {
            Ok(row) => row,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Voucher {} already redeemed by merchant {}",
                    input.voucher_code,
                    input.merchant_id
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert redemption: {}",
                    e
                )));
            }
        };

        timer.observe_duration();
        Ok(redemption)
    }

    pub async fn increment_voucher_usage(
        conn: &mut PgConnection,
        voucher_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["increment_voucher_usage"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE vouchers
            SET current_usage = current_usage + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(voucher_id)
        .execute(conn)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to increment voucher usage: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }
}
