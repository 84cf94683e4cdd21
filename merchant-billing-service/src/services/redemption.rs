//! Voucher redemption protocol.
//!
//! One redemption is one transaction: a per-code advisory lock, row locks on the
//! voucher and on the balance or subscription row being changed, the redemption
//! insert and the usage increment all commit together or not at all. The
//! auto-switch evaluation that follows a balance credit runs afterwards in its
//! own transaction and never fails the redemption.

use crate::error::BillingError;
use crate::models::{
    add_days, BalanceTransactionType, MerchantSubscription, NewRedemption, SubscriptionStatus,
    SubscriptionType, Voucher, VoucherType,
};
use crate::services::auto_switch::{AutoSwitchEngine, TRIGGER_VOUCHER};
use crate::services::database::Database;
use crate::services::metrics::{record_error, record_redemption};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnection;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Trim and uppercase a user-supplied code.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Advisory lock key for a normalized code: the first 8 bytes of its SHA-256,
/// big-endian.
pub fn advisory_lock_key(normalized_code: &str) -> i64 {
    let digest = Sha256::digest(normalized_code.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Voucher eligibility checks, in order, stopping at the first failure.
/// The once-per-merchant check needs the database and runs separately.
pub fn check_voucher_rules(
    voucher: &Voucher,
    merchant_currency: &str,
    now: DateTime<Utc>,
) -> Result<(), BillingError> {
    if !voucher.is_active {
        return Err(BillingError::VoucherInactive);
    }
    if let Some(currency) = voucher.currency.as_deref() {
        if !currency.eq_ignore_ascii_case(merchant_currency) {
            return Err(BillingError::CurrencyMismatch {
                voucher: currency.to_uppercase(),
                merchant: merchant_currency.to_uppercase(),
            });
        }
    }
    if voucher.valid_from.is_some_and(|from| now < from) {
        return Err(BillingError::VoucherNotStarted);
    }
    if voucher.valid_until.is_some_and(|until| now > until) {
        return Err(BillingError::VoucherExpired);
    }
    if voucher.is_exhausted() {
        return Err(BillingError::VoucherLimitReached);
    }
    Ok(())
}

/// Whole days granted by a SUBSCRIPTION_DAYS voucher.
pub fn days_to_add(value: Decimal) -> Result<i64, BillingError> {
    let days = value.floor().to_i64().unwrap_or(0);
    if days <= 0 {
        return Err(BillingError::VoucherInvalid(
            "Voucher does not grant any subscription days".to_string(),
        ));
    }
    Ok(days)
}

/// Next subscription row after adding `days`. Days are counted from the
/// current period end while it is still in the future, otherwise from `now`.
/// A missing row is seeded as MONTHLY/ACTIVE; a TRIAL becomes MONTHLY.
pub fn extend_subscription(
    current: Option<&MerchantSubscription>,
    merchant_id: Uuid,
    days: i64,
    now: DateTime<Utc>,
) -> Result<MerchantSubscription, BillingError> {
    let mut next = match current {
        Some(sub) => sub.clone(),
        None => MerchantSubscription {
            id: Uuid::new_v4(),
            merchant_id,
            subscription_type: SubscriptionType::Monthly.as_str().to_string(),
            status: SubscriptionStatus::Active.as_str().to_string(),
            trial_started_at: None,
            trial_ends_at: None,
            current_period_start: None,
            current_period_end: None,
            suspended_at: None,
            suspend_reason: None,
            created_at: now,
            updated_at: now,
        },
    };

    let running_end = next.current_period_end.filter(|end| *end > now);
    let new_end = add_days(running_end.unwrap_or(now), days).ok_or_else(|| {
        BillingError::VoucherInvalid("Voucher grants more days than can be applied".to_string())
    })?;
    next.current_period_start = match running_end {
        Some(_) => next.current_period_start.or(Some(now)),
        None => Some(now),
    };
    next.current_period_end = Some(new_end);

    if next.parsed_type() == SubscriptionType::Trial {
        next.subscription_type = SubscriptionType::Monthly.as_str().to_string();
    }
    next.status = SubscriptionStatus::Active.as_str().to_string();
    next.suspended_at = None;
    next.suspend_reason = None;
    Ok(next)
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionResult {
    pub redemption_id: Uuid,
    pub voucher_type: VoucherType,
    pub value_applied: Decimal,
    pub auto_switch_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_sub_type: Option<SubscriptionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_sub_type: Option<SubscriptionType>,
    pub subscription: Option<MerchantSubscription>,
    pub balance: Decimal,
}

/// Subscription change made inside the redemption transaction.
struct DaysApplied {
    end_before: Option<DateTime<Utc>>,
    end_after: Option<DateTime<Utc>>,
    previous_type: Option<SubscriptionType>,
    new_type: SubscriptionType,
}

impl DaysApplied {
    fn switched(&self) -> bool {
        self.previous_type != Some(self.new_type)
    }
}

#[derive(Clone)]
pub struct VoucherRedemptionService {
    db: Arc<Database>,
    engine: AutoSwitchEngine,
}

impl VoucherRedemptionService {
    pub fn new(db: Arc<Database>, engine: AutoSwitchEngine) -> Self {
        Self { db, engine }
    }

    /// Redeem `raw_code` for a merchant on behalf of `actor_user_id`.
    #[instrument(skip(self, raw_code), fields(merchant_id = %merchant_id, voucher_code = tracing::field::Empty))]
    pub async fn redeem(
        &self,
        merchant_id: Uuid,
        actor_user_id: Uuid,
        raw_code: &str,
    ) -> Result<RedemptionResult, BillingError> {
        let code = normalize_code(raw_code);
        tracing::Span::current().record("voucher_code", code.as_str());
        if code.is_empty() {
            record_redemption("UNKNOWN", "VALIDATION_ERROR");
            return Err(BillingError::Validation("Voucher code is required".to_string()));
        }

        let mut voucher_type = None;
        let outcome = self
            .redeem_in_transaction(merchant_id, actor_user_id, &code, &mut voucher_type)
            .await;
        let type_label = voucher_type.map(|t: VoucherType| t.as_str()).unwrap_or("UNKNOWN");

        let mut result = match outcome {
            Ok(result) => {
                record_redemption(type_label, "SUCCESS");
                result
            }
            Err(e) => {
                record_redemption(type_label, e.code());
                if e.is_rejection() {
                    info!(code = e.code(), "Voucher redemption rejected");
                } else {
                    record_error("redemption", "redeem");
                    error!(error = %e, "Voucher redemption failed");
                }
                return Err(e);
            }
        };

        if result.voucher_type == VoucherType::Balance {
            self.auto_switch_after_credit(merchant_id, &mut result).await;
        }

        match self.db.get_subscription(merchant_id).await {
            Ok(subscription) => result.subscription = subscription,
            Err(e) => warn!(error = %e, "Failed to reload subscription after redemption"),
        }

        info!(
            redemption_id = %result.redemption_id,
            voucher_type = result.voucher_type.as_str(),
            value_applied = %result.value_applied,
            auto_switch_triggered = result.auto_switch_triggered,
            "Voucher redeemed"
        );
        Ok(result)
    }

    async fn redeem_in_transaction(
        &self,
        merchant_id: Uuid,
        actor_user_id: Uuid,
        code: &str,
        voucher_type_seen: &mut Option<VoucherType>,
    ) -> Result<RedemptionResult, BillingError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        Database::acquire_advisory_lock(&mut *tx, advisory_lock_key(code)).await?;

        let merchant = Database::find_merchant(&mut *tx, merchant_id)
            .await?
            .ok_or(BillingError::MerchantNotFound)?;

        let voucher = Database::lock_voucher_by_code(&mut *tx, code)
            .await?
            .ok_or(BillingError::VoucherNotFound)?;
        *voucher_type_seen = voucher.parsed_type();

        check_voucher_rules(&voucher, &merchant.currency, now)?;

        if Database::redemption_exists(&mut *tx, voucher.id, merchant_id).await? {
            return Err(BillingError::AlreadyRedeemed);
        }

        let voucher_type = voucher.parsed_type().ok_or_else(|| {
            BillingError::VoucherInvalid(format!(
                "Unsupported voucher type {}",
                voucher.voucher_type
            ))
        })?;

        let mut redemption = NewRedemption {
            voucher_id: voucher.id,
            merchant_id,
            voucher_code: code.to_string(),
            voucher_type,
            value_applied: voucher.value,
            currency: voucher.currency.clone(),
            balance_before: None,
            balance_after: None,
            subscription_end_before: None,
            subscription_end_after: None,
            auto_switch_triggered: false,
            previous_sub_type: None,
            new_sub_type: None,
            redeemed_by: actor_user_id,
            redeemed_at: now,
        };

        let balance = match voucher_type {
            VoucherType::Balance => {
                if voucher.value <= Decimal::ZERO {
                    return Err(BillingError::VoucherInvalid(
                        "Voucher does not carry a positive amount".to_string(),
                    ));
                }
                let locked = Database::lock_or_create_balance(&mut *tx, merchant_id).await?;
                let before = locked.balance;
                let after = before + voucher.value;
                Database::set_balance(&mut *tx, merchant_id, after, now).await?;
                Database::insert_balance_transaction(
                    &mut *tx,
                    merchant_id,
                    BalanceTransactionType::Deposit,
                    voucher.value,
                    before,
                    after,
                    &format!("Voucher {}", code),
                    actor_user_id,
                )
                .await?;
                redemption.balance_before = Some(before);
                redemption.balance_after = Some(after);
                after
            }
            VoucherType::SubscriptionDays => {
                let days = days_to_add(voucher.value)?;
                let applied = apply_subscription_days(&mut *tx, merchant_id, days, now).await?;
                redemption.subscription_end_before = applied.end_before;
                redemption.subscription_end_after = applied.end_after;
                if applied.switched() {
                    redemption.auto_switch_triggered = true;
                    redemption.previous_sub_type =
                        applied.previous_type.map(|t| t.as_str().to_string());
                    redemption.new_sub_type = Some(applied.new_type.as_str().to_string());
                }
                Database::current_balance(&mut *tx, merchant_id).await?
            }
        };

        let inserted = Database::insert_redemption(&mut *tx, &redemption)
            .await
            .map_err(|e| match e {
                AppError::Conflict(_) => BillingError::AlreadyRedeemed,
                other => BillingError::from(other),
            })?;
        Database::increment_voucher_usage(&mut *tx, voucher.id).await?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit redemption: {}", e))
        })?;

        Ok(RedemptionResult {
            redemption_id: inserted.id,
            voucher_type,
            value_applied: voucher.value,
            auto_switch_triggered: redemption.auto_switch_triggered,
            previous_sub_type: redemption
                .previous_sub_type
                .as_deref()
                .and_then(SubscriptionType::from_string),
            new_sub_type: redemption
                .new_sub_type
                .as_deref()
                .and_then(SubscriptionType::from_string),
            subscription: None,
            balance,
        })
    }

    /// Run the engine once after a balance credit and note any switch on the
    /// redemption row. Failures are logged; the redemption has already committed.
    async fn auto_switch_after_credit(&self, merchant_id: Uuid, result: &mut RedemptionResult) {
        let evaluation = match self.engine.evaluate(merchant_id, TRIGGER_VOUCHER).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                record_error("auto_switch", "redeem");
                warn!(error = %e, "Auto-switch after redemption failed");
                return;
            }
        };
        if !evaluation.switched() {
            return;
        }

        result.auto_switch_triggered = true;
        result.previous_sub_type = evaluation.previous_type;
        result.new_sub_type = evaluation.new_type;

        if let Err(e) = self
            .db
            .mark_redemption_auto_switch(
                result.redemption_id,
                evaluation.previous_type,
                evaluation.new_type,
            )
            .await
        {
            record_error("auto_switch", "mark_redemption");
            warn!(error = %e, "Failed to record auto-switch on redemption");
        }
    }
}

/// Extend (or seed) the merchant's subscription under a row lock.
async fn apply_subscription_days(
    conn: &mut PgConnection,
    merchant_id: Uuid,
    days: i64,
    now: DateTime<Utc>,
) -> Result<DaysApplied, BillingError> {
    let mut current = Database::lock_subscription(&mut *conn, merchant_id).await?;

    if current.is_none() {
        let seeded = extend_subscription(None, merchant_id, days, now)?;
        if let Some(created) = Database::insert_subscription(&mut *conn, &seeded).await? {
            return Ok(DaysApplied {
                end_before: None,
                end_after: created.current_period_end,
                previous_type: None,
                new_type: created.parsed_type(),
            });
        }
        // Provisioned concurrently; extend the row that won.
        current = Database::lock_subscription(&mut *conn, merchant_id).await?;
    }

    let current = current.ok_or_else(|| {
        BillingError::Internal(AppError::DatabaseError(anyhow::anyhow!(
            "Subscription row vanished for merchant {}",
            merchant_id
        )))
    })?;
    let next = extend_subscription(Some(&current), merchant_id, days, now)?;
    let saved = Database::update_subscription(&mut *conn, &next).await?;

    Ok(DaysApplied {
        end_before: current.current_period_end,
        end_after: saved.current_period_end,
        previous_type: Some(current.parsed_type()),
        new_type: saved.parsed_type(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn voucher() -> Voucher {
        let now = Utc::now();
        Voucher {
            id: Uuid::new_v4(),
            code: "WELCOME100".to_string(),
            voucher_type: "BALANCE".to_string(),
            value: Decimal::from(100000),
            currency: Some("IDR".to_string()),
            max_usage: Some(10),
            current_usage: 0,
            valid_from: Some(now - Duration::days(1)),
            valid_until: Some(now + Duration::days(1)),
            is_active: true,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn monthly(end: Option<DateTime<Utc>>) -> MerchantSubscription {
        let mut sub = extend_subscription(None, Uuid::new_v4(), 1, Utc::now()).unwrap();
        sub.current_period_start = end.map(|e| e - Duration::days(30));
        sub.current_period_end = end;
        sub
    }

    #[test]
    fn normalizes_codes() {
        assert_eq!(normalize_code("  welcome100 \n"), "WELCOME100");
        assert_eq!(normalize_code("   "), "");
    }

    #[test]
    fn lock_key_is_stable_and_case_sensitive_on_normalized_input() {
        let key = advisory_lock_key("WELCOME100");
        assert_eq!(key, advisory_lock_key("WELCOME100"));
        assert_ne!(key, advisory_lock_key("WELCOME200"));
        assert_eq!(
            advisory_lock_key(&normalize_code("welcome100")),
            advisory_lock_key("WELCOME100")
        );
    }

    #[test]
    fn lock_key_uses_leading_digest_bytes() {
        // SHA-256("") = e3b0c442 98fc1c14 ...
        assert_eq!(
            advisory_lock_key(""),
            i64::from_be_bytes([0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14])
        );
    }

    #[test]
    fn accepts_valid_voucher() {
        assert!(check_voucher_rules(&voucher(), "idr", Utc::now()).is_ok());
    }

    #[test]
    fn rule_order_inactive_before_currency() {
        let mut v = voucher();
        v.is_active = false;
        let err = check_voucher_rules(&v, "USD", Utc::now()).unwrap_err();
        assert_eq!(err.code(), "VOUCHER_INACTIVE");
    }

    #[test]
    fn rule_order_currency_before_dates() {
        let mut v = voucher();
        v.valid_until = Some(Utc::now() - Duration::days(1));
        let err = check_voucher_rules(&v, "USD", Utc::now()).unwrap_err();
        assert_eq!(err.code(), "CURRENCY_MISMATCH");
    }

    #[test]
    fn date_window_checks() {
        let now = Utc::now();
        let mut v = voucher();
        v.valid_from = Some(now + Duration::hours(1));
        assert_eq!(
            check_voucher_rules(&v, "IDR", now).unwrap_err().code(),
            "VOUCHER_NOT_STARTED"
        );

        let mut v = voucher();
        v.valid_until = Some(now - Duration::seconds(1));
        v.current_usage = 10;
        assert_eq!(
            check_voucher_rules(&v, "IDR", now).unwrap_err().code(),
            "VOUCHER_EXPIRED"
        );

        let mut v = voucher();
        v.valid_from = None;
        v.valid_until = Some(now);
        assert!(check_voucher_rules(&v, "IDR", now).is_ok());
    }

    #[test]
    fn usage_cap() {
        let mut v = voucher();
        v.current_usage = 10;
        assert_eq!(
            check_voucher_rules(&v, "IDR", Utc::now()).unwrap_err().code(),
            "VOUCHER_LIMIT_REACHED"
        );
        v.max_usage = None;
        assert!(check_voucher_rules(&v, "IDR", Utc::now()).is_ok());
    }

    #[test]
    fn unrestricted_currency_matches_any_merchant() {
        let mut v = voucher();
        v.currency = None;
        assert!(check_voucher_rules(&v, "USD", Utc::now()).is_ok());
    }

    #[test]
    fn day_counts_are_floored() {
        assert_eq!(days_to_add(Decimal::new(105, 1)).unwrap(), 10);
        assert_eq!(days_to_add(Decimal::from(1)).unwrap(), 1);
        assert_eq!(
            days_to_add(Decimal::new(9, 1)).unwrap_err().code(),
            "VOUCHER_INVALID"
        );
        assert!(days_to_add(Decimal::from(-3)).is_err());
    }

    #[test]
    fn lapsed_period_extends_from_now() {
        let now = Utc::now();
        let sub = monthly(Some(now - Duration::days(5)));
        let next = extend_subscription(Some(&sub), sub.merchant_id, 10, now).unwrap();
        assert_eq!(next.current_period_end, Some(now + Duration::days(10)));
        assert_eq!(next.current_period_start, Some(now));
    }

    #[test]
    fn live_period_extends_from_its_end() {
        let now = Utc::now();
        let end = now + Duration::days(4);
        let sub = monthly(Some(end));
        let next = extend_subscription(Some(&sub), sub.merchant_id, 10, now).unwrap();
        assert_eq!(next.current_period_end, Some(end + Duration::days(10)));
        assert_eq!(next.current_period_start, sub.current_period_start);
    }

    #[test]
    fn trial_becomes_monthly_and_suspension_clears() {
        let now = Utc::now();
        let mut sub = monthly(None);
        sub.subscription_type = "TRIAL".to_string();
        sub.status = "SUSPENDED".to_string();
        sub.suspended_at = Some(now);
        sub.suspend_reason = Some("Trial expired".to_string());
        sub.trial_ends_at = Some(now - Duration::days(1));

        let next = extend_subscription(Some(&sub), sub.merchant_id, 7, now).unwrap();
        assert_eq!(next.parsed_type(), SubscriptionType::Monthly);
        assert_eq!(next.parsed_status(), SubscriptionStatus::Active);
        assert!(next.suspended_at.is_none());
        assert!(next.suspend_reason.is_none());
        assert_eq!(next.trial_ends_at, sub.trial_ends_at);
    }

    #[test]
    fn deposit_keeps_its_type() {
        let now = Utc::now();
        let mut sub = monthly(None);
        sub.subscription_type = "DEPOSIT".to_string();
        let next = extend_subscription(Some(&sub), sub.merchant_id, 7, now).unwrap();
        assert_eq!(next.parsed_type(), SubscriptionType::Deposit);
    }

    #[test]
    fn missing_row_is_seeded_monthly() {
        let now = Utc::now();
        let merchant_id = Uuid::new_v4();
        let next = extend_subscription(None, merchant_id, 30, now).unwrap();
        assert_eq!(next.merchant_id, merchant_id);
        assert_eq!(next.parsed_type(), SubscriptionType::Monthly);
        assert_eq!(next.current_period_end, Some(now + Duration::days(30)));

        let applied = DaysApplied {
            end_before: None,
            end_after: next.current_period_end,
            previous_type: None,
            new_type: SubscriptionType::Monthly,
        };
        assert!(applied.switched());
    }

    #[test]
    fn oversized_day_grant_is_rejected() {
        let days = days_to_add(Decimal::from(200_000_000)).unwrap();
        let err = extend_subscription(None, Uuid::new_v4(), days, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "VOUCHER_INVALID");

        let sub = monthly(Some(Utc::now() + Duration::days(5)));
        let err = extend_subscription(Some(&sub), sub.merchant_id, i64::MAX, Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "VOUCHER_INVALID");
    }
}
