//! Voucher and redemption models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// What a voucher grants when redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoucherType {
    /// Credits the merchant balance by `value`.
    Balance,
    /// Extends the subscription period by `floor(value)` days.
    SubscriptionDays,
}

impl VoucherType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherType::Balance => "BALANCE",
            VoucherType::SubscriptionDays => "SUBSCRIPTION_DAYS",
        }
    }

    /// Parse a stored value. Unknown types yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BALANCE" => Some(VoucherType::Balance),
            "SUBSCRIPTION_DAYS" => Some(VoucherType::SubscriptionDays),
            _ => None,
        }
    }
}

impl std::fmt::Display for VoucherType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Redeemable voucher.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Voucher {
    pub id: Uuid,
    pub code: String,
    pub voucher_type: String,
    pub value: Decimal,
    pub currency: Option<String>,
    pub max_usage: Option<i32>,
    pub current_usage: i32,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    pub fn parsed_type(&self) -> Option<VoucherType> {
        VoucherType::parse(&self.voucher_type)
    }

    /// Whether the usage cap has been reached. Uncapped vouchers never are.
    pub fn is_exhausted(&self) -> bool {
        self.max_usage.is_some_and(|max| self.current_usage >= max)
    }
}

/// Immutable record of one merchant applying one voucher.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct VoucherRedemption {
    pub id: Uuid,
    pub voucher_id: Uuid,
    pub merchant_id: Uuid,
    pub voucher_code: String,
    pub voucher_type: String,
    pub value_applied: Decimal,
    pub currency: Option<String>,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub subscription_end_before: Option<DateTime<Utc>>,
    pub subscription_end_after: Option<DateTime<Utc>>,
    pub auto_switch_triggered: bool,
    pub previous_sub_type: Option<String>,
    pub new_sub_type: Option<String>,
    pub redeemed_by: Uuid,
    pub redeemed_at: DateTime<Utc>,
}

/// Input for inserting a redemption row.
#[derive(Debug, Clone)]
pub struct NewRedemption {
    pub voucher_id: Uuid,
    pub merchant_id: Uuid,
    pub voucher_code: String,
    pub voucher_type: VoucherType,
    pub value_applied: Decimal,
    pub currency: Option<String>,
    pub balance_before: Option<Decimal>,
    pub balance_after: Option<Decimal>,
    pub subscription_end_before: Option<DateTime<Utc>>,
    pub subscription_end_after: Option<DateTime<Utc>>,
    pub auto_switch_triggered: bool,
    pub previous_sub_type: Option<String>,
    pub new_sub_type: Option<String>,
    pub redeemed_by: Uuid,
    pub redeemed_at: DateTime<Utc>,
}
