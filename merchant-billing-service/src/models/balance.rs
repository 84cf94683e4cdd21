//! Merchant balance ledger models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of balance mutation recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BalanceTransactionType {
    Deposit,
}

impl BalanceTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceTransactionType::Deposit => "DEPOSIT",
        }
    }
}

/// Running balance, one row per merchant. Created on first credit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MerchantBalance {
    pub merchant_id: Uuid,
    pub balance: Decimal,
    pub last_topup_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BalanceTransaction {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub transaction_type: String,
    pub amount: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
