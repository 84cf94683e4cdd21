//! Request and response bodies for the HTTP API.

use axum::extract::FromRequest;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::BillingError;
use crate::models::{MerchantBalance, MerchantSubscription};
use crate::services::discount_client::OrderLine;

/// JSON body whose rejections render as `VALIDATION_ERROR`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(BillingError))]
pub struct JsonBody<T>(pub T);

#[derive(Debug, Deserialize, Validate)]
pub struct RedeemVoucherRequest {
    #[validate(length(min = 1, max = 64, message = "Voucher code must be 1-64 characters"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVoucherRequest {
    #[validate(length(min = 1, max = 64))]
    pub merchant_code: String,
    #[validate(length(min = 1, max = 64))]
    pub voucher_code: String,
    #[validate(length(min = 1, max = 32))]
    pub order_type: String,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<OrderLine>,
}

impl ValidateVoucherRequest {
    /// Field-level checks plus non-negative line subtotals.
    pub fn check(&self) -> Result<(), BillingError> {
        self.validate()?;
        if self.items.iter().any(|item| item.subtotal < Decimal::ZERO) {
            return Err(BillingError::Validation(
                "Item subtotals must not be negative".to_string(),
            ));
        }
        if self.items.iter().any(|item| item.menu_id.trim().is_empty()) {
            return Err(BillingError::Validation("Item menuId is required".to_string()));
        }
        Ok(())
    }
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageQuery {
    /// `(limit, offset)` with limit clamped to 1..=100 and offset at least 0.
    pub fn bounds(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionOverview {
    pub subscription: Option<MerchantSubscription>,
    pub balance: Decimal,
    pub days_remaining: Option<i64>,
    pub is_suspended: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub merchant_id: uuid::Uuid,
    pub balance: Decimal,
    pub last_topup_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BalanceResponse {
    pub fn from_row(merchant_id: uuid::Uuid, row: Option<MerchantBalance>) -> Self {
        match row {
            Some(row) => Self {
                merchant_id,
                balance: row.balance,
                last_topup_at: row.last_topup_at,
            },
            None => Self {
                merchant_id,
                balance: Decimal::ZERO,
                last_topup_at: None,
            },
        }
    }
}
