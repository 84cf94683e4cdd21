//! Balance and ledger reads.

use axum::extract::{Query, State};
use service_core::response::ApiResponse;

use crate::dtos::{BalanceResponse, Page, PageQuery};
use crate::error::BillingError;
use crate::middleware::MerchantContext;
use crate::models::BalanceTransaction;
use crate::startup::AppState;

pub async fn get_balance(
    State(state): State<AppState>,
    merchant: MerchantContext,
) -> Result<ApiResponse<BalanceResponse>, BillingError> {
    let row = state.db.get_balance(merchant.merchant_id).await?;
    Ok(ApiResponse::ok(
        "Balance retrieved",
        BalanceResponse::from_row(merchant.merchant_id, row),
    ))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Page<BalanceTransaction>>, BillingError> {
    let (limit, offset) = page.bounds();
    let (items, total) = state
        .db
        .list_balance_transactions(merchant.merchant_id, limit, offset)
        .await?;

    Ok(ApiResponse::ok(
        "Balance transactions retrieved",
        Page {
            items,
            total,
            limit,
            offset,
        },
    ))
}
