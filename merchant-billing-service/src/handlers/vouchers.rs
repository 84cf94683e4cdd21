//! Voucher redemption and public validation handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use service_core::observability::extract_request_id;
use service_core::response::ApiResponse;
use validator::Validate;

use crate::dtos::{JsonBody, Page, PageQuery, RedeemVoucherRequest, ValidateVoucherRequest};
use crate::error::BillingError;
use crate::middleware::MerchantContext;
use crate::models::VoucherRedemption;
use crate::services::discount_client::DiscountQuery;
use crate::services::RedemptionResult;
use crate::startup::AppState;

/// Redeem a voucher for the caller's merchant. Owner only.
pub async fn redeem_voucher(
    State(state): State<AppState>,
    merchant: MerchantContext,
    JsonBody(payload): JsonBody<RedeemVoucherRequest>,
) -> Result<ApiResponse<RedemptionResult>, BillingError> {
    merchant.require_owner()?;
    payload.validate()?;

    tracing::info!(
        merchant_id = %merchant.merchant_id,
        user_id = %merchant.user_id,
        "Redeeming voucher"
    );

    let result = state
        .redemption
        .redeem(merchant.merchant_id, merchant.user_id, &payload.code)
        .await?;

    Ok(ApiResponse::ok("Voucher redeemed successfully", result))
}

/// Redemptions made by the caller's merchant.
pub async fn list_redemptions(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Page<VoucherRedemption>>, BillingError> {
    let (limit, offset) = page.bounds();
    let (items, total) = state
        .db
        .list_redemptions(merchant.merchant_id, limit, offset)
        .await?;

    Ok(ApiResponse::ok(
        "Redemptions retrieved",
        Page {
            items,
            total,
            limit,
            offset,
        },
    ))
}

/// Check a customer voucher against an order. The discount itself is computed
/// by the discount service; its errors pass through unchanged.
pub async fn validate_voucher(
    State(state): State<AppState>,
    headers: HeaderMap,
    JsonBody(payload): JsonBody<ValidateVoucherRequest>,
) -> Result<ApiResponse<serde_json::Value>, BillingError> {
    payload.check()?;

    let merchant = state
        .db
        .get_merchant_by_code(payload.merchant_code.trim())
        .await?
        .filter(|m| m.is_active)
        .ok_or(BillingError::MerchantNotFound)?;

    let query = DiscountQuery {
        merchant_id: merchant.id,
        voucher_code: payload.voucher_code.trim().to_uppercase(),
        order_type: payload.order_type,
        items: payload.items,
    };
    let request_id = extract_request_id(&headers);
    let discount = state
        .discounts
        .validate(&query, request_id.as_deref())
        .await?;

    Ok(ApiResponse::ok("Voucher is valid", discount))
}
