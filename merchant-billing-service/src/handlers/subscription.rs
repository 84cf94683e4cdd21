//! Subscription state, history and on-demand evaluation.

use axum::extract::{Query, State};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::response::ApiResponse;

use crate::dtos::{Page, PageQuery, SubscriptionOverview};
use crate::error::BillingError;
use crate::middleware::MerchantContext;
use crate::models::SubscriptionHistory;
use crate::services::auto_switch::TRIGGER_ON_DEMAND;
use crate::services::AutoSwitchResult;
use crate::startup::AppState;

pub async fn get_subscription(
    State(state): State<AppState>,
    merchant: MerchantContext,
) -> Result<ApiResponse<SubscriptionOverview>, BillingError> {
    let subscription = state.db.get_subscription(merchant.merchant_id).await?;
    let balance = state
        .db
        .get_balance(merchant.merchant_id)
        .await?
        .map(|b| b.balance)
        .unwrap_or(Decimal::ZERO);

    let now = Utc::now();
    let overview = SubscriptionOverview {
        days_remaining: subscription.as_ref().and_then(|s| s.days_remaining(now)),
        is_suspended: subscription.as_ref().is_some_and(|s| s.is_suspended()),
        subscription,
        balance,
    };

    Ok(ApiResponse::ok("Subscription retrieved", overview))
}

pub async fn list_history(
    State(state): State<AppState>,
    merchant: MerchantContext,
    Query(page): Query<PageQuery>,
) -> Result<ApiResponse<Page<SubscriptionHistory>>, BillingError> {
    let (limit, offset) = page.bounds();
    let (items, total) = state
        .db
        .list_subscription_history(merchant.merchant_id, limit, offset)
        .await?;

    Ok(ApiResponse::ok(
        "Subscription history retrieved",
        Page {
            items,
            total,
            limit,
            offset,
        },
    ))
}

/// Run the auto-switch engine now. Owner only.
pub async fn evaluate_subscription(
    State(state): State<AppState>,
    merchant: MerchantContext,
) -> Result<ApiResponse<AutoSwitchResult>, BillingError> {
    merchant.require_owner()?;

    let result = state
        .engine
        .evaluate(merchant.merchant_id, TRIGGER_ON_DEMAND)
        .await?;

    Ok(ApiResponse::ok("Subscription evaluated", result))
}
