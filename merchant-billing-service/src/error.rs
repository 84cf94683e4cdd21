//! Typed failures surfaced by the billing HTTP API.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use service_core::error::AppError;
use service_core::response::error_response;
use thiserror::Error;

use crate::services::discount_client::DiscountError;
use crate::services::record_error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Merchant context is required")]
    MerchantRequired,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("Merchant not found")]
    MerchantNotFound,

    #[error("Voucher not found")]
    VoucherNotFound,

    #[error("Voucher is not active")]
    VoucherInactive,

    #[error("Voucher is only valid for {voucher} merchants (merchant uses {merchant})")]
    CurrencyMismatch { voucher: String, merchant: String },

    #[error("Voucher is not valid yet")]
    VoucherNotStarted,

    #[error("Voucher has expired")]
    VoucherExpired,

    #[error("Voucher usage limit has been reached")]
    VoucherLimitReached,

    #[error("Voucher has already been redeemed by this merchant")]
    AlreadyRedeemed,

    #[error("{0}")]
    VoucherInvalid(String),

    #[error("{0}")]
    Discount(DiscountError),

    #[error("Internal error: {0}")]
    Internal(AppError),
}

impl BillingError {
    /// Machine-readable code for the error envelope.
    pub fn code(&self) -> &str {
        match self {
            BillingError::MerchantRequired => "MERCHANT_REQUIRED",
            BillingError::Forbidden(_) => "FORBIDDEN",
            BillingError::Validation(_) => "VALIDATION_ERROR",
            BillingError::MerchantNotFound => "MERCHANT_NOT_FOUND",
            BillingError::VoucherNotFound => "VOUCHER_NOT_FOUND",
            BillingError::VoucherInactive => "VOUCHER_INACTIVE",
            BillingError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            BillingError::VoucherNotStarted => "VOUCHER_NOT_STARTED",
            BillingError::VoucherExpired => "VOUCHER_EXPIRED",
            BillingError::VoucherLimitReached => "VOUCHER_LIMIT_REACHED",
            BillingError::AlreadyRedeemed => "ALREADY_REDEEMED",
            BillingError::VoucherInvalid(_) => "VOUCHER_INVALID",
            BillingError::Discount(err) => &err.code,
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BillingError::MerchantRequired => StatusCode::UNAUTHORIZED,
            BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BillingError::Validation(_) => StatusCode::BAD_REQUEST,
            BillingError::MerchantNotFound | BillingError::VoucherNotFound => {
                StatusCode::NOT_FOUND
            }
            BillingError::AlreadyRedeemed => StatusCode::CONFLICT,
            BillingError::VoucherInactive
            | BillingError::CurrencyMismatch { .. }
            | BillingError::VoucherNotStarted
            | BillingError::VoucherExpired
            | BillingError::VoucherLimitReached
            | BillingError::VoucherInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BillingError::Discount(err) => {
                StatusCode::from_u16(err.status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this is a business-rule rejection rather than a fault.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, BillingError::Internal(_))
    }
}

impl From<AppError> for BillingError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ValidationError(e) => BillingError::Validation(e.to_string()),
            AppError::BadRequest(e) => BillingError::Validation(e.to_string()),
            AppError::Forbidden(e) => BillingError::Forbidden(e.to_string()),
            AppError::Unauthorized(_) => BillingError::MerchantRequired,
            other => BillingError::Internal(other),
        }
    }
}

impl From<validator::ValidationErrors> for BillingError {
    fn from(err: validator::ValidationErrors) -> Self {
        BillingError::Validation(err.to_string())
    }
}

impl From<JsonRejection> for BillingError {
    fn from(rejection: JsonRejection) -> Self {
        BillingError::Validation(rejection.body_text())
    }
}

impl From<DiscountError> for BillingError {
    fn from(err: DiscountError) -> Self {
        BillingError::Discount(err)
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let message = match &self {
            BillingError::Internal(cause) => {
                tracing::error!(error = %cause, "Internal error while handling billing request");
                record_error("internal", "http");
                "An internal error occurred".to_string()
            }
            BillingError::Discount(err) => err.message.clone(),
            other => other.to_string(),
        };
        error_response(self.status(), self.code(), message)
    }
}
