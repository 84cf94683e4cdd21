//! Merchant context extractor.
//!
//! The gateway authenticates the caller and forwards the merchant, user and role
//! as headers. Handlers take a [`MerchantContext`] to scope every operation to
//! that merchant.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::BillingError;

pub const MERCHANT_ID_HEADER: &str = "x-merchant-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerchantRole {
    Owner,
    Staff,
}

impl MerchantRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MERCHANT_OWNER" => Some(MerchantRole::Owner),
            "MERCHANT_STAFF" => Some(MerchantRole::Staff),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MerchantContext {
    pub merchant_id: Uuid,
    pub user_id: Uuid,
    pub role: MerchantRole,
}

impl MerchantContext {
    /// Reject anyone but the merchant owner.
    pub fn require_owner(&self) -> Result<(), BillingError> {
        match self.role {
            MerchantRole::Owner => Ok(()),
            MerchantRole::Staff => Err(BillingError::Forbidden(
                "Only the merchant owner can perform this action".to_string(),
            )),
        }
    }
}

fn header_uuid(parts: &Parts, name: &str) -> Option<Uuid> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for MerchantContext
where
    S: Send + Sync,
{
    type Rejection = BillingError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let merchant_id =
            header_uuid(parts, MERCHANT_ID_HEADER).ok_or(BillingError::MerchantRequired)?;
        let user_id = header_uuid(parts, USER_ID_HEADER).ok_or(BillingError::MerchantRequired)?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(MerchantRole::parse)
            .ok_or_else(|| {
                BillingError::Forbidden("A merchant role is required".to_string())
            })?;

        let span = tracing::Span::current();
        span.record("merchant_id", merchant_id.to_string().as_str());

        Ok(MerchantContext {
            merchant_id,
            user_id,
            role,
        })
    }
}
