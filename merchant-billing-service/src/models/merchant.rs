//! Merchant fields consulted by the billing core, and plan terms.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The slice of a merchant this service reads. All other merchant fields are
/// owned by the catalog side.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MerchantAccount {
    pub id: Uuid,
    pub currency: String,
    pub is_open: bool,
    pub is_manual_override: bool,
    pub is_active: bool,
}

/// Trial and grace lengths derived from the merchant's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanTerms {
    pub trial_days: i64,
    pub grace_period_days: i64,
}

impl Default for PlanTerms {
    fn default() -> Self {
        Self {
            trial_days: 30,
            grace_period_days: 3,
        }
    }
}
