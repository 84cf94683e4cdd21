//! Merchant subscription and subscription history models.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing type of a merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Trial,
    Deposit,
    Monthly,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionType::Trial => "TRIAL",
            SubscriptionType::Deposit => "DEPOSIT",
            SubscriptionType::Monthly => "MONTHLY",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "TRIAL" => Some(SubscriptionType::Trial),
            "DEPOSIT" => Some(SubscriptionType::Deposit),
            "MONTHLY" => Some(SubscriptionType::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SubscriptionStatus::Active),
            "SUSPENDED" => Some(SubscriptionStatus::Suspended),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current billing state of a merchant. Exactly one row per merchant once
/// provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MerchantSubscription {
    pub id: Uuid,
    pub merchant_id: Uuid,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub status: String,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspend_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MerchantSubscription {
    /// Parsed type. Rows with an unrecognised type are treated as trials,
    /// the most restrictive state.
    pub fn parsed_type(&self) -> SubscriptionType {
        SubscriptionType::from_string(&self.subscription_type).unwrap_or(SubscriptionType::Trial)
    }

    /// Parsed status. Unrecognised values read as active.
    pub fn parsed_status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status).unwrap_or(SubscriptionStatus::Active)
    }

    pub fn is_suspended(&self) -> bool {
        self.parsed_status() == SubscriptionStatus::Suspended
    }

    /// Whether a paid period is still running at `now`.
    pub fn has_active_period(&self, now: DateTime<Utc>) -> bool {
        self.current_period_end.is_some_and(|end| end > now)
    }

    /// Whole days left in the relevant window (trial or paid period), if any.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let end = match self.parsed_type() {
            SubscriptionType::Trial => self.trial_ends_at,
            SubscriptionType::Monthly | SubscriptionType::Deposit => self.current_period_end,
        }?;
        Some((end - now).num_days().max(0))
    }
}

/// `at` moved forward by `days`, or `None` when the result is out of range.
pub fn add_days(at: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|delta| at.checked_add_signed(delta))
}

/// Kind of transition recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryEventType {
    AutoSwitched,
    Suspended,
    Reactivated,
}

impl HistoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEventType::AutoSwitched => "AUTO_SWITCHED",
            HistoryEventType::Suspended => "SUSPENDED",
            HistoryEventType::Reactivated => "REACTIVATED",
        }
    }
}

/// Append-only audit row for one transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHistory {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub event_type: String,
    pub previous_type: Option<String>,
    pub new_type: Option<String>,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub previous_balance: Option<Decimal>,
    pub new_balance: Option<Decimal>,
    pub previous_period_end: Option<DateTime<Utc>>,
    pub new_period_end: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a history row.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub merchant_id: Uuid,
    pub event_type: HistoryEventType,
    pub previous_type: Option<SubscriptionType>,
    pub new_type: Option<SubscriptionType>,
    pub previous_status: Option<SubscriptionStatus>,
    pub new_status: Option<SubscriptionStatus>,
    pub previous_balance: Option<Decimal>,
    pub new_balance: Option<Decimal>,
    pub previous_period_end: Option<DateTime<Utc>>,
    pub new_period_end: Option<DateTime<Utc>>,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
    pub triggered_by: String,
}
