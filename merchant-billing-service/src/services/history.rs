//! Subscription history recorder.

use crate::models::{MerchantSubscription, NewHistoryEntry};
use crate::services::database::Database;
use crate::services::metrics::record_error;
use serde::Serialize;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Period bounds attached to a history row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeriodMetadata {
    period_from: chrono::DateTime<chrono::Utc>,
    period_to: chrono::DateTime<chrono::Utc>,
    days_delta: i64,
}

/// Metadata for a subscription snapshot: the paid period when both bounds are
/// set, else the trial window, else nothing.
pub fn period_metadata(subscription: &MerchantSubscription) -> Option<serde_json::Value> {
    let (from, to) = match (
        subscription.current_period_start,
        subscription.current_period_end,
    ) {
        (Some(from), Some(to)) => (from, to),
        _ => match (subscription.trial_started_at, subscription.trial_ends_at) {
            (Some(from), Some(to)) => (from, to),
            _ => return None,
        },
    };

    let metadata = PeriodMetadata {
        period_from: from,
        period_to: to,
        days_delta: (to - from).num_days(),
    };
    match serde_json::to_value(&metadata) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "Dropping unserializable history metadata");
            None
        }
    }
}

/// Append-only audit writer. Failures are logged and swallowed; the transition
/// being recorded has already committed.
#[derive(Clone)]
pub struct HistoryRecorder {
    db: Arc<Database>,
}

impl HistoryRecorder {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, entry), fields(merchant_id = %entry.merchant_id, event_type = entry.event_type.as_str()))]
    pub async fn record(&self, entry: NewHistoryEntry) -> bool {
        match self.db.insert_history(&entry).await {
            Ok(_) => true,
            Err(e) => {
                record_error("history", "insert_history");
                warn!(error = %e, reason = %entry.reason, "Failed to record subscription history");
                false
            }
        }
    }
}
