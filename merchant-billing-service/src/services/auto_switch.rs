//! Subscription auto-switch engine.
//!
//! [`decide`] is a pure function of the current subscription row, balance, plan
//! terms and clock. [`AutoSwitchEngine::evaluate`] loads those inputs under a row
//! lock, applies the decision in its own transaction, and then performs the
//! best-effort side effects (store visibility, history).

use crate::error::BillingError;
use crate::models::{
    add_days, HistoryEventType, MerchantSubscription, NewHistoryEntry, PlanTerms, SubscriptionStatus,
    SubscriptionType,
};
use crate::services::database::Database;
use crate::services::history::{period_metadata, HistoryRecorder};
use crate::services::metrics::record_auto_switch;
use crate::services::visibility::StoreVisibility;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use sqlx::postgres::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// `triggered_by` for evaluations following a voucher redemption.
pub const TRIGGER_VOUCHER: &str = "VOUCHER_REDEMPTION";
/// `triggered_by` for evaluations requested explicitly by the merchant.
pub const TRIGGER_ON_DEMAND: &str = "MERCHANT_REQUEST";

const TRIAL_SUSPEND_REASON: &str = "Trial expired: no payment method";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchAction {
    NoChange,
    AutoSwitched,
    Suspended,
    Reactivated,
}

impl SwitchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchAction::NoChange => "NO_CHANGE",
            SwitchAction::AutoSwitched => "AUTO_SWITCHED",
            SwitchAction::Suspended => "SUSPENDED",
            SwitchAction::Reactivated => "REACTIVATED",
        }
    }
}

/// What the engine decided to do with a merchant's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No row yet: create a TRIAL of the plan's length.
    Provision,
    /// Suspended row whose type-specific condition holds again.
    Reactivate,
    /// Move to MONTHLY/ACTIVE. Trial bounds are cleared when leaving a trial.
    SwitchToMonthly { clear_trial: bool },
    SwitchToDeposit,
    Suspend,
    NoChange,
}

impl Transition {
    pub fn action(&self) -> SwitchAction {
        match self {
            Transition::Provision
            | Transition::SwitchToMonthly { .. }
            | Transition::SwitchToDeposit => SwitchAction::AutoSwitched,
            Transition::Reactivate => SwitchAction::Reactivated,
            Transition::Suspend => SwitchAction::Suspended,
            Transition::NoChange => SwitchAction::NoChange,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub transition: Transition,
    pub reason: &'static str,
}

impl Decision {
    fn new(transition: Transition, reason: &'static str) -> Self {
        Self { transition, reason }
    }
}

/// Decide the next billing state. Pure: every input is explicit.
pub fn decide(
    subscription: Option<&MerchantSubscription>,
    balance: Decimal,
    terms: PlanTerms,
    now: DateTime<Utc>,
) -> Decision {
    let Some(sub) = subscription else {
        return Decision::new(Transition::Provision, "Subscription provisioned as trial");
    };

    let sub_type = sub.parsed_type();
    let has_balance = balance > Decimal::ZERO;
    let has_period = sub.has_active_period(now);

    if sub.is_suspended() {
        let reactivation = match sub_type {
            SubscriptionType::Monthly if has_period => Some("Monthly period is active"),
            SubscriptionType::Deposit if has_balance => Some("Balance topped up"),
            SubscriptionType::Trial if sub.trial_ends_at.is_some_and(|end| end > now) => {
                Some("Trial is still running")
            }
            _ => None,
        };
        if let Some(reason) = reactivation {
            return Decision::new(Transition::Reactivate, reason);
        }
    }

    match sub_type {
        SubscriptionType::Trial => {
            let Some(trial_ends_at) = sub.trial_ends_at else {
                return Decision::new(Transition::NoChange, "Trial has no end date");
            };
            let within_grace = match add_days(trial_ends_at, terms.grace_period_days) {
                Some(grace_end) => now <= grace_end,
                None => true,
            };
            if within_grace {
                return Decision::new(Transition::NoChange, "Trial still valid");
            }
            if has_period {
                Decision::new(
                    Transition::SwitchToMonthly { clear_trial: true },
                    "Trial expired, monthly period active",
                )
            } else if has_balance {
                Decision::new(Transition::SwitchToDeposit, "Trial expired, balance available")
            } else {
                Decision::new(Transition::Suspend, TRIAL_SUSPEND_REASON)
            }
        }
        SubscriptionType::Deposit => {
            if has_balance {
                Decision::new(Transition::NoChange, "Balance available")
            } else if has_period {
                Decision::new(
                    Transition::SwitchToMonthly { clear_trial: false },
                    "Deposit exhausted, monthly period active",
                )
            } else {
                Decision::new(
                    Transition::NoChange,
                    "Deposit exhausted, awaiting nightly suspension",
                )
            }
        }
        SubscriptionType::Monthly => Decision::new(Transition::NoChange, "Monthly still valid"),
    }
}

/// Apply a transition to a copy of the current row.
pub fn apply_transition(
    current: &MerchantSubscription,
    transition: Transition,
    reason: &str,
    now: DateTime<Utc>,
) -> MerchantSubscription {
    let mut next = current.clone();
    match transition {
        Transition::Provision | Transition::NoChange => {}
        Transition::Reactivate => {
            next.status = SubscriptionStatus::Active.as_str().to_string();
            next.suspended_at = None;
            next.suspend_reason = None;
        }
        Transition::SwitchToMonthly { clear_trial } => {
            next.subscription_type = SubscriptionType::Monthly.as_str().to_string();
            next.status = SubscriptionStatus::Active.as_str().to_string();
            next.suspended_at = None;
            next.suspend_reason = None;
            if clear_trial {
                next.trial_started_at = None;
                next.trial_ends_at = None;
            }
        }
        Transition::SwitchToDeposit => {
            next.subscription_type = SubscriptionType::Deposit.as_str().to_string();
            next.status = SubscriptionStatus::Active.as_str().to_string();
            next.suspended_at = None;
            next.suspend_reason = None;
        }
        Transition::Suspend => {
            // Keep the original suspension time when re-applying to a suspended row.
            next.suspended_at = next.suspended_at.filter(|_| current.is_suspended()).or(Some(now));
            next.status = SubscriptionStatus::Suspended.as_str().to_string();
            next.suspend_reason = Some(reason.to_string());
        }
    }
    next
}

/// Fresh TRIAL/ACTIVE row for a merchant that has never been provisioned.
pub fn new_trial(
    merchant_id: Uuid,
    terms: PlanTerms,
    now: DateTime<Utc>,
) -> Result<MerchantSubscription, BillingError> {
    let trial_ends_at = add_days(now, terms.trial_days).ok_or_else(|| {
        BillingError::Internal(AppError::ConfigError(anyhow::anyhow!(
            "Trial length of {} days is out of range",
            terms.trial_days
        )))
    })?;
    Ok(MerchantSubscription {
        id: Uuid::new_v4(),
        merchant_id,
        subscription_type: SubscriptionType::Trial.as_str().to_string(),
        status: SubscriptionStatus::Active.as_str().to_string(),
        trial_started_at: Some(now),
        trial_ends_at: Some(trial_ends_at),
        current_period_start: None,
        current_period_end: None,
        suspended_at: None,
        suspend_reason: None,
        created_at: now,
        updated_at: now,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSwitchResult {
    pub action: SwitchAction,
    pub reason: String,
    pub previous_type: Option<SubscriptionType>,
    pub previous_status: Option<SubscriptionStatus>,
    pub new_type: Option<SubscriptionType>,
    pub new_status: Option<SubscriptionStatus>,
    pub store_opened: bool,
    pub store_closed: bool,
}

impl AutoSwitchResult {
    pub fn switched(&self) -> bool {
        self.action != SwitchAction::NoChange
    }
}

#[derive(Clone)]
pub struct AutoSwitchEngine {
    db: Arc<Database>,
    visibility: StoreVisibility,
    history: HistoryRecorder,
    plan_defaults: PlanTerms,
}

impl AutoSwitchEngine {
    pub fn new(db: Arc<Database>, plan_defaults: PlanTerms) -> Self {
        Self {
            visibility: StoreVisibility::new(db.clone()),
            history: HistoryRecorder::new(db.clone()),
            db,
            plan_defaults,
        }
    }

    /// Plan terms for a currency, falling back to the configured defaults.
    /// Read on the evaluation's own connection.
    async fn plan_terms(
        &self,
        conn: &mut PgConnection,
        currency: &str,
    ) -> Result<PlanTerms, BillingError> {
        let terms = Database::get_plan_terms(conn, currency).await?;
        Ok(terms.unwrap_or(self.plan_defaults))
    }

    /// Evaluate and apply the next billing state for a merchant.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn evaluate(
        &self,
        merchant_id: Uuid,
        triggered_by: &str,
    ) -> Result<AutoSwitchResult, BillingError> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let merchant = Database::find_merchant(&mut *tx, merchant_id)
            .await?
            .ok_or(BillingError::MerchantNotFound)?;
        let terms = self.plan_terms(&mut *tx, &merchant.currency).await?;
        let existing = Database::lock_subscription(&mut *tx, merchant_id).await?;
        let balance = Database::current_balance(&mut *tx, merchant_id).await?;

        let decision = decide(existing.as_ref(), balance, terms, now);

        let (before, after) = match (decision.transition, existing) {
            (Transition::Provision, _) => {
                let trial = new_trial(merchant_id, terms, now)?;
                match Database::insert_subscription(&mut *tx, &trial).await? {
                    Some(created) => (None, created),
                    None => {
                        // Provisioned by a concurrent evaluation; nothing left to do.
                        let current = Database::lock_subscription(&mut *tx, merchant_id)
                            .await?
                            .ok_or(BillingError::MerchantNotFound)?;
                        return Ok(self.unchanged(&current, "Subscription already provisioned"));
                    }
                }
            }
            (Transition::NoChange, Some(current)) => {
                return Ok(self.unchanged(&current, decision.reason));
            }
            (transition, Some(current)) => {
                let next = apply_transition(&current, transition, decision.reason, now);
                let updated = Database::update_subscription(&mut *tx, &next).await?;
                (Some(current), updated)
            }
            (_, None) => return Err(BillingError::MerchantNotFound),
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to commit auto-switch: {}",
                e
            ))
        })?;

        let action = decision.transition.action();
        let (store_opened, store_closed) = match decision.transition {
            Transition::Reactivate
            | Transition::SwitchToMonthly { .. }
            | Transition::SwitchToDeposit => (self.visibility.reopen(merchant_id).await, false),
            Transition::Suspend => (false, self.visibility.close(merchant_id).await),
            Transition::Provision | Transition::NoChange => (false, false),
        };

        let event_type = match action {
            SwitchAction::Reactivated => HistoryEventType::Reactivated,
            SwitchAction::Suspended => HistoryEventType::Suspended,
            _ => HistoryEventType::AutoSwitched,
        };
        self.history
            .record(NewHistoryEntry {
                merchant_id,
                event_type,
                previous_type: before.as_ref().map(|s| s.parsed_type()),
                new_type: Some(after.parsed_type()),
                previous_status: before.as_ref().map(|s| s.parsed_status()),
                new_status: Some(after.parsed_status()),
                previous_balance: Some(balance),
                new_balance: Some(balance),
                previous_period_end: before.as_ref().and_then(|s| s.current_period_end),
                new_period_end: after.current_period_end,
                reason: decision.reason.to_string(),
                metadata: period_metadata(&after),
                triggered_by: triggered_by.to_string(),
            })
            .await;

        record_auto_switch(action.as_str());
        info!(
            action = action.as_str(),
            reason = decision.reason,
            previous_type = ?before.as_ref().map(|s| s.parsed_type()),
            new_type = %after.parsed_type(),
            new_status = %after.parsed_status(),
            store_opened,
            store_closed,
            triggered_by,
            "Subscription auto-switch applied"
        );

        Ok(AutoSwitchResult {
            action,
            reason: decision.reason.to_string(),
            previous_type: before.as_ref().map(|s| s.parsed_type()),
            previous_status: before.as_ref().map(|s| s.parsed_status()),
            new_type: Some(after.parsed_type()),
            new_status: Some(after.parsed_status()),
            store_opened,
            store_closed,
        })
    }

    fn unchanged(&self, current: &MerchantSubscription, reason: &str) -> AutoSwitchResult {
        record_auto_switch(SwitchAction::NoChange.as_str());
        AutoSwitchResult {
            action: SwitchAction::NoChange,
            reason: reason.to_string(),
            previous_type: Some(current.parsed_type()),
            previous_status: Some(current.parsed_status()),
            new_type: Some(current.parsed_type()),
            new_status: Some(current.parsed_status()),
            store_opened: false,
            store_closed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn terms() -> PlanTerms {
        PlanTerms {
            trial_days: 30,
            grace_period_days: 3,
        }
    }

    fn row(kind: SubscriptionType, status: SubscriptionStatus) -> MerchantSubscription {
        let mut sub = new_trial(Uuid::new_v4(), terms(), Utc::now()).unwrap();
        sub.subscription_type = kind.as_str().to_string();
        sub.status = status.as_str().to_string();
        sub.trial_started_at = None;
        sub.trial_ends_at = None;
        sub
    }

    fn trial_ending_at(end: DateTime<Utc>) -> MerchantSubscription {
        let mut sub = row(SubscriptionType::Trial, SubscriptionStatus::Active);
        sub.trial_started_at = Some(end - Duration::days(30));
        sub.trial_ends_at = Some(end);
        sub
    }

    #[test]
    fn missing_row_is_provisioned_as_trial() {
        let decision = decide(None, Decimal::from(100000), terms(), Utc::now());
        assert_eq!(decision.transition, Transition::Provision);
        assert_eq!(decision.transition.action(), SwitchAction::AutoSwitched);

        let now = Utc::now();
        let trial = new_trial(Uuid::new_v4(), terms(), now).unwrap();
        assert_eq!(trial.parsed_type(), SubscriptionType::Trial);
        assert_eq!(trial.trial_ends_at, Some(now + Duration::days(30)));
    }

    #[test]
    fn grace_boundary_is_inclusive() {
        let end = Utc::now();
        let sub = trial_ending_at(end);
        let at_boundary = end + Duration::days(3);

        let decision = decide(Some(&sub), Decimal::ZERO, terms(), at_boundary);
        assert_eq!(decision.transition, Transition::NoChange);

        let just_after = at_boundary + Duration::seconds(1);
        let decision = decide(Some(&sub), Decimal::ZERO, terms(), just_after);
        assert_eq!(decision.transition, Transition::Suspend);
        assert_eq!(decision.reason, TRIAL_SUSPEND_REASON);
    }

    #[test]
    fn expired_trial_prefers_monthly_then_deposit_then_suspend() {
        let now = Utc::now();
        let mut sub = trial_ending_at(now - Duration::days(10));

        assert_eq!(
            decide(Some(&sub), Decimal::from(50), terms(), now).transition,
            Transition::SwitchToDeposit
        );

        sub.current_period_end = Some(now + Duration::days(5));
        assert_eq!(
            decide(Some(&sub), Decimal::from(50), terms(), now).transition,
            Transition::SwitchToMonthly { clear_trial: true }
        );

        sub.current_period_end = Some(now - Duration::seconds(1));
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::Suspend
        );
    }

    #[test]
    fn trial_without_end_is_left_alone() {
        let sub = row(SubscriptionType::Trial, SubscriptionStatus::Active);
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), Utc::now()).transition,
            Transition::NoChange
        );
    }

    #[test]
    fn suspended_trial_without_funds_falls_through_to_suspend() {
        let now = Utc::now();
        let mut sub = trial_ending_at(now - Duration::days(30));
        sub.status = SubscriptionStatus::Suspended.as_str().to_string();
        sub.suspended_at = Some(now - Duration::days(20));

        let decision = decide(Some(&sub), Decimal::ZERO, terms(), now);
        assert_eq!(decision.transition, Transition::Suspend);
        assert_eq!(decision.reason, TRIAL_SUSPEND_REASON);

        let next = apply_transition(&sub, decision.transition, decision.reason, now);
        assert!(next.is_suspended());
        assert_eq!(next.suspended_at, Some(now - Duration::days(20)));

        let decision = decide(Some(&sub), Decimal::from(1), terms(), now);
        assert_eq!(decision.transition, Transition::SwitchToDeposit);
    }

    #[test]
    fn suspended_trial_reactivates_while_running() {
        let now = Utc::now();
        let mut sub = trial_ending_at(now + Duration::days(1));
        sub.status = SubscriptionStatus::Suspended.as_str().to_string();
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::Reactivate
        );
    }

    #[test]
    fn deposit_rules() {
        let now = Utc::now();
        let mut sub = row(SubscriptionType::Deposit, SubscriptionStatus::Active);

        assert_eq!(
            decide(Some(&sub), Decimal::from(10), terms(), now).transition,
            Transition::NoChange
        );

        let decision = decide(Some(&sub), Decimal::ZERO, terms(), now);
        assert_eq!(decision.transition, Transition::NoChange);
        assert!(decision.reason.contains("nightly"));

        sub.current_period_end = Some(now + Duration::days(2));
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::SwitchToMonthly { clear_trial: false }
        );
    }

    #[test]
    fn suspended_deposit_reactivates_on_top_up() {
        let sub = row(SubscriptionType::Deposit, SubscriptionStatus::Suspended);
        let decision = decide(Some(&sub), Decimal::from(50), terms(), Utc::now());
        assert_eq!(decision.transition, Transition::Reactivate);
        assert_eq!(decision.transition.action(), SwitchAction::Reactivated);
    }

    #[test]
    fn monthly_is_never_changed_while_active() {
        let now = Utc::now();
        let mut sub = row(SubscriptionType::Monthly, SubscriptionStatus::Active);
        sub.current_period_end = Some(now - Duration::days(1));
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::NoChange
        );
    }

    #[test]
    fn suspended_monthly_reactivates_with_live_period() {
        let now = Utc::now();
        let mut sub = row(SubscriptionType::Monthly, SubscriptionStatus::Suspended);
        sub.current_period_end = Some(now + Duration::days(1));
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::Reactivate
        );

        sub.current_period_end = Some(now - Duration::days(1));
        assert_eq!(
            decide(Some(&sub), Decimal::ZERO, terms(), now).transition,
            Transition::NoChange
        );
    }

    #[test]
    fn applying_transitions() {
        let now = Utc::now();
        let mut sub = trial_ending_at(now - Duration::days(10));
        sub.status = SubscriptionStatus::Suspended.as_str().to_string();
        sub.suspended_at = Some(now - Duration::days(5));
        sub.suspend_reason = Some(TRIAL_SUSPEND_REASON.to_string());

        let monthly = apply_transition(
            &sub,
            Transition::SwitchToMonthly { clear_trial: true },
            "x",
            now,
        );
        assert_eq!(monthly.parsed_type(), SubscriptionType::Monthly);
        assert_eq!(monthly.parsed_status(), SubscriptionStatus::Active);
        assert!(monthly.trial_ends_at.is_none());
        assert!(monthly.suspended_at.is_none());

        let deposit = apply_transition(&sub, Transition::SwitchToDeposit, "x", now);
        assert_eq!(deposit.parsed_type(), SubscriptionType::Deposit);
        assert!(deposit.trial_ends_at.is_some());
        assert!(deposit.suspend_reason.is_none());

        let active = trial_ending_at(now - Duration::days(10));
        let suspended = apply_transition(&active, Transition::Suspend, "gone", now);
        assert!(suspended.is_suspended());
        assert_eq!(suspended.suspended_at, Some(now));
        assert_eq!(suspended.suspend_reason.as_deref(), Some("gone"));
    }

    #[test]
    fn oversized_plan_lengths_do_not_overflow() {
        let now = Utc::now();
        let huge = PlanTerms {
            trial_days: i64::from(i32::MAX),
            grace_period_days: i64::from(i32::MAX),
        };

        let sub = trial_ending_at(now - Duration::days(10));
        let decision = decide(Some(&sub), Decimal::ZERO, huge, now);
        assert_eq!(decision.transition, Transition::NoChange);

        let err = new_trial(Uuid::new_v4(), huge, now).unwrap_err();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }
}
