//! Billing-period comparison and trial-window expiry.

use crate::models::{
    ActionCounts, ActionType, BillingCadence, EntitlementState, PlanTier, TrialWindow,
    UsageSnapshot,
};
use chrono::{DateTime, Months, Utc};
use tracing::{info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The ledger owns period boundaries; a missing previous snapshot counts as a new period.
pub fn same_period(previous: Option<&UsageSnapshot>, next: &UsageSnapshot) -> bool {
    previous.is_some_and(|prev| prev.period_start == next.period_start)
}

/// Plan allowances are monthly, so a snapshot stops describing the current
/// period one month after it started, whatever day the period is anchored on.
pub fn period_elapsed(snapshot: &UsageSnapshot, now: DateTime<Utc>) -> bool {
    snapshot
        .period_start
        .checked_add_months(Months::new(1))
        .is_some_and(|end| now.date_naive() >= end)
}

/// Actions performed since `previous`. Counters that went backwards inside a
/// period yield zero rather than a negative delta.
pub fn usage_delta(previous: Option<&UsageSnapshot>, next: &UsageSnapshot) -> ActionCounts {
    let Some(prev) = previous.filter(|_| same_period(previous, next)) else {
        return next.counts;
    };

    let mut delta = ActionCounts::default();
    for action in ActionType::ALL {
        let before = prev.counts.get(action);
        let after = next.counts.get(action);
        if after < before {
            warn!(
                %action,
                before,
                after,
                period_start = %next.period_start,
                "usage counter went backwards inside one period; ignoring"
            );
        }
        delta.set(action, after.saturating_sub(before));
    }
    delta
}

pub fn trial_active(trial: &TrialWindow, now: DateTime<Utc>) -> bool {
    now < trial.ends_at
}

pub fn trial_remaining(trial: &TrialWindow, action: ActionType, now: DateTime<Utc>) -> u64 {
    if !trial_active(trial, now) {
        return 0;
    }
    trial.grants.get(action).saturating_sub(trial.used.get(action))
}

pub fn trial_remaining_all(trial: &TrialWindow, now: DateTime<Utc>) -> ActionCounts {
    let mut out = ActionCounts::default();
    for action in ActionType::ALL {
        out.set(action, trial_remaining(trial, action, now));
    }
    out
}

/// Whole days left in the trial, rounded up. Zero once expired.
pub fn trial_days_left(trial: &TrialWindow, now: DateTime<Utc>) -> i64 {
    if !trial_active(trial, now) {
        return 0;
    }
    let secs = (trial.ends_at - now).num_seconds();
    (secs + 86_399) / 86_400
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialExpiry {
    /// The trial-granted plan was forced back to a monthly base plan.
    pub downgraded: bool,
}

/// Applies the one-way active→expired transition. Returns `Some` only the
/// first time it fires for this state; the caller must persist the result.
pub fn apply_trial_expiry(state: &mut EntitlementState, now: DateTime<Utc>) -> Option<TrialExpiry> {
    if trial_active(&state.trial, now) || state.trial_expiry_applied {
        return None;
    }

    let downgraded = state.trial_plan;
    if downgraded {
        state.plan_tier = PlanTier::Base;
        state.billing_cadence = BillingCadence::Monthly;
        state.trial_plan = false;
    }
    state.trial_expiry_applied = true;

    info!(
        user_id = %state.user_id,
        downgraded,
        ended_at = %state.trial.ends_at,
        "trial window expired"
    );
    Some(TrialExpiry { downgraded })
}
