use crate::models::{ActionCounts, ActionType, AddonPool, EntitlementState, TrialWindow, UsageSnapshot};
use crate::period::{same_period, trial_active, usage_delta};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Where one action type's delta went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drain {
    pub from_trial: u64,
    pub from_addon: u64,
    /// Covered by the plan allowance; no pool was touched.
    pub absorbed: u64,
}

/// Drains `delta` for one action type: trial pool first, then add-on credits.
pub fn drain(
    action: ActionType,
    delta: u64,
    trial: &mut TrialWindow,
    addons: &mut AddonPool,
    trial_active: bool,
) -> Drain {
    let mut out = Drain::default();
    if delta == 0 {
        return out;
    }

    let mut left = delta;
    if trial_active {
        let remaining = trial.grants.get(action).saturating_sub(trial.used.get(action));
        let consumed = left.min(remaining);
        *trial.used.get_mut(action) += consumed;
        out.from_trial = consumed;
        left -= consumed;
    }

    let balance = addons.balances.get(action);
    let consumed = left.min(balance);
    addons.balances.set(action, balance - consumed);
    out.from_addon = consumed;
    out.absorbed = left - consumed;
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub state: EntitlementState,
    pub delta: ActionCounts,
    pub from_trial: ActionCounts,
    pub from_addon: ActionCounts,
    pub absorbed: ActionCounts,
}

impl Reconciliation {
    /// True when a pool balance moved and the profile needs an upsert.
    pub fn pools_changed(&self) -> bool {
        self.from_trial != ActionCounts::default() || self.from_addon != ActionCounts::default()
    }
}

/// Drains usage observed since the state's last reconciled snapshot and
/// records `next` as the new baseline. Whatever the pools cannot cover is
/// charged to `plan_used`, which restarts with each period. Re-running with
/// the same `next` is a no-op.
pub fn reconcile(state: &EntitlementState, next: &UsageSnapshot, now: DateTime<Utc>) -> Reconciliation {
    let previous = state.reconciled_snapshot.as_ref();
    let delta = usage_delta(previous, next);
    let active = trial_active(&state.trial, now);

    let mut out = state.clone();
    if !same_period(previous, next) {
        out.plan_used = ActionCounts::default();
    }
    let mut from_trial = ActionCounts::default();
    let mut from_addon = ActionCounts::default();
    let mut absorbed = ActionCounts::default();

    for action in ActionType::ALL {
        let drained = drain(action, delta.get(action), &mut out.trial, &mut out.addons, active);
        from_trial.set(action, drained.from_trial);
        from_addon.set(action, drained.from_addon);
        absorbed.set(action, drained.absorbed);
        *out.plan_used.get_mut(action) += drained.absorbed;
        if delta.get(action) > 0 {
            debug!(
                %action,
                delta = delta.get(action),
                from_trial = drained.from_trial,
                from_addon = drained.from_addon,
                absorbed = drained.absorbed,
                "reconciled usage"
            );
        }
    }
    out.reconciled_snapshot = Some(next.clone());

    Reconciliation {
        state: out,
        delta,
        from_trial,
        from_addon,
        absorbed,
    }
}
