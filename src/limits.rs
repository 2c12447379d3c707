use crate::models::{ActionCounts, ActionType, EntitlementState, PlanTier, UsageSnapshot};
use crate::period::{period_elapsed, trial_active, trial_remaining_all};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monthly actions a tier includes without drawing on any pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanAllowance {
    pub tier: PlanTier,
    pub monthly: ActionCounts,
}

pub fn built_in_allowances() -> Vec<PlanAllowance> {
    vec![
        PlanAllowance {
            tier: PlanTier::AiDisabled,
            monthly: ActionCounts::new(5, 0, 0, 0),
        },
        PlanAllowance {
            tier: PlanTier::Base,
            monthly: ActionCounts::new(5, 5, 3, 30),
        },
        PlanAllowance {
            tier: PlanTier::Premium,
            monthly: ActionCounts::new(100, 100, 50, 1000),
        },
    ]
}

pub fn resolve_allowance(tier: PlanTier, overrides: &[PlanAllowance]) -> ActionCounts {
    overrides
        .iter()
        .chain(built_in_allowances().iter())
        .find(|a| a.tier == tier)
        .map(|a| a.monthly)
        .unwrap_or_default()
}

pub fn ai_blocked(plan_tier: PlanTier, ai_disabled: bool) -> bool {
    ai_disabled || plan_tier == PlanTier::AiDisabled
}

/// Everything the local pre-check looks at.
#[derive(Debug, Clone, Copy)]
pub struct LimitInputs<'a> {
    pub plan_tier: PlanTier,
    pub ai_disabled: bool,
    /// Current-period usage; `None` when no snapshot covers the current period.
    pub usage: Option<&'a UsageSnapshot>,
    /// Current-period usage already charged to the plan allowance.
    pub plan_used: ActionCounts,
    pub trial_active: bool,
    pub addon_balance: ActionCounts,
    pub trial_remaining: ActionCounts,
}

impl<'a> LimitInputs<'a> {
    pub fn from_state(state: &'a EntitlementState, now: DateTime<Utc>) -> Self {
        let usage = state
            .reconciled_snapshot
            .as_ref()
            .filter(|snapshot| !period_elapsed(snapshot, now));
        Self {
            plan_tier: state.plan_tier,
            ai_disabled: state.ai_disabled,
            usage,
            plan_used: if usage.is_some() {
                state.plan_used
            } else {
                ActionCounts::default()
            },
            trial_active: trial_active(&state.trial, now),
            addon_balance: state.addons.balances,
            trial_remaining: trial_remaining_all(&state.trial, now),
        }
    }
}

/// Capacity left per credit source for one action type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub ai_blocked: bool,
    pub plan: u64,
    pub trial: u64,
    pub addon: u64,
}

impl Availability {
    pub fn total(&self) -> u64 {
        if self.ai_blocked {
            return 0;
        }
        self.plan
            .saturating_add(self.trial)
            .saturating_add(self.addon)
    }
}

pub fn availability(action: ActionType, inputs: &LimitInputs<'_>, allowance: &ActionCounts) -> Availability {
    Availability {
        ai_blocked: action.requires_ai() && ai_blocked(inputs.plan_tier, inputs.ai_disabled),
        plan: allowance.get(action).saturating_sub(inputs.plan_used.get(action)),
        trial: if inputs.trial_active {
            inputs.trial_remaining.get(action)
        } else {
            0
        },
        addon: inputs.addon_balance.get(action),
    }
}

/// Advisory local check. First matching rule wins: AI block, unexhausted
/// plan allowance, live trial credits, add-on credits.
pub fn is_limit_reached(action: ActionType, inputs: &LimitInputs<'_>, allowance: &ActionCounts) -> bool {
    if action.requires_ai() && ai_blocked(inputs.plan_tier, inputs.ai_disabled) {
        return true;
    }
    let avail = availability(action, inputs, allowance);
    if avail.plan > 0 {
        return false;
    }
    if inputs.trial_active && inputs.trial_remaining.get(action) > 0 {
        return false;
    }
    avail.addon == 0
}

/// Splits `quantity` into `(plan, trial, addon)` shares, spending trial, then
/// add-on, then plan allowance: the order reconciliation later drains in.
/// Returns `None` when the sources cannot cover the full quantity.
pub fn attribute(avail: &Availability, quantity: u64) -> Option<(u64, u64, u64)> {
    if avail.ai_blocked || avail.total() < quantity {
        return None;
    }
    let trial = quantity.min(avail.trial);
    let addon = (quantity - trial).min(avail.addon);
    let plan = quantity - trial - addon;
    Some((plan, trial, addon))
}
