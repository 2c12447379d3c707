use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A metered operation. Every pool and counter is keyed by one of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Import,
    Translation,
    Optimization,
    AiMessage,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::Import,
        ActionType::Translation,
        ActionType::Optimization,
        ActionType::AiMessage,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            ActionType::Import => "import",
            ActionType::Translation => "translation",
            ActionType::Optimization => "optimization",
            ActionType::AiMessage => "ai_message",
        }
    }

    pub fn requires_ai(self) -> bool {
        !matches!(self, ActionType::Import)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "import" => Ok(ActionType::Import),
            "translation" => Ok(ActionType::Translation),
            "optimization" => Ok(ActionType::Optimization),
            "ai_message" | "message" => Ok(ActionType::AiMessage),
            other => Err(format!(
                "Unknown action '{other}'. Use import, translation, optimization, or ai_message."
            )),
        }
    }
}

/// One value per action type. Serializes as a map keyed by the snake_case label.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionCounts {
    #[serde(default)]
    pub import: u64,
    #[serde(default)]
    pub translation: u64,
    #[serde(default)]
    pub optimization: u64,
    #[serde(default)]
    pub ai_message: u64,
}

impl ActionCounts {
    pub fn new(import: u64, translation: u64, optimization: u64, ai_message: u64) -> Self {
        Self {
            import,
            translation,
            optimization,
            ai_message,
        }
    }

    pub fn get(&self, action: ActionType) -> u64 {
        match action {
            ActionType::Import => self.import,
            ActionType::Translation => self.translation,
            ActionType::Optimization => self.optimization,
            ActionType::AiMessage => self.ai_message,
        }
    }

    pub fn get_mut(&mut self, action: ActionType) -> &mut u64 {
        match action {
            ActionType::Import => &mut self.import,
            ActionType::Translation => &mut self.translation,
            ActionType::Optimization => &mut self.optimization,
            ActionType::AiMessage => &mut self.ai_message,
        }
    }

    pub fn set(&mut self, action: ActionType, value: u64) {
        *self.get_mut(action) = value;
    }
}

/// Cumulative actions in the current billing period, as reported by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub period_start: NaiveDate,
    pub counts: ActionCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrialWindow {
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub grants: ActionCounts,
    pub used: ActionCounts,
}

impl TrialWindow {
    pub fn start(now: DateTime<Utc>, days: i64, grants: ActionCounts) -> Self {
        Self {
            started_at: now,
            ends_at: now + chrono::Duration::days(days),
            grants,
            used: ActionCounts::default(),
        }
    }
}

/// Purchased credits. Never time-boxed and never reset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddonPool {
    pub balances: ActionCounts,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    AiDisabled,
    #[default]
    Base,
    Premium,
}

impl PlanTier {
    pub fn as_label(self) -> &'static str {
        match self {
            PlanTier::AiDisabled => "ai_disabled",
            PlanTier::Base => "base",
            PlanTier::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Canceled,
    Expired,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BillingCadence {
    #[default]
    Monthly,
    Yearly,
}

/// Everything the engine knows about one user. This is also the persisted profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitlementState {
    pub user_id: String,
    pub plan_tier: PlanTier,
    #[serde(default)]
    pub ai_disabled: bool,
    #[serde(default)]
    pub subscription_status: SubscriptionStatus,
    #[serde(default)]
    pub billing_cadence: BillingCadence,
    /// The current tier was granted by the trial rather than bought.
    #[serde(default)]
    pub trial_plan: bool,
    /// Set once the expiry downgrade has been persisted.
    #[serde(default)]
    pub trial_expiry_applied: bool,
    pub trial: TrialWindow,
    #[serde(default)]
    pub addons: AddonPool,
    /// The snapshot the pools were last drained against.
    #[serde(default)]
    pub reconciled_snapshot: Option<UsageSnapshot>,
    /// Usage in the reconciled period that no pool covered, charged to the plan allowance.
    #[serde(default)]
    pub plan_used: ActionCounts,
}

impl EntitlementState {
    pub fn new_profile(user_id: &str, trial: TrialWindow) -> Self {
        Self {
            user_id: user_id.to_string(),
            plan_tier: PlanTier::Base,
            ai_disabled: false,
            subscription_status: SubscriptionStatus::Active,
            billing_cadence: BillingCadence::Monthly,
            trial_plan: true,
            trial_expiry_applied: false,
            trial,
            addons: AddonPool::default(),
            reconciled_snapshot: None,
            plan_used: ActionCounts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub action_type: ActionType,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub action_type: ActionType,
    pub quantity: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumeResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_trial: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_addon: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_plan: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_type_parses_labels_and_aliases() {
        assert_eq!("Import".parse::<ActionType>(), Ok(ActionType::Import));
        assert_eq!("ai-message".parse::<ActionType>(), Ok(ActionType::AiMessage));
        assert_eq!("message".parse::<ActionType>(), Ok(ActionType::AiMessage));
        assert!("export".parse::<ActionType>().is_err());
    }

    #[test]
    fn only_import_runs_without_ai() {
        assert!(!ActionType::Import.requires_ai());
        assert!(ActionType::Translation.requires_ai());
        assert!(ActionType::Optimization.requires_ai());
        assert!(ActionType::AiMessage.requires_ai());
    }

    #[test]
    fn snapshot_decodes_partial_counts() {
        let snap: UsageSnapshot = serde_json::from_value(json!({
            "period_start": "2026-10-01",
            "counts": { "import": 4, "ai_message": 12 }
        }))
        .expect("snapshot should decode");
        assert_eq!(snap.counts.get(ActionType::Import), 4);
        assert_eq!(snap.counts.get(ActionType::Translation), 0);
        assert_eq!(snap.counts.get(ActionType::AiMessage), 12);
    }

    #[test]
    fn consume_response_omits_missing_attribution() {
        let body = serde_json::to_value(ConsumeResponse {
            allowed: false,
            reason: Some("limit".into()),
            ..Default::default()
        })
        .expect("encode");
        assert_eq!(body, json!({ "allowed": false, "reason": "limit" }));
    }
}
