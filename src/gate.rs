//! Two-phase check run immediately before a metered action: a local
//! pre-check that can short-circuit, then the backend's authoritative
//! `consume_action`. The backend answer always wins over local state.

use crate::error::AppError;
use crate::limits::{ai_blocked, is_limit_reached, LimitInputs};
use crate::models::{ActionCounts, ActionType, ConsumeRequest};
use crate::remote::EntitlementBackend;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialSource {
    /// Local pre-check; the backend was never called.
    Local,
    /// The backend said no.
    Remote,
    /// The backend could not be reached or did not answer in time.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub action: ActionType,
    pub reason: Option<String>,
    pub source: DenialSource,
    pub ai_blocked: bool,
}

impl QuotaExceeded {
    pub fn call_to_action(&self) -> String {
        if self.ai_blocked {
            return "Upgrade your plan to use AI features.".into();
        }
        match self.source {
            DenialSource::Unreachable => "Check your connection and try again.".into(),
            DenialSource::Local | DenialSource::Remote => format!(
                "Buy more {} credits or wait for your plan to renew.",
                self.action
            ),
        }
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} not allowed: {}", self.action, reason),
            None => write!(f, "{} limit reached", self.action),
        }
    }
}

/// What the backend granted and which credit sources paid for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    pub action: ActionType,
    pub quantity: u64,
    pub used_plan: u64,
    pub used_trial: u64,
    pub used_addon: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Allowed(Authorization),
    Denied(QuotaExceeded),
}

/// Result of running an action behind the gate.
#[derive(Debug)]
pub enum Gated<T> {
    Completed {
        value: T,
        authorization: Authorization,
    },
    Denied(QuotaExceeded),
}

pub struct ActionGate<'a> {
    backend: &'a dyn EntitlementBackend,
    consume_timeout: Duration,
}

impl<'a> ActionGate<'a> {
    pub fn new(backend: &'a dyn EntitlementBackend, consume_timeout: Duration) -> Self {
        Self {
            backend,
            consume_timeout,
        }
    }

    pub fn precheck(
        action: ActionType,
        inputs: &LimitInputs<'_>,
        allowance: &ActionCounts,
    ) -> Option<QuotaExceeded> {
        if !is_limit_reached(action, inputs, allowance) {
            return None;
        }
        let blocked = action.requires_ai() && ai_blocked(inputs.plan_tier, inputs.ai_disabled);
        Some(QuotaExceeded {
            action,
            reason: None,
            source: DenialSource::Local,
            ai_blocked: blocked,
        })
    }

    /// Fails closed: a transport error or timeout on `consume_action` denies.
    pub async fn authorize(
        &self,
        user_id: &str,
        request: ConsumeRequest,
        inputs: &LimitInputs<'_>,
        allowance: &ActionCounts,
    ) -> Result<GateOutcome, AppError> {
        if request.quantity == 0 {
            return Err(AppError::InvalidQuantity);
        }
        let action = request.action_type;

        if let Some(denied) = Self::precheck(action, inputs, allowance) {
            info!(%action, ai_blocked = denied.ai_blocked, "blocked by local pre-check");
            return Ok(GateOutcome::Denied(denied));
        }

        let call = self.backend.consume_action(user_id, request);
        let response = match tokio::time::timeout(self.consume_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(%action, backend = self.backend.name(), error = %e, "consume failed; denying");
                return Ok(GateOutcome::Denied(QuotaExceeded {
                    action,
                    reason: Some(format!("could not reach the entitlement service ({e})")),
                    source: DenialSource::Unreachable,
                    ai_blocked: false,
                }));
            }
            Err(_) => {
                warn!(%action, timeout = ?self.consume_timeout, "consume timed out; denying");
                return Ok(GateOutcome::Denied(QuotaExceeded {
                    action,
                    reason: Some("the entitlement service did not answer in time".into()),
                    source: DenialSource::Unreachable,
                    ai_blocked: false,
                }));
            }
        };

        if !response.allowed {
            info!(%action, reason = ?response.reason, "backend denied action");
            return Ok(GateOutcome::Denied(QuotaExceeded {
                action,
                reason: response.reason,
                source: DenialSource::Remote,
                ai_blocked: false,
            }));
        }

        Ok(GateOutcome::Allowed(Authorization {
            action,
            quantity: request.quantity,
            used_plan: response.used_plan.unwrap_or(0),
            used_trial: response.used_trial.unwrap_or(0),
            used_addon: response.used_addon.unwrap_or(0),
        }))
    }
}
