use crate::error::AppError;
use crate::gate::{ActionGate, GateOutcome, Gated};
use crate::limits::{availability, is_limit_reached, resolve_allowance, Availability, LimitInputs, PlanAllowance};
use crate::models::{
    ActionCounts, ActionType, BillingCadence, ConsumeRequest, EntitlementState, PlanTier,
    SubscriptionStatus, TrialWindow,
};
use crate::period::{apply_trial_expiry, trial_active, trial_days_left, Clock};
use crate::purchase::{credit_addon, record_purchase, PurchaseReceipt};
use crate::reconcile::reconcile;
use crate::remote::{upsert_with_retry, EntitlementBackend, RetryPolicy};
use crate::settings::AppConfig;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub allowances: Vec<PlanAllowance>,
    pub trial_days: i64,
    pub trial_grants: ActionCounts,
    pub retry: RetryPolicy,
    pub consume_timeout: Duration,
}

impl ServiceOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            allowances: cfg.plan_allowances.clone(),
            trial_days: cfg.trial.days,
            trial_grants: cfg.trial.grants,
            retry: cfg.retry_policy(),
            consume_timeout: cfg.consume_timeout(),
        }
    }
}

/// Shown once per session after the trial window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialExpiredNotice {
    pub ended_at: DateTime<Utc>,
    /// The trial-granted plan was downgraded during this check.
    pub downgraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionStatus {
    pub action: ActionType,
    pub used_this_period: u64,
    pub plan_allowance: u64,
    pub trial_remaining: u64,
    pub addon_balance: u64,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub user_id: String,
    pub plan_tier: PlanTier,
    pub ai_disabled: bool,
    pub subscription_status: SubscriptionStatus,
    pub billing_cadence: BillingCadence,
    pub trial_active: bool,
    pub trial_days_left: i64,
    pub trial_ends_at: DateTime<Utc>,
    pub period_start: Option<NaiveDate>,
    pub actions: Vec<ActionStatus>,
}

struct Session {
    state: EntitlementState,
    /// Bumped on every local mutation so a commit knows whether it is still current.
    version: u64,
    dirty: bool,
    /// The trial-expiry downgrade fired during this session.
    expiry_downgraded: bool,
    expiry_notice_shown: bool,
}

impl Session {
    /// Applies the one-shot trial-expiry transition if it is due.
    fn expire_trial(&mut self, now: DateTime<Utc>) -> bool {
        let Some(fired) = apply_trial_expiry(&mut self.state, now) else {
            return false;
        };
        self.version += 1;
        self.dirty = true;
        self.expiry_downgraded |= fired.downgraded;
        true
    }
}

struct Inner {
    backend: Arc<dyn EntitlementBackend>,
    clock: Arc<dyn Clock>,
    options: ServiceOptions,
    user_id: String,
    session: Mutex<Session>,
    /// Serializes upserts so the last one to land carries the newest state.
    commit_lock: AsyncMutex<()>,
    pending_refresh: Mutex<Option<JoinHandle<()>>>,
}

/// Entitlements for one signed-in user. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct EntitlementService {
    inner: Arc<Inner>,
}

impl EntitlementService {
    /// Loads the user's profile, creating and persisting a trial on first sign-in,
    /// then pulls a first usage snapshot.
    pub async fn sign_in(
        backend: Arc<dyn EntitlementBackend>,
        clock: Arc<dyn Clock>,
        user_id: &str,
        options: ServiceOptions,
    ) -> Result<Self, AppError> {
        let state = match backend.load_profile(user_id).await? {
            Some(existing) => existing,
            None => {
                let trial = TrialWindow::start(clock.now(), options.trial_days, options.trial_grants);
                let fresh = EntitlementState::new_profile(user_id, trial);
                upsert_with_retry(backend.as_ref(), &fresh, options.retry).await?;
                info!(user_id, ends_at = %fresh.trial.ends_at, "created profile with trial");
                fresh
            }
        };

        let service = Self {
            inner: Arc::new(Inner {
                backend,
                clock,
                options,
                user_id: user_id.to_string(),
                session: Mutex::new(Session {
                    state,
                    version: 0,
                    dirty: false,
                    expiry_downgraded: false,
                    expiry_notice_shown: false,
                }),
                commit_lock: AsyncMutex::new(()),
                pending_refresh: Mutex::new(None),
            }),
        };
        service.refresh_usage().await?;
        Ok(service)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Locks the session with any due trial expiry already applied. The
    /// transition is persisted by the next commit.
    fn session_at(&self, now: DateTime<Utc>) -> MutexGuard<'_, Session> {
        let mut session = self.session();
        session.expire_trial(now);
        session
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn backend(&self) -> &dyn EntitlementBackend {
        self.inner.backend.as_ref()
    }

    pub fn state(&self) -> EntitlementState {
        self.session().state.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.session().dirty
    }

    fn allowance(&self, tier: PlanTier) -> ActionCounts {
        resolve_allowance(tier, &self.inner.options.allowances)
    }

    /// Pushes the current state to the backend. The in-memory state stays
    /// authoritative for display even when this fails.
    async fn commit(&self) -> Result<(), AppError> {
        let _serial = self.inner.commit_lock.lock().await;
        let (state, version) = {
            let session = self.session();
            (session.state.clone(), session.version)
        };

        let result = upsert_with_retry(self.backend(), &state, self.inner.options.retry).await;
        let mut session = self.session();
        match result {
            Ok(()) => {
                if session.version == version {
                    session.dirty = false;
                }
                Ok(())
            }
            Err(e) => {
                session.dirty = true;
                Err(e)
            }
        }
    }

    /// Fetches the latest snapshot and drains new usage from the pools.
    /// A failed fetch keeps the previous snapshot and returns `Ok(false)`.
    pub async fn refresh_usage(&self) -> Result<bool, AppError> {
        let fetched = self.backend().fetch_usage_snapshot(self.user_id()).await;

        let now = self.now();
        let (fresh, needs_commit) = {
            let mut session = self.session_at(now);
            let fresh = match fetched {
                Ok(snapshot) => {
                    // Diff against whatever is stored now, not what was stored before the fetch.
                    let outcome = reconcile(&session.state, &snapshot, now);
                    if session.state.reconciled_snapshot.as_ref() != Some(&snapshot) {
                        if outcome.pools_changed() {
                            debug!(
                                period_start = %snapshot.period_start,
                                delta = ?outcome.delta,
                                from_trial = ?outcome.from_trial,
                                from_addon = ?outcome.from_addon,
                                "drained usage from credit pools"
                            );
                        }
                        session.state = outcome.state;
                        session.version += 1;
                        session.dirty = true;
                    }
                    true
                }
                Err(e) => {
                    warn!(user_id = self.user_id(), error = %e, "usage refresh failed; keeping last snapshot");
                    false
                }
            };
            (fresh, session.dirty)
        };

        if needs_commit {
            self.commit().await?;
        }
        Ok(fresh)
    }

    /// Applies the trial-expiry transition if due and returns a notice the
    /// first time this session sees an expired trial.
    pub async fn check_trial_expiry(&self) -> Result<Option<TrialExpiredNotice>, AppError> {
        let now = self.now();
        let (fired, notice) = {
            let mut session = self.session();
            let fired = session.expire_trial(now);
            let expired = !trial_active(&session.state.trial, now);
            let notice = (expired && !session.expiry_notice_shown).then(|| TrialExpiredNotice {
                ended_at: session.state.trial.ends_at,
                downgraded: session.expiry_downgraded,
            });
            if notice.is_some() {
                session.expiry_notice_shown = true;
            }
            (fired, notice)
        };

        if fired {
            self.commit().await?;
        }
        Ok(notice)
    }

    pub fn availability(&self, action: ActionType) -> Availability {
        let now = self.now();
        let session = self.session_at(now);
        let allowance = self.allowance(session.state.plan_tier);
        availability(action, &LimitInputs::from_state(&session.state, now), &allowance)
    }

    /// Local, advisory answer. Use [`EntitlementService::perform`] to actually gate an action.
    pub fn is_limit_reached(&self, action: ActionType) -> bool {
        let now = self.now();
        let session = self.session_at(now);
        let allowance = self.allowance(session.state.plan_tier);
        is_limit_reached(action, &LimitInputs::from_state(&session.state, now), &allowance)
    }

    pub async fn authorize(&self, action: ActionType, quantity: u64) -> Result<GateOutcome, AppError> {
        let now = self.now();
        let state = self.session_at(now).state.clone();
        let allowance = self.allowance(state.plan_tier);
        let inputs = LimitInputs::from_state(&state, now);
        let gate = ActionGate::new(self.backend(), self.inner.options.consume_timeout);
        gate.authorize(
            self.user_id(),
            ConsumeRequest {
                action_type: action,
                quantity,
            },
            &inputs,
            &allowance,
        )
        .await
    }

    /// Gates `run` behind an authorization. Once the backend allows the action
    /// the credit is spent, whether or not `run` succeeds; a usage refresh is
    /// scheduled in the background either way.
    pub async fn perform<T, F, Fut>(
        &self,
        action: ActionType,
        quantity: u64,
        run: F,
    ) -> Result<Gated<T>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let authorization = match self.authorize(action, quantity).await? {
            GateOutcome::Allowed(authorization) => authorization,
            GateOutcome::Denied(denied) => return Ok(Gated::Denied(denied)),
        };

        let result = run().await;
        self.schedule_refresh();
        let value = result?;
        Ok(Gated::Completed {
            value,
            authorization,
        })
    }

    /// Starts a background snapshot refresh; it does not block the caller.
    pub fn schedule_refresh(&self) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = service.refresh_usage().await {
                warn!(user_id = service.user_id(), error = %e, "background refresh failed");
            }
        });
        let mut pending = self
            .inner
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = Some(handle);
    }

    /// Waits for the most recently scheduled refresh, if any.
    pub async fn settle(&self) {
        let handle = self
            .inner
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "refresh task did not finish");
            }
        }
    }

    /// Credits the session's own add-on balance, so usage drained but not yet
    /// persisted is kept, then commits and appends the purchase record.
    pub async fn purchase(&self, action: ActionType, quantity: u64) -> Result<PurchaseReceipt, AppError> {
        let addons = {
            let mut session = self.session();
            let balance = credit_addon(&mut session.state.addons, action, quantity)?;
            session.version += 1;
            session.dirty = true;
            debug!(%action, quantity, balance, "credited add-on balance");
            session.state.addons
        };

        self.commit().await?;
        let record = record_purchase(self.backend(), self.user_id(), action, quantity, self.now()).await?;
        Ok(PurchaseReceipt { record, addons })
    }

    pub fn status(&self) -> StatusReport {
        let now = self.now();
        let session = self.session_at(now);
        let state = &session.state;
        let allowance = self.allowance(state.plan_tier);
        let inputs = LimitInputs::from_state(state, now);

        let actions = ActionType::ALL
            .iter()
            .map(|&action| {
                let avail = availability(action, &inputs, &allowance);
                ActionStatus {
                    action,
                    used_this_period: inputs.usage.map(|u| u.counts.get(action)).unwrap_or(0),
                    plan_allowance: allowance.get(action),
                    trial_remaining: avail.trial,
                    addon_balance: avail.addon,
                    blocked: is_limit_reached(action, &inputs, &allowance),
                }
            })
            .collect();

        StatusReport {
            user_id: state.user_id.clone(),
            plan_tier: state.plan_tier,
            ai_disabled: state.ai_disabled,
            subscription_status: state.subscription_status,
            billing_cadence: state.billing_cadence,
            trial_active: inputs.trial_active,
            trial_days_left: trial_days_left(&state.trial, now),
            trial_ends_at: state.trial.ends_at,
            period_start: state.reconciled_snapshot.as_ref().map(|s| s.period_start),
            actions,
        }
    }

    /// Ends the session, flushing unsaved state on a best-effort basis.
    pub async fn sign_out(self) {
        self.settle().await;
        if self.is_dirty() {
            if let Err(e) = self.commit().await {
                warn!(user_id = self.user_id(), error = %e, "could not flush entitlements on sign-out");
            }
        }
    }
}
