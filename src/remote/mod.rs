use crate::error::AppError;
use crate::models::{ConsumeRequest, ConsumeResponse, EntitlementState, PurchaseRecord, UsageSnapshot};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

pub mod http;

/// The system of record for one user's entitlements. Local state is only a cache of this.
#[async_trait]
pub trait EntitlementBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_usage_snapshot(&self, user_id: &str) -> Result<UsageSnapshot, AppError>;

    /// Authoritative check-and-commit. Once this returns `allowed`, the credit is spent.
    async fn consume_action(
        &self,
        user_id: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeResponse, AppError>;

    async fn load_profile(&self, user_id: &str) -> Result<Option<EntitlementState>, AppError>;

    /// Idempotent upsert keyed by `state.user_id`.
    async fn upsert_profile(&self, state: &EntitlementState) -> Result<(), AppError>;

    async fn append_purchase(&self, user_id: &str, record: &PurchaseRecord) -> Result<(), AppError>;

    async fn list_purchases(&self, user_id: &str) -> Result<Vec<PurchaseRecord>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

/// Upserts with bounded retry on transient failures. Exhausted retries
/// surface as `PersistenceConflict`.
pub async fn upsert_with_retry(
    backend: &dyn EntitlementBackend,
    state: &EntitlementState,
    policy: RetryPolicy,
) -> Result<(), AppError> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match backend.upsert_profile(state).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                warn!(
                    backend = backend.name(),
                    user_id = %state.user_id,
                    attempt,
                    error = %e,
                    "profile upsert failed"
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(AppError::PersistenceConflict(last_error))
}

#[cfg(test)]
pub mod fake {
    //! In-memory backend for engine tests.

    use super::*;
    use crate::models::{ActionCounts, ActionType};
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeState {
        pub profile: Option<EntitlementState>,
        pub snapshot: Option<UsageSnapshot>,
        pub consume_replies: VecDeque<Result<ConsumeResponse, AppError>>,
        pub consume_calls: Vec<ConsumeRequest>,
        pub upsert_failures: u32,
        pub upserts: u32,
        pub purchases: Vec<PurchaseRecord>,
        pub fail_fetch: bool,
        pub consume_delay: Option<Duration>,
        /// Delays the next upsert only.
        pub upsert_delay: Option<Duration>,
    }

    #[derive(Default)]
    pub struct FakeBackend {
        pub inner: Mutex<FakeState>,
    }

    impl FakeBackend {
        pub fn with_snapshot(period_start: NaiveDate, counts: ActionCounts) -> Self {
            let backend = Self::default();
            backend.lock().snapshot = Some(UsageSnapshot {
                period_start,
                counts,
            });
            backend
        }

        pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
            self.inner.lock().expect("fake backend lock")
        }

        pub fn reply(&self, response: Result<ConsumeResponse, AppError>) {
            self.lock().consume_replies.push_back(response);
        }

        pub fn bump(&self, action: ActionType, by: u64) {
            let mut inner = self.lock();
            if let Some(snap) = inner.snapshot.as_mut() {
                *snap.counts.get_mut(action) += by;
            }
        }
    }

    #[async_trait]
    impl EntitlementBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn fetch_usage_snapshot(&self, _user_id: &str) -> Result<UsageSnapshot, AppError> {
            let inner = self.lock();
            if inner.fail_fetch {
                return Err(AppError::Network("connection reset".into()));
            }
            inner
                .snapshot
                .clone()
                .ok_or_else(|| AppError::Network("no snapshot".into()))
        }

        async fn consume_action(
            &self,
            _user_id: &str,
            request: ConsumeRequest,
        ) -> Result<ConsumeResponse, AppError> {
            let (delay, reply) = {
                let mut inner = self.lock();
                inner.consume_calls.push(request);
                (inner.consume_delay, inner.consume_replies.pop_front())
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            reply.unwrap_or_else(|| {
                Ok(ConsumeResponse {
                    allowed: true,
                    used_plan: Some(request.quantity),
                    ..Default::default()
                })
            })
        }

        async fn load_profile(&self, _user_id: &str) -> Result<Option<EntitlementState>, AppError> {
            Ok(self.lock().profile.clone())
        }

        async fn upsert_profile(&self, state: &EntitlementState) -> Result<(), AppError> {
            let delay = self.lock().upsert_delay.take();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut inner = self.lock();
            if inner.upsert_failures > 0 {
                inner.upsert_failures -= 1;
                return Err(AppError::Network("upsert timed out".into()));
            }
            inner.upserts += 1;
            inner.profile = Some(state.clone());
            Ok(())
        }

        async fn append_purchase(&self, _user_id: &str, record: &PurchaseRecord) -> Result<(), AppError> {
            self.lock().purchases.push(record.clone());
            Ok(())
        }

        async fn list_purchases(&self, _user_id: &str) -> Result<Vec<PurchaseRecord>, AppError> {
            Ok(self.lock().purchases.clone())
        }
    }
}
