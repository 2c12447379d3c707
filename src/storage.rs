//! Local SQLite ledger. Stands in for the hosted service when running offline,
//! owning period boundaries and authorizing consumption the same way.

use crate::error::AppError;
use crate::limits::{attribute, availability, resolve_allowance, LimitInputs, PlanAllowance};
use crate::models::{
    ActionCounts, ActionType, ConsumeRequest, ConsumeResponse, EntitlementState, PurchaseRecord,
    UsageSnapshot,
};
use crate::period::Clock;
use crate::reconcile::reconcile;
use crate::remote::EntitlementBackend;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

pub struct Storage {
    conn: Mutex<Connection>,
    allowances: Vec<PlanAllowance>,
    clock: Arc<dyn Clock>,
}

fn conversion_error(
    col: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, e.into())
}

/// The local ledger bills by calendar month.
pub fn period_start(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.with_day(1).unwrap_or(today)
}

impl Storage {
    pub fn open(
        path: &Path,
        allowances: Vec<PlanAllowance>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let this = Self {
            conn: Mutex::new(conn),
            allowances,
            clock,
        };
        this.init()?;
        Ok(this)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage_counters (
                user_id TEXT NOT NULL,
                period_start TEXT NOT NULL,
                action TEXT NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (user_id, period_start, action)
            );

            CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                purchased_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn read_profile(conn: &Connection, user_id: &str) -> Result<Option<EntitlementState>, AppError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM profiles WHERE user_id = ?",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn read_counts(conn: &Connection, user_id: &str, period: NaiveDate) -> Result<ActionCounts, AppError> {
        let mut stmt = conn.prepare(
            "SELECT action, count FROM usage_counters WHERE user_id = ? AND period_start = ?",
        )?;
        let rows = stmt
            .query_map(params![user_id, period.to_string()], |r| {
                let action = r
                    .get::<_, String>(0)?
                    .parse::<ActionType>()
                    .map_err(|e| conversion_error(0, e))?;
                let count: i64 = r.get(1)?;
                Ok((action, count.max(0) as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = ActionCounts::default();
        for (action, count) in rows {
            counts.set(action, count);
        }
        Ok(counts)
    }

    pub fn usage_snapshot(&self, user_id: &str) -> Result<UsageSnapshot, AppError> {
        let period = period_start(self.clock.now());
        let counts = Self::read_counts(&self.conn(), user_id, period)?;
        Ok(UsageSnapshot {
            period_start: period,
            counts,
        })
    }

    pub fn consume(&self, user_id: &str, request: ConsumeRequest) -> Result<ConsumeResponse, AppError> {
        if request.quantity == 0 {
            return Err(AppError::InvalidQuantity);
        }
        let now = self.clock.now();
        let period = period_start(now);
        let action = request.action_type;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let state = Self::read_profile(&tx, user_id)?
            .ok_or_else(|| AppError::ProfileNotFound(user_id.to_string()))?;
        let snapshot = UsageSnapshot {
            period_start: period,
            counts: Self::read_counts(&tx, user_id, period)?,
        };

        // Judge against pools as they will look once every counted action is drained.
        let current = reconcile(&state, &snapshot, now).state;
        let allowance = resolve_allowance(current.plan_tier, &self.allowances);
        let avail = availability(action, &LimitInputs::from_state(&current, now), &allowance);

        let Some((used_plan, used_trial, used_addon)) = attribute(&avail, request.quantity) else {
            let reason = if avail.ai_blocked {
                "AI features are disabled for this account".to_string()
            } else {
                format!("No {action} credits left this period")
            };
            info!(%action, user_id, quantity = request.quantity, %reason, "local ledger denied");
            return Ok(ConsumeResponse {
                allowed: false,
                reason: Some(reason),
                ..Default::default()
            });
        };

        tx.execute(
            "INSERT INTO usage_counters (user_id, period_start, action, count) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, period_start, action) DO UPDATE SET count = count + excluded.count",
            params![user_id, period.to_string(), action.as_label(), request.quantity],
        )?;
        tx.commit()?;

        Ok(ConsumeResponse {
            allowed: true,
            reason: None,
            used_trial: Some(used_trial),
            used_addon: Some(used_addon),
            used_plan: Some(used_plan),
        })
    }

    pub fn profile(&self, user_id: &str) -> Result<Option<EntitlementState>, AppError> {
        Self::read_profile(&self.conn(), user_id)
    }

    pub fn save_profile(&self, state: &EntitlementState) -> Result<(), AppError> {
        let body = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT INTO profiles (user_id, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![state.user_id, body, self.clock.now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record_purchase(&self, user_id: &str, record: &PurchaseRecord) -> Result<(), AppError> {
        self.conn().execute(
            "INSERT INTO purchases (user_id, action, quantity, purchased_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                record.action_type.as_label(),
                record.quantity,
                record.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn purchases(&self, user_id: &str) -> Result<Vec<PurchaseRecord>, AppError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action, quantity, purchased_at FROM purchases WHERE user_id = ? ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([user_id], |r| {
                let quantity: i64 = r.get(1)?;
                Ok(PurchaseRecord {
                    action_type: r
                        .get::<_, String>(0)?
                        .parse::<ActionType>()
                        .map_err(|e| conversion_error(0, e))?,
                    quantity: quantity.max(0) as u64,
                    timestamp: DateTime::parse_from_rfc3339(&r.get::<_, String>(2)?)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| conversion_error(2, e))?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl EntitlementBackend for Storage {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn fetch_usage_snapshot(&self, user_id: &str) -> Result<UsageSnapshot, AppError> {
        self.usage_snapshot(user_id)
    }

    async fn consume_action(
        &self,
        user_id: &str,
        request: ConsumeRequest,
    ) -> Result<ConsumeResponse, AppError> {
        self.consume(user_id, request)
    }

    async fn load_profile(&self, user_id: &str) -> Result<Option<EntitlementState>, AppError> {
        self.profile(user_id)
    }

    async fn upsert_profile(&self, state: &EntitlementState) -> Result<(), AppError> {
        self.save_profile(state)
    }

    async fn append_purchase(&self, user_id: &str, record: &PurchaseRecord) -> Result<(), AppError> {
        self.record_purchase(user_id, record)
    }

    async fn list_purchases(&self, user_id: &str) -> Result<Vec<PurchaseRecord>, AppError> {
        self.purchases(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PlanTier, TrialWindow};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn fixed_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0)
            .single()
            .expect("valid fixed timestamp")
    }

    fn open(tmp: &TempDir) -> Storage {
        Storage::open(
            &tmp.path().join("ledger.sqlite"),
            vec![PlanAllowance {
                tier: PlanTier::Base,
                monthly: ActionCounts::new(1, 1, 0, 0),
            }],
            Arc::new(FixedClock(fixed_ts())),
        )
        .expect("open storage")
    }

    fn seed_profile(storage: &Storage, trial_days: i64, addons: ActionCounts) -> EntitlementState {
        let mut state = EntitlementState::new_profile(
            "user-1",
            TrialWindow::start(
                fixed_ts() - Duration::days(1),
                trial_days,
                ActionCounts::new(2, 2, 2, 2),
            ),
        );
        state.addons.balances = addons;
        storage.save_profile(&state).expect("seed profile");
        state
    }

    fn consume(storage: &Storage, action: ActionType, quantity: u64) -> ConsumeResponse {
        storage
            .consume(
                "user-1",
                ConsumeRequest {
                    action_type: action,
                    quantity,
                },
            )
            .expect("consume")
    }

    #[test]
    fn period_starts_on_first_of_month() {
        assert_eq!(
            period_start(fixed_ts()),
            NaiveDate::from_ymd_opt(2026, 10, 1).expect("valid date")
        );
    }

    #[test]
    fn save_profile_is_an_upsert() {
        let tmp = TempDir::new().expect("tempdir");
        let storage = open(&tmp);
        let mut state = seed_profile(&storage, 14, ActionCounts::default());
        state.plan_tier = PlanTier::Premium;
        storage.save_profile(&state).expect("second save");
        storage.save_profile(&state).expect("third save");

        let loaded = storage.profile("user-1").expect("load").expect("present");
        assert_eq!(loaded, state);
        let rows: i64 = storage
            .conn()
            .query_row("SELECT COUNT(*) FROM profiles", [], |r| r.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn consume_spends_trial_then_addon_then_plan() {
        let tmp = TempDir::new().expect("tempdir");
        let storage = open(&tmp);
        seed_profile(&storage, 14, ActionCounts::new(1, 0, 0, 0));

        let first = consume(&storage, ActionType::Import, 1);
        assert_eq!(
            (first.used_plan, first.used_trial, first.used_addon),
            (Some(0), Some(1), Some(0))
        );

        let second = consume(&storage, ActionType::Import, 2);
        assert!(second.allowed);
        assert_eq!(
            (second.used_plan, second.used_trial, second.used_addon),
            (Some(0), Some(1), Some(1))
        );

        let third = consume(&storage, ActionType::Import, 1);
        assert_eq!(
            (third.used_plan, third.used_trial, third.used_addon),
            (Some(1), Some(0), Some(0))
        );

        let fourth = consume(&storage, ActionType::Import, 1);
        assert!(!fourth.allowed);
        assert_eq!(fourth.reason.as_deref(), Some("No import credits left this period"));
        assert_eq!(storage.usage_snapshot("user-1").expect("usage").counts.import, 4);
    }

    fn open_with_built_ins(tmp: &TempDir, name: &str) -> Storage {
        let storage = Storage::open(&tmp.path().join(name), vec![], Arc::new(FixedClock(fixed_ts())))
            .expect("open storage");
        let state = EntitlementState::new_profile(
            "user-1",
            TrialWindow::start(fixed_ts() - Duration::days(1), 14, ActionCounts::new(10, 10, 10, 100)),
        );
        storage.save_profile(&state).expect("seed profile");
        storage
    }

    #[test]
    fn capacity_does_not_depend_on_request_size() {
        let tmp = TempDir::new().expect("tempdir");

        let singles = open_with_built_ins(&tmp, "singles.sqlite");
        let allowed = (0..20)
            .filter(|_| consume(&singles, ActionType::Import, 1).allowed)
            .count();
        assert_eq!(allowed, 15);

        let batched = open_with_built_ins(&tmp, "batched.sqlite");
        assert!(!consume(&batched, ActionType::Import, 16).allowed);
        assert!(consume(&batched, ActionType::Import, 15).allowed);
        assert!(!consume(&batched, ActionType::Import, 1).allowed);
    }

    #[test]
    fn consume_rejects_ai_actions_when_disabled() {
        let tmp = TempDir::new().expect("tempdir");
        let storage = open(&tmp);
        let mut state = seed_profile(&storage, 14, ActionCounts::new(5, 5, 5, 5));
        state.ai_disabled = true;
        storage.save_profile(&state).expect("save");

        let reply = consume(&storage, ActionType::AiMessage, 1);
        assert!(!reply.allowed);
        assert_eq!(
            reply.reason.as_deref(),
            Some("AI features are disabled for this account")
        );
        assert!(consume(&storage, ActionType::Import, 1).allowed);
    }

    #[test]
    fn consume_without_profile_fails() {
        let tmp = TempDir::new().expect("tempdir");
        let storage = open(&tmp);
        let err = storage
            .consume(
                "ghost",
                ConsumeRequest {
                    action_type: ActionType::Import,
                    quantity: 1,
                },
            )
            .expect_err("no profile");
        assert!(matches!(err, AppError::ProfileNotFound(_)));
    }

    #[test]
    fn purchases_round_trip_in_order() {
        let tmp = TempDir::new().expect("tempdir");
        let storage = open(&tmp);
        for (action, quantity) in [(ActionType::Import, 5), (ActionType::AiMessage, 50)] {
            storage
                .record_purchase(
                    "user-1",
                    &PurchaseRecord {
                        action_type: action,
                        quantity,
                        timestamp: fixed_ts(),
                    },
                )
                .expect("record");
        }
        let rows = storage.purchases("user-1").expect("list");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action_type, ActionType::Import);
        assert_eq!(rows[1].quantity, 50);
        assert_eq!(rows[1].timestamp, fixed_ts());
        assert!(storage.purchases("someone-else").expect("list").is_empty());
    }
}
