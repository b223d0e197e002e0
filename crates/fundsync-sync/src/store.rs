//! Persistence seam. A run acquires one `StoreSession` for all of its writes; the
//! session holds the run-level lock for its sync type until released or dropped.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use fundsync_core::{CanonicalFund, FundMetrics, NavHistoryPoint, StoredFund, SyncOutcome};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("another {sync_type} sync is already running")]
    LockContention { sync_type: String },
    #[error("fund {0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("decoding stored row: {0}")]
    Decode(String),
    #[error("store session already released")]
    Closed,
    #[error("write rejected: {0}")]
    Injected(String),
}

#[async_trait]
pub trait FundStore: Send + Sync {
    /// Acquires the run lock for `sync_type`. Fails fast with `LockContention`
    /// when another session holds it.
    async fn begin_run(&self, sync_type: &str) -> Result<Box<dyn StoreSession>, StoreError>;

    async fn list_funds(&self, source_table: Option<&str>) -> Result<Vec<StoredFund>, StoreError>;

    async fn get_fund(&self, record_id: &str) -> Result<Option<StoredFund>, StoreError>;

    async fn nav_history(&self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError>;

    /// Newest first.
    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>, StoreError>;

    /// Records an outcome for a run that never obtained a session.
    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError>;
}

/// Write handle of one run. Every statement commits on its own.
#[async_trait]
pub trait StoreSession: Send {
    async fn find_fund(&mut self, record_id: &str) -> Result<Option<StoredFund>, StoreError>;

    async fn insert_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError>;

    /// Overwrites the content columns and bumps `updated_at`.
    async fn update_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError>;

    async fn upsert_nav_point(&mut self, point: &NavHistoryPoint) -> Result<(), StoreError>;

    async fn load_nav_series(&mut self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError>;

    async fn write_metrics(&mut self, fund_id: &str, metrics: &FundMetrics) -> Result<(), StoreError>;

    async fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<(), StoreError>;

    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    funds: BTreeMap<String, StoredFund>,
    nav: BTreeMap<(String, NaiveDate), NavHistoryPoint>,
    outcomes: Vec<SyncOutcome>,
    locks: HashSet<String>,
    failing: HashSet<String>,
}

/// In-process store used by tests and fixture runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryFundStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert or update of `record_id` fail.
    pub fn fail_writes_for(&self, record_id: impl Into<String>) {
        self.with_state(|state| state.failing.insert(record_id.into()));
    }

    pub fn is_locked(&self, sync_type: &str) -> bool {
        self.with_state(|state| state.locks.contains(sync_type))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

fn nav_series(state: &MemoryState, fund_id: &str) -> Vec<NavHistoryPoint> {
    state
        .nav
        .iter()
        .filter(|((id, _), _)| id == fund_id)
        .map(|(_, point)| point.clone())
        .collect()
}

fn newest_outcomes(state: &MemoryState, limit: usize) -> Vec<SyncOutcome> {
    state.outcomes.iter().rev().take(limit).cloned().collect()
}

#[async_trait]
impl FundStore for MemoryFundStore {
    async fn begin_run(&self, sync_type: &str) -> Result<Box<dyn StoreSession>, StoreError> {
        let acquired = self.with_state(|state| state.locks.insert(sync_type.to_string()));
        if !acquired {
            return Err(StoreError::LockContention {
                sync_type: sync_type.to_string(),
            });
        }
        Ok(Box::new(MemorySession {
            store: self.clone(),
            sync_type: sync_type.to_string(),
            released: false,
        }))
    }

    async fn list_funds(&self, source_table: Option<&str>) -> Result<Vec<StoredFund>, StoreError> {
        Ok(self.with_state(|state| {
            state
                .funds
                .values()
                .filter(|f| source_table.map_or(true, |s| f.fund.source_table == s))
                .cloned()
                .collect()
        }))
    }

    async fn get_fund(&self, record_id: &str) -> Result<Option<StoredFund>, StoreError> {
        Ok(self.with_state(|state| state.funds.get(record_id).cloned()))
    }

    async fn nav_history(&self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError> {
        Ok(self.with_state(|state| nav_series(state, fund_id)))
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>, StoreError> {
        Ok(self.with_state(|state| newest_outcomes(state, limit)))
    }

    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        self.with_state(|state| state.outcomes.push(outcome.clone()));
        Ok(())
    }
}

struct MemorySession {
    store: MemoryFundStore,
    sync_type: String,
    released: bool,
}

impl MemorySession {
    fn check_writable(&self, record_id: &str) -> Result<(), StoreError> {
        if self.store.with_state(|state| state.failing.contains(record_id)) {
            return Err(StoreError::Injected(format!("writes to {record_id} are failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_fund(&mut self, record_id: &str) -> Result<Option<StoredFund>, StoreError> {
        Ok(self.store.with_state(|state| state.funds.get(record_id).cloned()))
    }

    async fn insert_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError> {
        self.check_writable(&fund.record_id)?;
        let now = Utc::now();
        self.store.with_state(|state| {
            state.funds.insert(
                fund.record_id.clone(),
                StoredFund {
                    fund: fund.clone(),
                    metrics: FundMetrics::default(),
                    created_at: now,
                    updated_at: now,
                },
            )
        });
        Ok(())
    }

    async fn update_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError> {
        self.check_writable(&fund.record_id)?;
        self.store.with_state(|state| match state.funds.get_mut(&fund.record_id) {
            Some(stored) => {
                stored.fund = fund.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(fund.record_id.clone())),
        })
    }

    async fn upsert_nav_point(&mut self, point: &NavHistoryPoint) -> Result<(), StoreError> {
        self.store.with_state(|state| {
            if !state.funds.contains_key(&point.fund_id) {
                return Err(StoreError::NotFound(point.fund_id.clone()));
            }
            state
                .nav
                .insert((point.fund_id.clone(), point.nav_date), point.clone());
            Ok(())
        })
    }

    async fn load_nav_series(&mut self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError> {
        Ok(self.store.with_state(|state| nav_series(state, fund_id)))
    }

    async fn write_metrics(&mut self, fund_id: &str, metrics: &FundMetrics) -> Result<(), StoreError> {
        self.store.with_state(|state| match state.funds.get_mut(fund_id) {
            Some(stored) => {
                stored.metrics = *metrics;
                Ok(())
            }
            None => Err(StoreError::NotFound(fund_id.to_string())),
        })
    }

    async fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        self.store
            .with_state(|state| state.outcomes.push(outcome.clone()));
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let mut session = self;
        session.released = true;
        let sync_type = session.sync_type.clone();
        session
            .store
            .with_state(|state| state.locks.remove(&sync_type));
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.released {
            let sync_type = self.sync_type.clone();
            self.store
                .with_state(|state| state.locks.remove(&sync_type));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fund(id: &str, cost: f64) -> CanonicalFund {
        CanonicalFund {
            record_id: id.to_string(),
            name: format!("Fund {id}"),
            cost,
            source_table: "main".to_string(),
            ..CanonicalFund::default()
        }
    }

    #[tokio::test]
    async fn second_session_for_same_sync_type_is_rejected() {
        let store = MemoryFundStore::new();
        let session = store.begin_run("bitable").await.expect("first");
        let err = store.begin_run("bitable").await.err().expect("contention");
        assert!(matches!(err, StoreError::LockContention { .. }));
        assert!(store.begin_run("other").await.is_ok());

        session.release().await.expect("release");
        assert!(!store.is_locked("bitable"));
    }

    #[tokio::test]
    async fn dropping_a_session_frees_the_lock() {
        let store = MemoryFundStore::new();
        {
            let _session = store.begin_run("bitable").await.expect("session");
            assert!(store.is_locked("bitable"));
        }
        assert!(!store.is_locked("bitable"));
    }

    #[tokio::test]
    async fn update_keeps_created_at_and_metrics_do_not_touch_updated_at() {
        let store = MemoryFundStore::new();
        let mut session = store.begin_run("bitable").await.expect("session");
        session.insert_fund(&fund("F", 1.0)).await.expect("insert");
        let inserted = session.find_fund("F").await.expect("find").expect("present");

        session.update_fund(&fund("F", 2.0)).await.expect("update");
        let metrics = FundMetrics {
            max_drawdown: 0.1,
            ..FundMetrics::default()
        };
        let before_metrics = session.find_fund("F").await.expect("find").expect("present");
        session.write_metrics("F", &metrics).await.expect("metrics");
        let stored = store.get_fund("F").await.expect("get").expect("present");

        assert_eq!(stored.created_at, inserted.created_at);
        assert_eq!(stored.updated_at, before_metrics.updated_at);
        assert_eq!(stored.fund.cost, 2.0);
        assert_eq!(stored.metrics.max_drawdown, 0.1);
        session.release().await.expect("release");
    }

    #[tokio::test]
    async fn nav_points_require_parent_fund_and_upsert_by_date() {
        let store = MemoryFundStore::new();
        let mut session = store.begin_run("bitable").await.expect("session");
        let date = NaiveDate::from_ymd_opt(2025, 1, 3).expect("date");
        let mut point = NavHistoryPoint {
            fund_id: "F".to_string(),
            nav_date: date,
            unit_nav: 1.0,
            cumulative_nav: 1.0,
            daily_return: 0.0,
            market_value: None,
            cost: None,
            position_change: None,
            daily_pnl: None,
        };
        assert!(matches!(
            session.upsert_nav_point(&point).await,
            Err(StoreError::NotFound(_))
        ));

        session.insert_fund(&fund("F", 1.0)).await.expect("insert");
        session.upsert_nav_point(&point).await.expect("first");
        point.cumulative_nav = 1.2;
        session.upsert_nav_point(&point).await.expect("overwrite");

        let series = store.nav_history("F").await.expect("history");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].cumulative_nav, 1.2);
    }

    #[tokio::test]
    async fn injected_failures_only_hit_the_named_fund() {
        let store = MemoryFundStore::new();
        store.fail_writes_for("BAD");
        let mut session = store.begin_run("bitable").await.expect("session");
        assert!(session.insert_fund(&fund("BAD", 1.0)).await.is_err());
        assert!(session.insert_fund(&fund("OK", 1.0)).await.is_ok());
        assert_eq!(store.list_funds(None).await.expect("list").len(), 1);
        assert!(store.list_funds(Some("fof")).await.expect("list").is_empty());
    }
}
