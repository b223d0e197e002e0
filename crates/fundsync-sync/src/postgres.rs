//! Postgres-backed `FundStore`. The run lock is a session-level advisory lock held
//! by the pooled connection the run writes through.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fundsync_core::{
    CanonicalFund, FatalKind, FundMetrics, FundStatus, NavHistoryPoint, StoredFund, SyncOutcome,
    SyncStage, SyncStatus,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{FundStore, StoreError, StoreSession};

const FUND_COLUMNS: &str = "record_id, name, strategy, manager, cost, concentration, \
    weekly_return, daily_return, yearly_return, weekly_pnl, daily_pnl, yearly_pnl, \
    daily_capital_usage, total_assets, latest_nav_date, status, source_table, \
    max_drawdown, volatility, sharpe_ratio, annualized_return, created_at, updated_at";

const NAV_COLUMNS: &str = "fund_id, nav_date, unit_nav, cumulative_nav, daily_return, \
    market_value, cost, position_change, daily_pnl";

const OUTCOME_COLUMNS: &str = "run_id, sync_type, status, records_processed, records_updated, \
    records_inserted, nav_points_upserted, metrics_updated, warnings, errors, furthest_stage, \
    fatal_kind, started_at, ended_at";

#[derive(Debug, Clone)]
pub struct PgFundStore {
    pool: PgPool,
}

impl PgFundStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn lock_key(sync_type: &str) -> String {
    format!("fundsync:{sync_type}")
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::Decode(format!("{column} out of range: {value}")))
}

fn fund_from_row(row: &PgRow) -> Result<StoredFund, StoreError> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "redeemed" => FundStatus::Redeemed,
        _ => FundStatus::Normal,
    };
    Ok(StoredFund {
        fund: CanonicalFund {
            record_id: row.try_get("record_id")?,
            name: row.try_get("name")?,
            strategy: row.try_get("strategy")?,
            manager: row.try_get("manager")?,
            cost: row.try_get("cost")?,
            concentration: row.try_get("concentration")?,
            weekly_return: row.try_get("weekly_return")?,
            daily_return: row.try_get("daily_return")?,
            yearly_return: row.try_get("yearly_return")?,
            weekly_pnl: row.try_get("weekly_pnl")?,
            daily_pnl: row.try_get("daily_pnl")?,
            yearly_pnl: row.try_get("yearly_pnl")?,
            daily_capital_usage: row.try_get("daily_capital_usage")?,
            total_assets: row.try_get("total_assets")?,
            latest_nav_date: row.try_get::<Option<NaiveDate>, _>("latest_nav_date")?,
            status,
            source_table: row.try_get("source_table")?,
        },
        metrics: FundMetrics {
            max_drawdown: row.try_get("max_drawdown")?,
            volatility: row.try_get("volatility")?,
            sharpe_ratio: row.try_get("sharpe_ratio")?,
            annualized_return: row.try_get("annualized_return")?,
        },
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn nav_from_row(row: &PgRow) -> Result<NavHistoryPoint, StoreError> {
    Ok(NavHistoryPoint {
        fund_id: row.try_get("fund_id")?,
        nav_date: row.try_get("nav_date")?,
        unit_nav: row.try_get("unit_nav")?,
        cumulative_nav: row.try_get("cumulative_nav")?,
        daily_return: row.try_get("daily_return")?,
        market_value: row.try_get("market_value")?,
        cost: row.try_get("cost")?,
        position_change: row.try_get("position_change")?,
        daily_pnl: row.try_get("daily_pnl")?,
    })
}

fn outcome_from_row(row: &PgRow) -> Result<SyncOutcome, StoreError> {
    let status: String = row.try_get("status")?;
    let stage: String = row.try_get("furthest_stage")?;
    let fatal_kind: Option<String> = row.try_get("fatal_kind")?;
    let Json(warnings): Json<Vec<String>> = row.try_get("warnings")?;
    let Json(errors): Json<Vec<String>> = row.try_get("errors")?;

    Ok(SyncOutcome {
        run_id: row.try_get::<Uuid, _>("run_id")?,
        sync_type: row.try_get("sync_type")?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown status {status:?}")))?,
        records_processed: count(row, "records_processed")?,
        records_updated: count(row, "records_updated")?,
        records_inserted: count(row, "records_inserted")?,
        nav_points_upserted: count(row, "nav_points_upserted")?,
        metrics_updated: count(row, "metrics_updated")?,
        warnings,
        errors,
        furthest_stage: SyncStage::parse(&stage)
            .ok_or_else(|| StoreError::Decode(format!("unknown stage {stage:?}")))?,
        fatal_kind: fatal_kind.as_deref().and_then(FatalKind::parse),
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

async fn select_fund<'e>(
    executor: impl PgExecutor<'e>,
    record_id: &str,
) -> Result<Option<StoredFund>, StoreError> {
    let sql = format!("SELECT {FUND_COLUMNS} FROM funds WHERE record_id = $1");
    sqlx::query(&sql)
        .bind(record_id)
        .fetch_optional(executor)
        .await?
        .as_ref()
        .map(fund_from_row)
        .transpose()
}

async fn select_nav_series<'e>(
    executor: impl PgExecutor<'e>,
    fund_id: &str,
) -> Result<Vec<NavHistoryPoint>, StoreError> {
    let sql = format!("SELECT {NAV_COLUMNS} FROM fund_nav_history WHERE fund_id = $1 ORDER BY nav_date");
    sqlx::query(&sql)
        .bind(fund_id)
        .fetch_all(executor)
        .await?
        .iter()
        .map(nav_from_row)
        .collect()
}

async fn insert_outcome<'e>(
    executor: impl PgExecutor<'e>,
    outcome: &SyncOutcome,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO sync_outcomes ({OUTCOME_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    );
    sqlx::query(&sql)
        .bind(outcome.run_id)
        .bind(&outcome.sync_type)
        .bind(outcome.status.as_str())
        .bind(i64::from(outcome.records_processed))
        .bind(i64::from(outcome.records_updated))
        .bind(i64::from(outcome.records_inserted))
        .bind(i64::from(outcome.nav_points_upserted))
        .bind(i64::from(outcome.metrics_updated))
        .bind(Json(&outcome.warnings))
        .bind(Json(&outcome.errors))
        .bind(outcome.furthest_stage.as_str())
        .bind(outcome.fatal_kind.map(|k| k.as_str()))
        .bind(outcome.started_at)
        .bind(outcome.ended_at)
        .execute(executor)
        .await?;
    Ok(())
}

#[async_trait]
impl FundStore for PgFundStore {
    async fn begin_run(&self, sync_type: &str) -> Result<Box<dyn StoreSession>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1)::bigint)")
            .bind(lock_key(sync_type))
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(StoreError::LockContention {
                sync_type: sync_type.to_string(),
            });
        }
        debug!(sync_type, "acquired run lock");
        Ok(Box::new(PgSession {
            conn: Some(conn),
            sync_type: sync_type.to_string(),
        }))
    }

    async fn list_funds(&self, source_table: Option<&str>) -> Result<Vec<StoredFund>, StoreError> {
        let sql = format!(
            "SELECT {FUND_COLUMNS} FROM funds \
             WHERE ($1::text IS NULL OR source_table = $1) ORDER BY name, record_id"
        );
        sqlx::query(&sql)
            .bind(source_table)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(fund_from_row)
            .collect()
    }

    async fn get_fund(&self, record_id: &str) -> Result<Option<StoredFund>, StoreError> {
        select_fund(&self.pool, record_id).await
    }

    async fn nav_history(&self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError> {
        select_nav_series(&self.pool, fund_id).await
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<SyncOutcome>, StoreError> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM sync_outcomes ORDER BY started_at DESC LIMIT $1");
        sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(outcome_from_row)
            .collect()
    }

    async fn append_outcome(&self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        insert_outcome(&self.pool, outcome).await
    }
}

/// Holds the advisory lock for as long as its connection lives.
pub struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    sync_type: String,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_deref_mut().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn find_fund(&mut self, record_id: &str) -> Result<Option<StoredFund>, StoreError> {
        select_fund(self.conn()?, record_id).await
    }

    async fn insert_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO funds (record_id, name, strategy, manager, cost, concentration, \
             weekly_return, daily_return, yearly_return, weekly_pnl, daily_pnl, yearly_pnl, \
             daily_capital_usage, total_assets, latest_nav_date, status, source_table, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, now(), now())",
        )
        .bind(&fund.record_id)
        .bind(&fund.name)
        .bind(&fund.strategy)
        .bind(&fund.manager)
        .bind(fund.cost)
        .bind(fund.concentration)
        .bind(fund.weekly_return)
        .bind(fund.daily_return)
        .bind(fund.yearly_return)
        .bind(fund.weekly_pnl)
        .bind(fund.daily_pnl)
        .bind(fund.yearly_pnl)
        .bind(fund.daily_capital_usage)
        .bind(fund.total_assets)
        .bind(fund.latest_nav_date)
        .bind(fund.status.as_str())
        .bind(&fund.source_table)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn update_fund(&mut self, fund: &CanonicalFund) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE funds SET name = $2, strategy = $3, manager = $4, cost = $5, \
             concentration = $6, weekly_return = $7, daily_return = $8, yearly_return = $9, \
             weekly_pnl = $10, daily_pnl = $11, yearly_pnl = $12, daily_capital_usage = $13, \
             total_assets = $14, latest_nav_date = $15, status = $16, source_table = $17, \
             updated_at = now() \
             WHERE record_id = $1",
        )
        .bind(&fund.record_id)
        .bind(&fund.name)
        .bind(&fund.strategy)
        .bind(&fund.manager)
        .bind(fund.cost)
        .bind(fund.concentration)
        .bind(fund.weekly_return)
        .bind(fund.daily_return)
        .bind(fund.yearly_return)
        .bind(fund.weekly_pnl)
        .bind(fund.daily_pnl)
        .bind(fund.yearly_pnl)
        .bind(fund.daily_capital_usage)
        .bind(fund.total_assets)
        .bind(fund.latest_nav_date)
        .bind(fund.status.as_str())
        .bind(&fund.source_table)
        .execute(self.conn()?)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(fund.record_id.clone()));
        }
        Ok(())
    }

    async fn upsert_nav_point(&mut self, point: &NavHistoryPoint) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO fund_nav_history ({NAV_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (fund_id, nav_date) DO UPDATE SET \
             unit_nav = EXCLUDED.unit_nav, cumulative_nav = EXCLUDED.cumulative_nav, \
             daily_return = EXCLUDED.daily_return, market_value = EXCLUDED.market_value, \
             cost = EXCLUDED.cost, position_change = EXCLUDED.position_change, \
             daily_pnl = EXCLUDED.daily_pnl"
        );
        sqlx::query(&sql)
            .bind(&point.fund_id)
            .bind(point.nav_date)
            .bind(point.unit_nav)
            .bind(point.cumulative_nav)
            .bind(point.daily_return)
            .bind(point.market_value)
            .bind(point.cost)
            .bind(point.position_change)
            .bind(point.daily_pnl)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn load_nav_series(&mut self, fund_id: &str) -> Result<Vec<NavHistoryPoint>, StoreError> {
        select_nav_series(self.conn()?, fund_id).await
    }

    async fn write_metrics(&mut self, fund_id: &str, metrics: &FundMetrics) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE funds SET max_drawdown = $2, volatility = $3, sharpe_ratio = $4, \
             annualized_return = $5 WHERE record_id = $1",
        )
        .bind(fund_id)
        .bind(metrics.max_drawdown)
        .bind(metrics.volatility)
        .bind(metrics.sharpe_ratio)
        .bind(metrics.annualized_return)
        .execute(self.conn()?)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(fund_id.to_string()));
        }
        Ok(())
    }

    async fn append_outcome(&mut self, outcome: &SyncOutcome) -> Result<(), StoreError> {
        insert_outcome(self.conn()?, outcome).await
    }

    async fn release(self: Box<Self>) -> Result<(), StoreError> {
        let mut session = self;
        let Some(mut conn) = session.conn.take() else {
            return Err(StoreError::Closed);
        };
        let key = lock_key(&session.sync_type);
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock(hashtext($1)::bigint)")
            .bind(&key)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => debug!(sync_type = %session.sync_type, "released run lock"),
            Ok(false) => warn!(lock = %key, "run lock was not held at release"),
            Err(err) => {
                // Never hand a connection that may still hold the lock back to the pool.
                drop(conn.detach());
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // Closing the connection ends the Postgres session, which drops the lock.
        if let Some(conn) = self.conn.take() {
            warn!(sync_type = %self.sync_type, "run session dropped without release; closing connection");
            drop(conn.detach());
        }
    }
}
