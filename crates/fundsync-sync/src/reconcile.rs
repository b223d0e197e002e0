//! Reconciliation of canonical funds and NAV points into the store, followed by
//! metrics recomputation for every fund the run touched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fundsync_core::{CanonicalFund, FundMetrics, NavHistoryPoint, SyncWarning, WarningKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::metrics::compute_metrics;
use crate::report::ReportBuilder;
use crate::store::{StoreError, StoreSession};

/// One merged fund together with the NAV points derived for it.
#[derive(Debug, Clone, PartialEq)]
pub struct FundBatch {
    pub fund: CanonicalFund,
    pub nav_points: Vec<NavHistoryPoint>,
}

enum Change {
    Inserted,
    Updated,
    Unchanged,
}

async fn upsert_fund(
    session: &mut dyn StoreSession,
    fund: &CanonicalFund,
) -> Result<Change, StoreError> {
    match session.find_fund(&fund.record_id).await? {
        None => {
            session.insert_fund(fund).await?;
            Ok(Change::Inserted)
        }
        Some(existing) if existing.fund == *fund => Ok(Change::Unchanged),
        Some(_) => {
            session.update_fund(fund).await?;
            Ok(Change::Updated)
        }
    }
}

/// Writes every batch through `session`. A failed fund is recorded as an error and
/// its NAV points are skipped; the run continues with the next fund. Returns the
/// ids of funds that are present in the store after this call.
pub async fn reconcile(
    session: &mut dyn StoreSession,
    batches: &[FundBatch],
    report: &mut ReportBuilder,
) -> BTreeSet<String> {
    let mut touched = BTreeSet::new();

    for batch in batches {
        let id = &batch.fund.record_id;
        report.record_processed();

        match upsert_fund(session, &batch.fund).await {
            Ok(Change::Inserted) => {
                debug!(fund = %id, "inserted fund");
                report.record_inserted();
            }
            Ok(Change::Updated) => {
                debug!(fund = %id, "updated fund");
                report.record_updated();
            }
            Ok(Change::Unchanged) => {}
            Err(err) => {
                report.error(format!("fund {id}: {err}"));
                if !batch.nav_points.is_empty() {
                    let message = format!(
                        "skipped {} NAV points of fund {id} after its upsert failed",
                        batch.nav_points.len()
                    );
                    warn!(%message, "reconcile");
                    report.warn(SyncWarning::new(WarningKind::Persistence, message));
                }
                continue;
            }
        }
        touched.insert(id.clone());

        for point in &batch.nav_points {
            match session.upsert_nav_point(point).await {
                Ok(()) => report.nav_point_upserted(),
                Err(err) => report.error(format!("NAV point {id}@{}: {err}", point.nav_date)),
            }
        }
    }

    touched
}

/// Recomputes metrics of `fund_ids` from their full stored series. Computation runs
/// on at most `workers` blocking tasks; writes go back through the session in id
/// order.
pub async fn recompute_metrics(
    session: &mut dyn StoreSession,
    fund_ids: &BTreeSet<String>,
    workers: usize,
    report: &mut ReportBuilder,
) {
    let mut series = Vec::with_capacity(fund_ids.len());
    for id in fund_ids {
        match session.load_nav_series(id).await {
            Ok(points) => series.push((id.clone(), points)),
            Err(err) => report.error(format!("loading NAV series of {id}: {err}")),
        }
    }

    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for (id, points) in series {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            report.error("metrics worker pool closed");
            break;
        };
        tasks.spawn_blocking(move || {
            let metrics = compute_metrics(&points);
            drop(permit);
            (id, metrics)
        });
    }

    let mut computed: BTreeMap<String, FundMetrics> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, metrics)) => {
                computed.insert(id, metrics);
            }
            Err(err) => report.error(format!("metrics worker failed: {err}")),
        }
    }

    for (id, metrics) in computed {
        match session.write_metrics(&id, &metrics).await {
            Ok(()) => report.metrics_updated(),
            Err(err) => report.error(format!("writing metrics of {id}: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FundStore, MemoryFundStore};
    use chrono::NaiveDate;
    use fundsync_core::SyncStatus;
    use uuid::Uuid;

    fn fund(id: &str, cost: f64) -> CanonicalFund {
        CanonicalFund {
            record_id: id.to_string(),
            name: format!("Fund {id}"),
            cost,
            source_table: "main".to_string(),
            ..CanonicalFund::default()
        }
    }

    fn point(id: &str, day: u32, nav: f64) -> NavHistoryPoint {
        NavHistoryPoint {
            fund_id: id.to_string(),
            nav_date: NaiveDate::from_ymd_opt(2025, 1, day).expect("date"),
            unit_nav: nav,
            cumulative_nav: nav,
            daily_return: 0.0,
            market_value: None,
            cost: None,
            position_change: None,
            daily_pnl: None,
        }
    }

    #[tokio::test]
    async fn second_pass_only_updates_changed_funds() {
        let store = MemoryFundStore::new();
        let mut session = store.begin_run("bitable").await.expect("session");
        let first = vec![
            FundBatch { fund: fund("A", 1_000_000.0), nav_points: vec![point("A", 2, 1.0)] },
            FundBatch { fund: fund("B", 5.0), nav_points: Vec::new() },
        ];
        let mut report = ReportBuilder::new(Uuid::new_v4(), "bitable");
        reconcile(session.as_mut(), &first, &mut report).await;
        let outcome = report.finish();
        assert_eq!((outcome.records_inserted, outcome.records_updated), (2, 0));

        let second = vec![
            FundBatch { fund: fund("A", 1_200_000.0), nav_points: vec![point("A", 2, 1.0)] },
            FundBatch { fund: fund("B", 5.0), nav_points: Vec::new() },
        ];
        let mut report = ReportBuilder::new(Uuid::new_v4(), "bitable");
        let touched = reconcile(session.as_mut(), &second, &mut report).await;
        let outcome = report.finish();
        assert_eq!(outcome.records_processed, 2);
        assert_eq!(outcome.records_inserted, 0);
        assert_eq!(outcome.records_updated, 1);
        assert_eq!(outcome.nav_points_upserted, 1);
        assert_eq!(touched.len(), 2);

        let stored = store.get_fund("A").await.expect("get").expect("present");
        assert_eq!(stored.fund.cost, 1_200_000.0);
    }

    #[tokio::test]
    async fn failed_fund_is_reported_and_its_nav_points_skipped() {
        let store = MemoryFundStore::new();
        store.fail_writes_for("BAD");
        let mut session = store.begin_run("bitable").await.expect("session");
        let batches = vec![
            FundBatch { fund: fund("BAD", 1.0), nav_points: vec![point("BAD", 2, 1.0), point("BAD", 3, 1.1)] },
            FundBatch { fund: fund("OK", 1.0), nav_points: vec![point("OK", 2, 1.0)] },
        ];
        let mut report = ReportBuilder::new(Uuid::new_v4(), "bitable");
        let touched = reconcile(session.as_mut(), &batches, &mut report).await;
        let outcome = report.finish();

        assert_eq!(touched, BTreeSet::from(["OK".to_string()]));
        assert_eq!(outcome.status, SyncStatus::SuccessWithWarnings);
        assert_eq!(outcome.records_processed, 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.nav_points_upserted, 1);
        assert!(store.nav_history("BAD").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn metrics_are_written_for_every_touched_fund() {
        let store = MemoryFundStore::new();
        let mut session = store.begin_run("bitable").await.expect("session");
        let batches: Vec<FundBatch> = ["A", "B", "C"]
            .iter()
            .map(|id| FundBatch {
                fund: fund(id, 1.0),
                nav_points: vec![point(id, 2, 1.0), point(id, 9, 1.1), point(id, 16, 0.95), point(id, 23, 1.05)],
            })
            .collect();
        let mut report = ReportBuilder::new(Uuid::new_v4(), "bitable");
        let touched = reconcile(session.as_mut(), &batches, &mut report).await;
        recompute_metrics(session.as_mut(), &touched, 2, &mut report).await;
        assert_eq!(report.finish().metrics_updated, 3);

        for id in ["A", "B", "C"] {
            let stored = store.get_fund(id).await.expect("get").expect("present");
            assert!((stored.metrics.max_drawdown - 0.15 / 1.1).abs() < 1e-9);
        }
    }
}
