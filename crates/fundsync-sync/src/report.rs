//! Collects counters and messages of one run and folds them into a `SyncOutcome`.

use chrono::{DateTime, Utc};
use fundsync_core::{FatalKind, SyncOutcome, SyncStage, SyncStatus, SyncWarning};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ReportBuilder {
    run_id: Uuid,
    sync_type: String,
    started_at: DateTime<Utc>,
    stage: SyncStage,
    furthest: SyncStage,
    processed: u32,
    updated: u32,
    inserted: u32,
    nav_points: u32,
    metrics: u32,
    warnings: Vec<SyncWarning>,
    errors: Vec<String>,
    fatal: Option<FatalKind>,
}

impl ReportBuilder {
    pub fn new(run_id: Uuid, sync_type: impl Into<String>) -> Self {
        Self {
            run_id,
            sync_type: sync_type.into(),
            started_at: Utc::now(),
            stage: SyncStage::Idle,
            furthest: SyncStage::Idle,
            processed: 0,
            updated: 0,
            inserted: 0,
            nav_points: 0,
            metrics: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
            fatal: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Moves the run to `stage`. Out-of-order transitions are logged but applied.
    pub fn enter(&mut self, stage: SyncStage) {
        if !self.stage.can_transition_to(stage) {
            warn!(from = %self.stage, to = %stage, "unexpected sync stage transition");
        }
        info!(run_id = %self.run_id, stage = %stage, "sync stage");
        self.stage = stage;
        if stage != SyncStage::Reporting && stage > self.furthest {
            self.furthest = stage;
        }
    }

    /// Jumps over the fetch stages; used by runs that only touch stored data.
    pub fn skip_to(&mut self, stage: SyncStage) {
        info!(run_id = %self.run_id, stage = %stage, "sync stage");
        self.stage = stage;
        if stage != SyncStage::Reporting && stage > self.furthest {
            self.furthest = stage;
        }
    }

    pub fn warn(&mut self, warning: SyncWarning) {
        self.warnings.push(warning);
    }

    pub fn warn_all(&mut self, warnings: impl IntoIterator<Item = SyncWarning>) {
        self.warnings.extend(warnings);
    }

    /// A recovered per-record failure.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(run_id = %self.run_id, %message, "sync record failed");
        self.errors.push(message);
    }

    pub fn fatal(&mut self, kind: FatalKind, message: impl Into<String>) {
        let message = message.into();
        error!(run_id = %self.run_id, kind = kind.as_str(), %message, "sync aborted");
        self.errors.push(message);
        self.fatal = Some(kind);
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    pub fn record_inserted(&mut self) {
        self.inserted += 1;
    }

    pub fn record_updated(&mut self) {
        self.updated += 1;
    }

    pub fn nav_point_upserted(&mut self) {
        self.nav_points += 1;
    }

    pub fn metrics_updated(&mut self) {
        self.metrics += 1;
    }

    pub fn status(&self) -> SyncStatus {
        if self.fatal.is_some() {
            SyncStatus::FatalError
        } else if !self.errors.is_empty() {
            SyncStatus::SuccessWithWarnings
        } else {
            SyncStatus::Success
        }
    }

    pub fn finish(self) -> SyncOutcome {
        let status = self.status();
        SyncOutcome {
            run_id: self.run_id,
            sync_type: self.sync_type,
            status,
            records_processed: self.processed,
            records_updated: self.updated,
            records_inserted: self.inserted,
            nav_points_upserted: self.nav_points,
            metrics_updated: self.metrics,
            warnings: self.warnings.iter().map(ToString::to_string).collect(),
            errors: self.errors,
            furthest_stage: self.furthest,
            fatal_kind: self.fatal,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }
}
