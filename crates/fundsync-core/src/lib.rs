//! Core domain model for fundsync: raw source records, canonical funds, NAV
//! history, derived metrics and sync outcomes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fundsync-core";

/// Label every unresolvable categorical value falls back to.
pub const UNKNOWN_LABEL: &str = "unknown";

/// One row as delivered by a Bitable records page. Discarded after mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceRecord {
    pub record_id: String,
    #[serde(default)]
    pub source_table: String,
    #[serde(default)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl RawSourceRecord {
    pub fn field(&self, name: &str) -> Option<&JsonValue> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

/// Field metadata from the per-table field-definition endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    #[serde(default)]
    pub field_id: String,
    pub field_name: String,
    #[serde(rename = "type", default)]
    pub field_type: i64,
    #[serde(default)]
    pub ui_type: Option<String>,
    #[serde(default)]
    pub property: Option<FieldProperty>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldProperty {
    #[serde(default)]
    pub options: Vec<SelectOption>,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub target_field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    #[serde(alias = "option_id")]
    pub id: String,
    pub name: String,
}

impl FieldDefinition {
    pub fn is_lookup(&self) -> bool {
        self.ui_type.as_deref() == Some("Lookup") || self.field_type == 19
    }

    pub fn is_select(&self) -> bool {
        matches!(self.ui_type.as_deref(), Some("SingleSelect") | Some("MultiSelect"))
            || self.field_type == 3
            || self.field_type == 4
    }

    /// `(target_table, target_field)` for lookup fields with complete metadata.
    pub fn lookup_target(&self) -> Option<LookupTarget> {
        if !self.is_lookup() {
            return None;
        }
        let property = self.property.as_ref()?;
        Some(LookupTarget {
            table_id: property.target_table.clone()?,
            field_id: property.target_field.clone()?,
        })
    }

    pub fn options(&self) -> &[SelectOption] {
        self.property
            .as_ref()
            .map(|p| p.options.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LookupTarget {
    pub table_id: String,
    pub field_id: String,
}

impl fmt::Display for LookupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table_id, self.field_id)
    }
}

/// Authoritative option id -> label entry, owned by the table a lookup points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDefinition {
    pub option_id: String,
    pub display_label: String,
    pub owning_field: String,
    pub owning_table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundStatus {
    #[default]
    Normal,
    Redeemed,
}

impl FundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundStatus::Normal => "normal",
            FundStatus::Redeemed => "redeemed",
        }
    }

    /// Maps a sourced status label. Anything not recognisably redeemed is normal.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label.contains("赎回") || label.eq_ignore_ascii_case("redeemed") {
            FundStatus::Redeemed
        } else {
            FundStatus::Normal
        }
    }
}

/// One fund per identity after merging every source table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalFund {
    pub record_id: String,
    pub name: String,
    pub strategy: String,
    pub manager: String,
    pub cost: f64,
    pub concentration: f64,
    pub weekly_return: f64,
    pub daily_return: f64,
    pub yearly_return: f64,
    pub weekly_pnl: f64,
    pub daily_pnl: f64,
    pub yearly_pnl: f64,
    pub daily_capital_usage: f64,
    pub total_assets: f64,
    pub latest_nav_date: Option<NaiveDate>,
    pub status: FundStatus,
    pub source_table: String,
}

/// Derived metrics; always recomputed from the full NAV series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FundMetrics {
    pub max_drawdown: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub annualized_return: f64,
}

/// Persisted fund row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFund {
    #[serde(flatten)]
    pub fund: CanonicalFund,
    #[serde(flatten)]
    pub metrics: FundMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavHistoryPoint {
    pub fund_id: String,
    pub nav_date: NaiveDate,
    pub unit_nav: f64,
    pub cumulative_nav: f64,
    pub daily_return: f64,
    pub market_value: Option<f64>,
    pub cost: Option<f64>,
    pub position_change: Option<f64>,
    pub daily_pnl: Option<f64>,
}

/// Stages of one sync run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Idle,
    Fetching,
    Normalizing,
    Mapping,
    Reconciling,
    ComputingMetrics,
    Reporting,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Idle => "idle",
            SyncStage::Fetching => "fetching",
            SyncStage::Normalizing => "normalizing",
            SyncStage::Mapping => "mapping",
            SyncStage::Reconciling => "reconciling",
            SyncStage::ComputingMetrics => "computing_metrics",
            SyncStage::Reporting => "reporting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            SyncStage::Idle,
            SyncStage::Fetching,
            SyncStage::Normalizing,
            SyncStage::Mapping,
            SyncStage::Reconciling,
            SyncStage::ComputingMetrics,
            SyncStage::Reporting,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }

    pub fn next(self) -> Self {
        match self {
            SyncStage::Idle => SyncStage::Fetching,
            SyncStage::Fetching => SyncStage::Normalizing,
            SyncStage::Normalizing => SyncStage::Mapping,
            SyncStage::Mapping => SyncStage::Reconciling,
            SyncStage::Reconciling => SyncStage::ComputingMetrics,
            SyncStage::ComputingMetrics => SyncStage::Reporting,
            SyncStage::Reporting => SyncStage::Idle,
        }
    }

    /// Forward by one step, or a fatal jump straight to reporting.
    pub fn can_transition_to(self, to: SyncStage) -> bool {
        to == self.next() || (to == SyncStage::Reporting && self != SyncStage::Reporting)
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    SuccessWithWarnings,
    FatalError,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::SuccessWithWarnings => "success_with_warnings",
            SyncStatus::FatalError => "fatal_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(SyncStatus::Success),
            "success_with_warnings" => Some(SyncStatus::SuccessWithWarnings),
            "fatal_error" => Some(SyncStatus::FatalError),
            _ => None,
        }
    }
}

/// What ended a run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Auth,
    Fetch,
    Timeout,
    LockContention,
    Persistence,
}

impl FatalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalKind::Auth => "auth",
            FatalKind::Fetch => "fetch",
            FatalKind::Timeout => "timeout",
            FatalKind::LockContention => "lock_contention",
            FatalKind::Persistence => "persistence",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(FatalKind::Auth),
            "fetch" => Some(FatalKind::Fetch),
            "timeout" => Some(FatalKind::Timeout),
            "lock_contention" => Some(FatalKind::LockContention),
            "persistence" => Some(FatalKind::Persistence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Normalization,
    UnresolvedOption,
    ConflictingOption,
    FallbackOption,
    Mapping,
    Source,
    Persistence,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WarningKind::Normalization => "normalization",
            WarningKind::UnresolvedOption => "unresolved_option",
            WarningKind::ConflictingOption => "conflicting_option",
            WarningKind::FallbackOption => "fallback_option",
            WarningKind::Mapping => "mapping",
            WarningKind::Source => "source",
            WarningKind::Persistence => "persistence",
        };
        f.write_str(s)
    }
}

/// A recovered, non-fatal problem surfaced in the run outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl SyncWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyncWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Append-only record of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub sync_type: String,
    pub status: SyncStatus,
    pub records_processed: u32,
    pub records_updated: u32,
    pub records_inserted: u32,
    pub nav_points_upserted: u32,
    pub metrics_updated: u32,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub furthest_stage: SyncStage,
    pub fatal_kind: Option<FatalKind>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl SyncOutcome {
    /// Whether the run got far enough to touch the store.
    pub fn reached_reconciliation(&self) -> bool {
        self.furthest_stage >= SyncStage::Reconciling
    }
}

/// Deterministic identity for funds that carry no external id.
pub fn name_identity(name: &str) -> String {
    let key = format!("fund-name:{}", name.trim());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_follow_pipeline_order_or_jump_to_reporting() {
        assert!(SyncStage::Idle.can_transition_to(SyncStage::Fetching));
        assert!(SyncStage::Fetching.can_transition_to(SyncStage::Reporting));
        assert!(SyncStage::Mapping.can_transition_to(SyncStage::Reconciling));
        assert!(!SyncStage::Fetching.can_transition_to(SyncStage::Reconciling));
        assert!(SyncStage::Reporting.can_transition_to(SyncStage::Idle));
        assert!(!SyncStage::Reporting.can_transition_to(SyncStage::Reporting));
        assert!(SyncStage::ComputingMetrics > SyncStage::Reconciling);
    }

    #[test]
    fn status_labels_map_to_fund_status() {
        assert_eq!(FundStatus::from_label("已赎回"), FundStatus::Redeemed);
        assert_eq!(FundStatus::from_label("Redeemed"), FundStatus::Redeemed);
        assert_eq!(FundStatus::from_label("正常"), FundStatus::Normal);
        assert_eq!(FundStatus::from_label(""), FundStatus::Normal);
    }

    #[test]
    fn field_definition_deserializes_lookup_metadata() {
        let def: FieldDefinition = serde_json::from_value(serde_json::json!({
            "field_id": "fld1",
            "field_name": "策略类型",
            "type": 19,
            "ui_type": "Lookup",
            "property": {"target_table": "tblStrategy", "target_field": "fldS"}
        }))
        .unwrap();
        assert_eq!(
            def.lookup_target(),
            Some(LookupTarget {
                table_id: "tblStrategy".into(),
                field_id: "fldS".into()
            })
        );
        assert!(def.options().is_empty());
    }

    #[test]
    fn name_identity_is_stable_and_trimmed() {
        assert_eq!(name_identity("ABC Fund"), name_identity(" ABC Fund "));
        assert_ne!(name_identity("ABC Fund"), name_identity("ABD Fund"));
    }

    #[test]
    fn enum_string_forms_round_trip() {
        for stage in [SyncStage::Fetching, SyncStage::ComputingMetrics] {
            assert_eq!(SyncStage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(SyncStatus::parse("fatal_error"), Some(SyncStatus::FatalError));
        assert_eq!(FatalKind::parse("lock_contention"), Some(FatalKind::LockContention));
    }
}
