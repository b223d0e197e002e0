//! Record mapper: extracts canonical values from raw rows, groups rows of the same
//! fund across tables and merges them into one `CanonicalFund` plus NAV history.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use fundsync_core::{
    name_identity, CanonicalFund, FieldDefinition, FundStatus, NavHistoryPoint, RawSourceRecord,
    SyncWarning, WarningKind,
};
use tracing::warn;

use crate::normalize::{FieldHint, Normalizer};
use crate::options::OptionResolver;
use crate::profile::{CanonicalField, TableProfile, TableRole};

/// Canonical values of one source row. Only fields present in the row are kept, so
/// an absent column never overrides a value sourced from another table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MappedRecord {
    pub record_id: String,
    pub table_id: String,
    pub role: Option<TableRole>,
    pub source_label: String,
    pub nav_date: Option<NaiveDate>,
    pub numbers: BTreeMap<CanonicalField, f64>,
    pub texts: BTreeMap<CanonicalField, String>,
    /// Categoricals the row carried but that resolved to the default label. They
    /// only apply when no table supplies a real label.
    pub unresolved: BTreeMap<CanonicalField, String>,
}

impl MappedRecord {
    pub fn name(&self) -> Option<&str> {
        self.texts
            .get(&CanonicalField::Name)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }

    pub fn external_id(&self) -> Option<&str> {
        self.texts
            .get(&CanonicalField::ExternalId)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }
}

fn is_blank(raw: &serde_json::Value) -> bool {
    match raw {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Stands in for a column the field-definition endpoint did not describe.
fn plain_text_field(name: &str) -> FieldDefinition {
    FieldDefinition {
        field_id: String::new(),
        field_name: name.to_string(),
        field_type: 1,
        ui_type: Some("Text".to_string()),
        property: None,
    }
}

/// Per-field order in which table roles are trusted.
fn role_priority(field: CanonicalField) -> [TableRole; 3] {
    use CanonicalField::*;
    match field {
        Concentration | WeeklyPnl | DailyPnl | YearlyPnl | DailyCapitalUsage => {
            [TableRole::Profit, TableRole::NavHistory, TableRole::Fof]
        }
        _ => [TableRole::NavHistory, TableRole::Fof, TableRole::Profit],
    }
}

pub struct RecordMapper;

impl RecordMapper {
    pub async fn extract(
        record: &RawSourceRecord,
        profile: &TableProfile,
        field_defs: &HashMap<String, FieldDefinition>,
        normalizer: &mut Normalizer,
        resolver: &mut OptionResolver<'_>,
    ) -> MappedRecord {
        let mut mapped = MappedRecord {
            record_id: record.record_id.clone(),
            table_id: profile.table_id.clone(),
            role: Some(profile.role),
            source_label: profile.source_label.clone(),
            ..MappedRecord::default()
        };

        for (column, field) in &profile.fields {
            let Some(raw) = record.field(column).filter(|raw| !is_blank(raw)) else {
                continue;
            };

            match field.hint() {
                FieldHint::Date => {
                    if let Some(date) = normalizer
                        .normalize_field(column, Some(raw), FieldHint::Date)
                        .as_date()
                    {
                        mapped.nav_date = Some(date);
                    }
                }
                FieldHint::Number => {
                    let value = if field.is_fraction() {
                        normalizer.fraction_field(column, Some(raw))
                    } else {
                        normalizer
                            .normalize_field(column, Some(raw), FieldHint::Number)
                            .as_number()
                    };
                    mapped.numbers.insert(*field, value);
                }
                FieldHint::Text => {
                    let text = normalizer.normalize_field(column, Some(raw), FieldHint::Text);
                    if !text.as_text().is_empty() {
                        mapped.texts.insert(*field, text.as_text().to_string());
                    }
                }
                FieldHint::Categorical => {
                    let value = normalizer.normalize_field(column, Some(raw), FieldHint::Categorical);
                    let label = match field_defs.get(column) {
                        Some(def) => resolver.resolve(value.as_text(), def).await,
                        None => resolver.resolve(value.as_text(), &plain_text_field(column)).await,
                    };
                    if label == normalizer.unknown_label() {
                        mapped.unresolved.insert(*field, label);
                    } else {
                        mapped.texts.insert(*field, label);
                    }
                }
            }
        }

        for (field, value) in &profile.defaults {
            mapped
                .texts
                .entry(*field)
                .or_insert_with(|| value.clone());
        }

        mapped
    }

    /// Buckets rows by fund identity: external id when present, else the external id
    /// another row carries for the same name, else a UUIDv5 of the name.
    pub fn group_by_identity(
        records: Vec<MappedRecord>,
        warnings: &mut Vec<SyncWarning>,
    ) -> BTreeMap<String, Vec<MappedRecord>> {
        let mut external_by_name: HashMap<String, String> = HashMap::new();
        for record in &records {
            if let (Some(name), Some(external)) = (record.name(), record.external_id()) {
                let known = external_by_name
                    .entry(name.to_string())
                    .or_insert_with(|| external.to_string());
                if known.as_str() != external {
                    let message = format!(
                        "fund {name:?} carries external ids {known} and {external}; keeping {known}"
                    );
                    warn!(%message, "identity conflict");
                    warnings.push(SyncWarning::new(WarningKind::Mapping, message));
                }
            }
        }

        let mut groups: BTreeMap<String, Vec<MappedRecord>> = BTreeMap::new();
        for record in records {
            let identity = match (record.external_id(), record.name()) {
                (Some(external), _) => external.to_string(),
                (None, Some(name)) => external_by_name
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name_identity(name)),
                (None, None) => {
                    let message = format!(
                        "record {} in {} has no fund name; skipped",
                        record.record_id, record.table_id
                    );
                    warn!(%message, "mapping");
                    warnings.push(SyncWarning::new(WarningKind::Mapping, message));
                    continue;
                }
            };
            groups.entry(identity).or_default().push(record);
        }
        groups
    }

    /// Merges all rows of one fund. Each field is taken from the first role in its
    /// priority list that supplies it; within a role the latest NAV date wins.
    pub fn merge(records: &[MappedRecord], identity: &str) -> CanonicalFund {
        let number = |field: CanonicalField| pick(records, field, |r| r.numbers.get(&field).copied());
        let text = |field: CanonicalField| {
            pick(records, field, |r| r.texts.get(&field).cloned())
                .or_else(|| pick(records, field, |r| r.unresolved.get(&field).cloned()))
        };

        let cost = number(CanonicalField::Cost).unwrap_or_default();
        let weekly_pnl = number(CanonicalField::WeeklyPnl).unwrap_or_default();
        let daily_pnl = number(CanonicalField::DailyPnl).unwrap_or_default();
        let per_cost = |pnl: f64| if cost != 0.0 { pnl / cost } else { 0.0 };

        let only_fof = !records.is_empty()
            && records.iter().all(|r| r.source_label == "fof");

        CanonicalFund {
            record_id: identity.to_string(),
            name: text(CanonicalField::Name).unwrap_or_default(),
            strategy: text(CanonicalField::Strategy).unwrap_or_default(),
            manager: text(CanonicalField::Manager).unwrap_or_default(),
            cost,
            concentration: number(CanonicalField::Concentration).unwrap_or_default(),
            weekly_return: per_cost(weekly_pnl),
            daily_return: per_cost(daily_pnl),
            yearly_return: number(CanonicalField::YearlyReturn).unwrap_or_default(),
            weekly_pnl,
            daily_pnl,
            yearly_pnl: number(CanonicalField::YearlyPnl).unwrap_or_default(),
            daily_capital_usage: number(CanonicalField::DailyCapitalUsage).unwrap_or_default(),
            total_assets: number(CanonicalField::TotalAssets).unwrap_or_default(),
            latest_nav_date: records.iter().filter_map(|r| r.nav_date).max(),
            status: text(CanonicalField::Status)
                .map(|label| FundStatus::from_label(&label))
                .unwrap_or_default(),
            source_table: if only_fof { "fof" } else { "main" }.to_string(),
        }
    }

    /// NAV history points from the fund's NavHistory rows, ordered by date.
    pub fn nav_points(
        records: &[MappedRecord],
        identity: &str,
        warnings: &mut Vec<SyncWarning>,
    ) -> Vec<NavHistoryPoint> {
        let mut by_date: BTreeMap<NaiveDate, &MappedRecord> = BTreeMap::new();
        for record in records
            .iter()
            .filter(|r| r.role == Some(TableRole::NavHistory))
        {
            match record.nav_date {
                Some(date) => {
                    by_date.insert(date, record);
                }
                None => {
                    let message = format!(
                        "NAV row {} of fund {identity} has no date; skipped",
                        record.record_id
                    );
                    warn!(%message, "mapping");
                    warnings.push(SyncWarning::new(WarningKind::Mapping, message));
                }
            }
        }

        let mut previous: Option<f64> = None;
        by_date
            .into_iter()
            .map(|(nav_date, record)| {
                let value = |field: CanonicalField| record.numbers.get(&field).copied();
                let unit_nav = value(CanonicalField::UnitNav).unwrap_or_default();
                let cumulative_nav = value(CanonicalField::CumulativeNav).unwrap_or(unit_nav);
                let daily_return = match previous {
                    Some(prev) if prev > 0.0 && cumulative_nav > 0.0 => cumulative_nav / prev - 1.0,
                    _ => 0.0,
                };
                previous = Some(cumulative_nav);
                NavHistoryPoint {
                    fund_id: identity.to_string(),
                    nav_date,
                    unit_nav,
                    cumulative_nav,
                    daily_return,
                    market_value: value(CanonicalField::MarketValue),
                    cost: value(CanonicalField::Cost),
                    position_change: value(CanonicalField::PositionChange),
                    daily_pnl: value(CanonicalField::DailyPnl),
                }
            })
            .collect()
    }
}

fn pick<T>(
    records: &[MappedRecord],
    field: CanonicalField,
    get: impl Fn(&MappedRecord) -> Option<T>,
) -> Option<T> {
    role_priority(field).into_iter().find_map(|role| {
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.role == Some(role))
            .filter_map(|(index, r)| get(r).map(|v| ((r.nav_date, index), v)))
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, v)| v)
    })
}
