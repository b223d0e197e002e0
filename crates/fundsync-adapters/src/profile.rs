//! Table profiles: which Bitable table plays which role, and how its columns map
//! onto canonical fund fields. Loaded from `tables.yaml`, with compiled-in defaults.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::normalize::FieldHint;
use crate::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    NavHistory,
    Profit,
    Fof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Name,
    ExternalId,
    Strategy,
    Manager,
    Status,
    NavDate,
    UnitNav,
    CumulativeNav,
    Cost,
    Concentration,
    YearlyReturn,
    WeeklyPnl,
    DailyPnl,
    YearlyPnl,
    DailyCapitalUsage,
    TotalAssets,
    MarketValue,
    PositionChange,
}

impl CanonicalField {
    pub fn hint(&self) -> FieldHint {
        match self {
            CanonicalField::Name | CanonicalField::ExternalId => FieldHint::Text,
            CanonicalField::Strategy | CanonicalField::Manager | CanonicalField::Status => {
                FieldHint::Categorical
            }
            CanonicalField::NavDate => FieldHint::Date,
            _ => FieldHint::Number,
        }
    }

    /// Ratios stored as decimal fractions rather than amounts.
    pub fn is_fraction(&self) -> bool {
        matches!(self, CanonicalField::Concentration | CanonicalField::YearlyReturn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableProfile {
    pub table_id: String,
    pub role: TableRole,
    /// `main` or `fof`; copied onto funds sourced from this table.
    pub source_label: String,
    pub fields: BTreeMap<String, CanonicalField>,
    /// Values used when a record leaves a categorical field empty.
    #[serde(default)]
    pub defaults: BTreeMap<CanonicalField, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableProfile>,
    /// Static option id -> label pairs, used only when live definitions miss.
    #[serde(default)]
    pub fallback_labels: BTreeMap<String, String>,
}

fn profile(
    table_id: &str,
    role: TableRole,
    source_label: &str,
    fields: &[(&str, CanonicalField)],
    defaults: &[(CanonicalField, &str)],
) -> TableProfile {
    TableProfile {
        table_id: table_id.to_string(),
        role,
        source_label: source_label.to_string(),
        fields: fields
            .iter()
            .map(|(name, field)| (name.to_string(), *field))
            .collect(),
        defaults: defaults
            .iter()
            .map(|(field, value)| (*field, value.to_string()))
            .collect(),
    }
}

impl TableRegistry {
    /// The three-table layout of the production Bitable app.
    pub fn builtin() -> Self {
        use CanonicalField::*;

        let nav_history = profile(
            "tblcXqDbfgA0x533",
            TableRole::NavHistory,
            "main",
            &[
                ("基金名称", Name),
                ("基金代码", ExternalId),
                ("净值日期", NavDate),
                ("单位净值", UnitNav),
                ("虚拟净值", CumulativeNav),
                ("投资成本", Cost),
                ("本年收益率", YearlyReturn),
                ("资产净值", TotalAssets),
                ("状态", Status),
                ("策略", Strategy),
                ("投资经理", Manager),
                ("市值", MarketValue),
                ("持仓变化", PositionChange),
                ("当日盈亏", DailyPnl),
            ],
            &[],
        );
        let profit = profile(
            "tblcK2mWFtgob3Dg",
            TableRole::Profit,
            "main",
            &[
                ("基金名称", Name),
                ("策略类型", Strategy),
                ("集中度", Concentration),
                ("日均资金占用", DailyCapitalUsage),
                ("本周收益", WeeklyPnl),
                ("本年收益", YearlyPnl),
                ("本日盈亏", DailyPnl),
            ],
            &[],
        );
        let fof = profile(
            "tblXwpq4lQzfymME",
            TableRole::Fof,
            "fof",
            &[
                ("基金名称", Name),
                ("净值日期", NavDate),
                ("资产净值", TotalAssets),
                ("成本", Cost),
            ],
            &[(Strategy, "FOF"), (Manager, "第一创业")],
        );

        Self {
            tables: vec![nav_history, profit, fof],
            fallback_labels: BTreeMap::new(),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, AdapterError> {
        let registry: Self = serde_yaml::from_str(raw)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| AdapterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Loads `path` when it exists, otherwise the compiled-in layout.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, AdapterError> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::builtin()),
        }
    }

    fn validate(&self) -> Result<(), AdapterError> {
        for table in &self.tables {
            if !table.fields.values().any(|f| *f == CanonicalField::Name) {
                return Err(AdapterError::Config(format!(
                    "table {} maps no column to name",
                    table.table_id
                )));
            }
        }
        Ok(())
    }

    /// Profiles for `table_ids`, or every profile when the list is empty.
    pub fn select(&self, table_ids: &[String]) -> Result<Vec<TableProfile>, AdapterError> {
        if table_ids.is_empty() {
            return Ok(self.tables.clone());
        }
        table_ids
            .iter()
            .map(|id| {
                self.tables
                    .iter()
                    .find(|t| &t.table_id == id)
                    .cloned()
                    .ok_or_else(|| AdapterError::UnknownTable(id.clone()))
            })
            .collect()
    }
}
