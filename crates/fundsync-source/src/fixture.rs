use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use fundsync_core::{FieldDefinition, RawSourceRecord};
use serde::{Deserialize, Serialize};

use crate::{BitableSource, SourceError};

/// On-disk shape of a fixture: one entry per table id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub tables: BTreeMap<String, FixtureTable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureTable {
    #[serde(default)]
    pub records: Vec<RawSourceRecord>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

/// Offline `BitableSource` backed by captured table payloads.
#[derive(Debug, Default)]
pub struct FixtureSource {
    tables: BTreeMap<String, FixtureTable>,
    fail_with: Option<SourceError>,
    failing_tables: BTreeMap<String, SourceError>,
    field_fetches: Mutex<BTreeMap<String, usize>>,
}

impl FixtureSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            tables: bundle.tables,
            ..Self::default()
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| SourceError::Fixture(format!("reading {}: {err}", path.display())))?;
        let bundle: FixtureBundle = serde_json::from_str(&raw)
            .map_err(|err| SourceError::Fixture(format!("parsing {}: {err}", path.display())))?;
        Ok(Self::new(bundle))
    }

    pub fn with_table(
        mut self,
        table_id: impl Into<String>,
        records: Vec<RawSourceRecord>,
        fields: Vec<FieldDefinition>,
    ) -> Self {
        self.tables
            .insert(table_id.into(), FixtureTable { records, fields });
        self
    }

    /// Every call fails with `err`; used to exercise fatal fetch paths.
    pub fn failing(err: SourceError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    /// Calls for `table_id` fail with `err`; other tables are served normally.
    pub fn with_failing_table(mut self, table_id: impl Into<String>, err: SourceError) -> Self {
        self.failing_tables.insert(table_id.into(), err);
        self
    }

    pub fn table_ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// How many times `list_fields` was called for `table_id`.
    pub fn field_fetches(&self, table_id: &str) -> usize {
        self.field_fetches
            .lock()
            .map(|counts| counts.get(table_id).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn table(&self, table_id: &str) -> Result<&FixtureTable, SourceError> {
        if let Some(err) = self.fail_with.as_ref().or_else(|| self.failing_tables.get(table_id)) {
            return Err(err.clone());
        }
        self.tables
            .get(table_id)
            .ok_or_else(|| SourceError::Fixture(format!("table {table_id} not in fixture")))
    }
}

#[async_trait]
impl BitableSource for FixtureSource {
    async fn list_records(&self, table_id: &str) -> Result<Vec<RawSourceRecord>, SourceError> {
        let table = self.table(table_id)?;
        Ok(table
            .records
            .iter()
            .cloned()
            .map(|mut record| {
                record.source_table = table_id.to_string();
                record
            })
            .collect())
    }

    async fn list_fields(&self, table_id: &str) -> Result<Vec<FieldDefinition>, SourceError> {
        if let Ok(mut counts) = self.field_fetches.lock() {
            *counts.entry(table_id.to_string()).or_default() += 1;
        }
        Ok(self.table(table_id)?.fields.clone())
    }
}
