//! Option resolver: turns option ids from select and lookup fields into labels.
//!
//! Lookup fields point at a field in another table, so resolving them takes two
//! steps: fetch the target table's field definitions, then read the options of the
//! field whose id matches. Both results are cached for the lifetime of one run.
//!
//! A target fetch that fails because the service is unreachable or rejects us is
//! kept as the resolver's fatal error; callers must check `take_fatal` and end the
//! run rather than store labels resolved without it.

use std::collections::{BTreeMap, HashMap, HashSet};

use fundsync_core::{FieldDefinition, OptionDefinition, SelectOption, SyncWarning, WarningKind};
use fundsync_source::{BitableSource, SourceError};
use tracing::{debug, warn};

type OptionIndex = BTreeMap<String, OptionDefinition>;

pub struct OptionResolver<'a> {
    source: &'a dyn BitableSource,
    default_label: String,
    fallbacks: BTreeMap<String, String>,
    target_fields: HashMap<String, Vec<FieldDefinition>>,
    indexes: HashMap<String, OptionIndex>,
    first_seen: HashMap<String, String>,
    reported: HashSet<(String, String)>,
    warnings: Vec<SyncWarning>,
    fatal: Option<(String, SourceError)>,
}

/// Option ids Bitable generates look like `optXXXXXX`.
pub fn looks_like_option_id(value: &str) -> bool {
    value.len() > 3
        && value.starts_with("opt")
        && value.chars().all(|c| c.is_ascii_alphanumeric())
}

impl<'a> OptionResolver<'a> {
    pub fn new(source: &'a dyn BitableSource, default_label: impl Into<String>) -> Self {
        Self {
            source,
            default_label: default_label.into(),
            fallbacks: BTreeMap::new(),
            target_fields: HashMap::new(),
            indexes: HashMap::new(),
            first_seen: HashMap::new(),
            reported: HashSet::new(),
            warnings: Vec::new(),
            fatal: None,
        }
    }

    /// Static id -> label pairs consulted only after the live definitions miss.
    pub fn with_fallbacks(mut self, fallbacks: BTreeMap<String, String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn take_warnings(&mut self) -> Vec<SyncWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// The first lookup target fetch that must abort the run, with its table id.
    pub fn take_fatal(&mut self) -> Option<(String, SourceError)> {
        self.fatal.take()
    }

    /// Number of distinct tables whose field definitions were fetched.
    pub fn fetched_targets(&self) -> usize {
        self.target_fields.len()
    }

    /// Resolves a categorical cell value. Never fails: unknown ids map to the
    /// default label and are reported once per field.
    pub async fn resolve(&mut self, value: &str, field: &FieldDefinition) -> String {
        let value = value.trim();
        if value.is_empty() || value == self.default_label {
            return self.default_label.clone();
        }

        let index_key = self.ensure_index(field).await;
        if self.fatal.is_some() {
            return self.default_label.clone();
        }
        let resolved = index_key
            .as_deref()
            .and_then(|key| self.indexes.get(key))
            .and_then(|index| {
                index
                    .get(value)
                    .or_else(|| index.values().find(|def| def.display_label == value))
            })
            .map(|def| def.display_label.clone());
        if let Some(label) = resolved {
            return label;
        }

        if !looks_like_option_id(value) {
            // Already a label; Bitable returns select values by name.
            return value.to_string();
        }

        if let Some(label) = self.fallbacks.get(value).cloned() {
            self.report(
                WarningKind::FallbackOption,
                &field.field_name,
                value,
                format!(
                    "field {}: option {value} resolved from static fallback table as {label:?}",
                    field.field_name
                ),
            );
            return label;
        }

        self.report(
            WarningKind::UnresolvedOption,
            &field.field_name,
            value,
            format!(
                "field {}: option {value} not found; using {:?}",
                field.field_name, self.default_label
            ),
        );
        self.default_label.clone()
    }

    fn report(&mut self, kind: WarningKind, field: &str, value: &str, message: String) {
        if self.reported.insert((field.to_string(), value.to_string())) {
            warn!(%message, "option resolution");
            self.warnings.push(SyncWarning::new(kind, message));
        }
    }

    async fn ensure_index(&mut self, field: &FieldDefinition) -> Option<String> {
        if let Some(target) = field.lookup_target() {
            let key = format!("lookup:{target}");
            if !self.indexes.contains_key(&key) {
                let options = self
                    .target_options(&target.table_id, &target.field_id)
                    .await;
                let index = self.build_index(&target.table_id, &target.field_id, &options);
                self.indexes.insert(key.clone(), index);
            }
            return Some(key);
        }

        if field.is_select() {
            let key = format!("select:{}:{}", field.field_id, field.field_name);
            if !self.indexes.contains_key(&key) {
                let options = field.options().to_vec();
                let index = self.build_index("", &field.field_id, &options);
                self.indexes.insert(key.clone(), index);
            }
            return Some(key);
        }

        None
    }

    async fn target_options(&mut self, table_id: &str, field_id: &str) -> Vec<SelectOption> {
        if !self.target_fields.contains_key(table_id) {
            let fields = match self.source.list_fields(table_id).await {
                Ok(fields) => {
                    debug!(table_id, fields = fields.len(), "fetched lookup target fields");
                    fields
                }
                Err(err) if err.aborts_run() => {
                    warn!(table_id, error = %err, "lookup target fetch failed");
                    if self.fatal.is_none() {
                        self.fatal = Some((table_id.to_string(), err));
                    }
                    Vec::new()
                }
                Err(err) => {
                    let message =
                        format!("could not fetch field definitions of lookup target {table_id}: {err}");
                    warn!(%message, "option resolution");
                    self.warnings
                        .push(SyncWarning::new(WarningKind::Source, message));
                    Vec::new()
                }
            };
            self.target_fields.insert(table_id.to_string(), fields);
        }

        self.target_fields
            .get(table_id)
            .and_then(|fields| fields.iter().find(|f| f.field_id == field_id))
            .map(|f| f.options().to_vec())
            .unwrap_or_default()
    }

    fn build_index(&mut self, table_id: &str, field_id: &str, options: &[SelectOption]) -> OptionIndex {
        let mut index = OptionIndex::new();
        for option in options {
            let label = match self.first_seen.get(&option.id) {
                Some(existing) if existing != &option.name => {
                    let message = format!(
                        "option {} labelled {:?} in {table_id}/{field_id} but {:?} earlier; keeping {:?}",
                        option.id, option.name, existing, existing
                    );
                    warn!(%message, "option resolution");
                    self.warnings
                        .push(SyncWarning::new(WarningKind::ConflictingOption, message));
                    existing.clone()
                }
                Some(existing) => existing.clone(),
                None => {
                    self.first_seen
                        .insert(option.id.clone(), option.name.clone());
                    option.name.clone()
                }
            };
            index.entry(option.id.clone()).or_insert(OptionDefinition {
                option_id: option.id.clone(),
                display_label: label,
                owning_field: field_id.to_string(),
                owning_table: table_id.to_string(),
            });
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundsync_core::FieldProperty;
    use fundsync_source::FixtureSource;

    fn option(id: &str, name: &str) -> SelectOption {
        SelectOption {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    fn select_field(name: &str, options: Vec<SelectOption>) -> FieldDefinition {
        FieldDefinition {
            field_id: format!("fld_{name}"),
            field_name: name.to_string(),
            field_type: 3,
            ui_type: Some("SingleSelect".to_string()),
            property: Some(FieldProperty {
                options,
                ..FieldProperty::default()
            }),
        }
    }

    fn lookup_field(name: &str, table: &str, field: &str) -> FieldDefinition {
        FieldDefinition {
            field_id: format!("fld_{name}"),
            field_name: name.to_string(),
            field_type: 19,
            ui_type: Some("Lookup".to_string()),
            property: Some(FieldProperty {
                options: Vec::new(),
                target_table: Some(table.to_string()),
                target_field: Some(field.to_string()),
            }),
        }
    }

    fn strategy_source() -> FixtureSource {
        let mut strategy = select_field("策略", vec![option("opt123", "CTA"), option("optAbc", "指增")]);
        strategy.field_id = "fldStrategy".to_string();
        FixtureSource::default().with_table("tblStrategy", Vec::new(), vec![strategy])
    }

    #[tokio::test]
    async fn lookup_ids_resolve_through_target_table_once() {
        let source = strategy_source();
        let mut resolver = OptionResolver::new(&source, "unknown");
        let field = lookup_field("策略类型", "tblStrategy", "fldStrategy");

        assert_eq!(resolver.resolve("opt123", &field).await, "CTA");
        assert_eq!(resolver.resolve("optAbc", &field).await, "指增");
        assert_eq!(resolver.resolve("CTA", &field).await, "CTA");
        assert_eq!(source.field_fetches("tblStrategy"), 1);
        assert_eq!(resolver.fetched_targets(), 1);
        assert!(resolver.take_warnings().is_empty());
    }

    #[tokio::test]
    async fn unknown_id_maps_to_default_with_exactly_one_warning() {
        let source = strategy_source();
        let mut resolver = OptionResolver::new(&source, "unknown");
        let field = lookup_field("策略类型", "tblStrategy", "fldStrategy");

        assert_eq!(resolver.resolve("optMissing1", &field).await, "unknown");
        assert_eq!(resolver.resolve("optMissing1", &field).await, "unknown");
        let warnings = resolver.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::UnresolvedOption);
    }

    #[tokio::test]
    async fn select_fields_resolve_without_remote_fetch() {
        let source = FixtureSource::failing(SourceError::Auth("unused".into()));
        let mut resolver = OptionResolver::new(&source, "unknown");
        let field = select_field("状态", vec![option("optFl1SLci", "已赎回")]);

        assert_eq!(resolver.resolve("optFl1SLci", &field).await, "已赎回");
        assert_eq!(resolver.resolve("正常", &field).await, "正常");
        assert_eq!(resolver.fetched_targets(), 0);
    }

    #[tokio::test]
    async fn fallback_labels_apply_only_after_live_miss_and_are_flagged() {
        let source = strategy_source();
        let fallbacks = BTreeMap::from([
            ("opt123".to_string(), "WRONG".to_string()),
            ("optvE8Axra".to_string(), "中性".to_string()),
        ]);
        let mut resolver = OptionResolver::new(&source, "unknown").with_fallbacks(fallbacks);
        let field = lookup_field("策略类型", "tblStrategy", "fldStrategy");

        assert_eq!(resolver.resolve("opt123", &field).await, "CTA");
        assert_eq!(resolver.resolve("optvE8Axra", &field).await, "中性");
        let warnings = resolver.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::FallbackOption);
    }

    #[tokio::test]
    async fn conflicting_labels_keep_first_seen() {
        let source = FixtureSource::default();
        let mut resolver = OptionResolver::new(&source, "unknown");
        let first = select_field("策略", vec![option("optShared", "CTA")]);
        let second = select_field("策略2", vec![option("optShared", "宏观")]);

        assert_eq!(resolver.resolve("optShared", &first).await, "CTA");
        assert_eq!(resolver.resolve("optShared", &second).await, "CTA");
        let warnings = resolver.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::ConflictingOption);
    }

    #[tokio::test]
    async fn unreachable_lookup_target_is_fatal_not_unknown() {
        let source = strategy_source().with_failing_table(
            "tblStrategy",
            SourceError::Transient {
                attempts: 4,
                message: "operation timed out".into(),
                timed_out: true,
            },
        );
        let mut resolver = OptionResolver::new(&source, "unknown");
        let field = lookup_field("策略类型", "tblStrategy", "fldStrategy");

        resolver.resolve("opt123", &field).await;
        resolver.resolve("optAbc", &field).await;
        assert!(resolver.has_fatal());
        assert_eq!(source.field_fetches("tblStrategy"), 1);
        assert!(resolver.take_warnings().is_empty());

        let (table_id, err) = resolver.take_fatal().expect("fatal recorded");
        assert_eq!(table_id, "tblStrategy");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn failed_target_fetch_warns_and_caches_empty_target() {
        let source = FixtureSource::default();
        let mut resolver = OptionResolver::new(&source, "unknown");
        let field = lookup_field("策略类型", "tblGone", "fldStrategy");

        assert_eq!(resolver.resolve("opt123", &field).await, "unknown");
        assert_eq!(resolver.resolve("optAbc", &field).await, "unknown");
        assert_eq!(source.field_fetches("tblGone"), 1);

        let kinds: Vec<_> = resolver.take_warnings().into_iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::Source,
                WarningKind::UnresolvedOption,
                WarningKind::UnresolvedOption
            ]
        );
    }
}
