//! Field normalizer: flattens Bitable's per-type value encodings into plain scalars.
//!
//! Never fails. Anything unparseable degrades to the typed zero value, bumps the
//! lenient-parse counter and leaves a warning behind for the run report.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use fundsync_core::{SyncWarning, WarningKind, UNKNOWN_LABEL};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Bitable returns date cells as UTC millisecond timestamps of local midnight.
const SOURCE_UTC_OFFSET_SECS: i32 = 8 * 3600;
const EXCEL_SERIAL_RANGE: std::ops::RangeInclusive<f64> = 40_000.0..=60_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldHint {
    Number,
    Text,
    Categorical,
    Date,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
    Date(Option<NaiveDate>),
}

impl Scalar {
    pub fn as_number(&self) -> f64 {
        match self {
            Scalar::Number(n) => *n,
            _ => 0.0,
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            Scalar::Text(s) => s,
            _ => "",
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Scalar::Date(d) => *d,
            _ => None,
        }
    }
}

/// Result of peeling wrappers off a raw cell.
enum Leaf<'a> {
    Missing,
    Value(&'a JsonValue),
    /// An object that carries neither `text` nor `value`.
    Opaque(&'a JsonValue),
}

fn unwrap_leaf(raw: &JsonValue) -> Leaf<'_> {
    match raw {
        JsonValue::Null => Leaf::Missing,
        JsonValue::String(s) if s.trim().is_empty() => Leaf::Missing,
        JsonValue::Array(items) => match items.first() {
            Some(first) => unwrap_leaf(first),
            None => Leaf::Missing,
        },
        JsonValue::Object(map) => match map.get("text").or_else(|| map.get("value")) {
            Some(inner) => unwrap_leaf(inner),
            None => Leaf::Opaque(raw),
        },
        other => Leaf::Value(other),
    }
}

fn strip_number_decorations(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '%' | ',' | '¥' | '￥' | '$') && !c.is_whitespace())
        .collect()
}

#[derive(Debug)]
pub struct Normalizer {
    unknown_label: String,
    lenient_parses: usize,
    field: Option<String>,
    warnings: Vec<SyncWarning>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(UNKNOWN_LABEL)
    }
}

impl Normalizer {
    pub fn new(unknown_label: impl Into<String>) -> Self {
        Self {
            unknown_label: unknown_label.into(),
            lenient_parses: 0,
            field: None,
            warnings: Vec::new(),
        }
    }

    pub fn unknown_label(&self) -> &str {
        &self.unknown_label
    }

    /// Number of values that could not be parsed and were replaced by a zero value.
    pub fn lenient_parses(&self) -> usize {
        self.lenient_parses
    }

    pub fn take_warnings(&mut self) -> Vec<SyncWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn normalize(&mut self, raw: Option<&JsonValue>, hint: FieldHint) -> Scalar {
        let leaf = raw.map(unwrap_leaf).unwrap_or(Leaf::Missing);
        match leaf {
            Leaf::Missing => self.zero_value(hint),
            Leaf::Opaque(value) => {
                self.lenient(format!("unrecognised cell shape {value}"));
                self.zero_value(hint)
            }
            Leaf::Value(value) => match hint {
                FieldHint::Number => Scalar::Number(self.number_from(value).0),
                FieldHint::Text | FieldHint::Categorical => Scalar::Text(text_from(value)),
                FieldHint::Date => Scalar::Date(self.date_from(value)),
            },
        }
    }

    /// Same as [`Normalizer::normalize`], attributing any warning to `field`.
    pub fn normalize_field(
        &mut self,
        field: &str,
        raw: Option<&JsonValue>,
        hint: FieldHint,
    ) -> Scalar {
        self.field = Some(field.to_string());
        let scalar = self.normalize(raw, hint);
        self.field = None;
        scalar
    }

    /// A decimal fraction. Text carrying a `%` is divided by 100; bare numbers are
    /// taken as already fractional.
    pub fn fraction(&mut self, raw: Option<&JsonValue>) -> f64 {
        let leaf = raw.map(unwrap_leaf).unwrap_or(Leaf::Missing);
        match leaf {
            Leaf::Missing => 0.0,
            Leaf::Opaque(value) => {
                self.lenient(format!("unrecognised cell shape {value}"));
                0.0
            }
            Leaf::Value(value) => {
                let (number, percent) = self.number_from(value);
                if percent {
                    number / 100.0
                } else {
                    number
                }
            }
        }
    }

    pub fn fraction_field(&mut self, field: &str, raw: Option<&JsonValue>) -> f64 {
        self.field = Some(field.to_string());
        let value = self.fraction(raw);
        self.field = None;
        value
    }

    fn zero_value(&self, hint: FieldHint) -> Scalar {
        match hint {
            FieldHint::Number => Scalar::Number(0.0),
            FieldHint::Text => Scalar::Text(String::new()),
            FieldHint::Categorical => Scalar::Text(self.unknown_label.clone()),
            FieldHint::Date => Scalar::Date(None),
        }
    }

    fn lenient(&mut self, detail: String) {
        self.lenient_parses += 1;
        let message = match &self.field {
            Some(field) => format!("field {field}: {detail}"),
            None => detail,
        };
        warn!(%message, "lenient normalization");
        self.warnings
            .push(SyncWarning::new(WarningKind::Normalization, message));
    }

    /// Returns the parsed number and whether the source text was percent-decorated.
    fn number_from(&mut self, value: &JsonValue) -> (f64, bool) {
        match value {
            JsonValue::Number(n) => match n.as_f64().filter(|v| v.is_finite()) {
                Some(v) => (v, false),
                None => {
                    self.lenient(format!("non-finite number {n}"));
                    (0.0, false)
                }
            },
            JsonValue::String(s) => {
                let percent = s.contains('%');
                match strip_number_decorations(s).parse::<f64>() {
                    Ok(v) if v.is_finite() => (v, percent),
                    _ => {
                        self.lenient(format!("could not parse number from {s:?}"));
                        (0.0, false)
                    }
                }
            }
            other => {
                self.lenient(format!("expected a number, got {other}"));
                (0.0, false)
            }
        }
    }

    fn date_from(&mut self, value: &JsonValue) -> Option<NaiveDate> {
        let parsed = match value {
            JsonValue::Number(n) => n.as_f64().and_then(date_from_number),
            JsonValue::String(s) => date_from_text(s.trim()),
            _ => None,
        };
        if parsed.is_none() {
            self.lenient(format!("could not parse date from {value}"));
        }
        parsed
    }
}

fn text_from(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn date_from_number(value: f64) -> Option<NaiveDate> {
    if !value.is_finite() {
        return None;
    }
    if EXCEL_SERIAL_RANGE.contains(&value) {
        let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        return epoch.checked_add_signed(Duration::days(value.trunc() as i64));
    }
    let offset = FixedOffset::east_opt(SOURCE_UTC_OFFSET_SECS)?;
    DateTime::from_timestamp_millis(value as i64).map(|utc| utc.with_timezone(&offset).date_naive())
}

fn date_from_text(text: &str) -> Option<NaiveDate> {
    if let Ok(number) = text.parse::<f64>() {
        return date_from_number(number);
    }
    let day = text.split(['T', ' ']).next().unwrap_or(text);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day, "%Y/%m/%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn number(n: &mut Normalizer, raw: JsonValue) -> f64 {
        n.normalize(Some(&raw), FieldHint::Number).as_number()
    }

    #[test]
    fn wrapped_and_bare_percent_text_normalize_identically() {
        let mut n = Normalizer::default();
        let bare = number(&mut n, json!("12.34%"));
        let wrapped = number(&mut n, json!(["12.34%"]));
        let object = number(&mut n, json!({"type": 2, "value": ["12.34%"]}));
        assert_eq!(bare, 12.34);
        assert_eq!(wrapped, bare);
        assert_eq!(object, bare);
        assert_eq!(n.lenient_parses(), 0);
    }

    #[test]
    fn currency_decorations_are_stripped() {
        let mut n = Normalizer::default();
        assert_eq!(number(&mut n, json!("¥1,200,000")), 1_200_000.0);
        assert_eq!(number(&mut n, json!("￥ 3,000.5")), 3000.5);
        assert_eq!(number(&mut n, json!("$42")), 42.0);
        assert_eq!(number(&mut n, json!([{"text": "7.5", "type": "text"}])), 7.5);
    }

    #[test]
    fn missing_values_become_typed_zero_values() {
        let mut n = Normalizer::default();
        assert_eq!(n.normalize(None, FieldHint::Number), Scalar::Number(0.0));
        assert_eq!(n.normalize(Some(&json!([])), FieldHint::Text), Scalar::Text(String::new()));
        assert_eq!(
            n.normalize(Some(&JsonValue::Null), FieldHint::Categorical),
            Scalar::Text("unknown".to_string())
        );
        assert_eq!(n.normalize(Some(&json!("")), FieldHint::Date), Scalar::Date(None));
        assert!(n.take_warnings().is_empty());
    }

    #[test]
    fn unparseable_numbers_count_as_lenient_parses() {
        let mut n = Normalizer::default();
        let value = n.normalize_field("成本", Some(&json!("n/a")), FieldHint::Number);
        assert_eq!(value, Scalar::Number(0.0));
        assert_eq!(n.lenient_parses(), 1);
        let warnings = n.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::Normalization);
        assert!(warnings[0].message.contains("成本"));
    }

    #[test]
    fn categorical_object_without_text_falls_back_to_unknown() {
        let mut n = Normalizer::default();
        let raw = json!([{"id": "optX", "color": 3}]);
        let value = n.normalize_field("策略", Some(&raw), FieldHint::Categorical);
        assert_eq!(value, Scalar::Text("unknown".to_string()));
        assert_eq!(n.take_warnings().len(), 1);
    }

    #[test]
    fn fractions_divide_percent_text_only() {
        let mut n = Normalizer::default();
        assert!((n.fraction(Some(&json!("1.65%"))) - 0.0165).abs() < 1e-12);
        assert_eq!(n.fraction(Some(&json!(0.0165))), 0.0165);
        assert_eq!(n.fraction(Some(&json!("0.2"))), 0.2);
        assert_eq!(n.fraction(None), 0.0);
    }

    #[test]
    fn dates_accept_timestamps_serials_and_text() {
        let mut n = Normalizer::default();
        let expected = NaiveDate::from_ymd_opt(2025, 11, 17);
        // 2025-11-17 00:00 at UTC+8
        let millis = json!(1_763_308_800_000_i64);
        assert_eq!(n.normalize(Some(&millis), FieldHint::Date).as_date(), expected);
        assert_eq!(n.normalize(Some(&json!(45978)), FieldHint::Date).as_date(), expected);
        assert_eq!(n.normalize(Some(&json!("2025-11-17T08:00:00Z")), FieldHint::Date).as_date(), expected);
        assert_eq!(n.normalize(Some(&json!("2025/11/17")), FieldHint::Date).as_date(), expected);
        assert_eq!(n.normalize(Some(&json!(["2025/11/17"])), FieldHint::Date).as_date(), expected);
        assert_eq!(n.lenient_parses(), 0);

        assert_eq!(n.normalize(Some(&json!("soon")), FieldHint::Date), Scalar::Date(None));
        assert_eq!(n.lenient_parses(), 1);
    }
}
