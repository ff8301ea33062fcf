//! Flat feature mappings shared by every pipeline stage.
//!
//! Each stage writes into a [`FeatureSetBuilder`] under its own key prefix
//! (`hdr_`, `tls_`, `dns_`, `whois_`, `urlscan_`); page and fetch features are
//! unprefixed. Once built, a [`FeatureMapping`] is never mutated.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

pub const UNAVAILABLE_MARK: &str = "-";
pub const ERROR_MARK: &str = "ERR";

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Date(NaiveDate),
    Duration(Duration),
    /// The producer had nothing to report for this metric.
    Unavailable,
    /// The stage owning this metric failed.
    Error,
}

impl FeatureValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn text_or_unavailable(value: Option<impl AsRef<str>>) -> Self {
        match value {
            Some(v) if !v.as_ref().trim().is_empty() => Self::Text(v.as_ref().trim().to_string()),
            _ => Self::Unavailable,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(v) => Value::String(v.clone()),
            Self::Integer(v) => Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(v.to_string())),
            Self::Date(_) | Self::Duration(_) | Self::Unavailable | Self::Error => {
                Value::String(self.to_string())
            }
        }
    }
}

impl Display for FeatureValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Duration(v) => write!(f, "{:.3}s", v.as_secs_f64()),
            Self::Unavailable => write!(f, "{UNAVAILABLE_MARK}"),
            Self::Error => write!(f, "{ERROR_MARK}"),
        }
    }
}

impl Serialize for FeatureValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for FeatureValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<NaiveDate> for FeatureValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<Duration> for FeatureValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl<T: Into<FeatureValue>> From<Option<T>> for FeatureValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Unavailable)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FeatureMapping {
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: &str) -> Option<&FeatureValue> {
        self.values.get(metric)
    }

    pub fn value_or_unavailable(&self, metric: &str) -> FeatureValue {
        self.values
            .get(metric)
            .cloned()
            .unwrap_or(FeatureValue::Unavailable)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: Into<String>, V: Into<FeatureValue>> FromIterator<(K, V)> for FeatureMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Fields(FeatureMapping),
    Failed {
        stage: &'static str,
        keys: &'static [&'static str],
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct FeatureSetBuilder {
    values: BTreeMap<String, FeatureValue>,
}

impl FeatureSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: impl Into<String>, value: impl Into<FeatureValue>) -> bool {
        let metric = metric.into();
        if self.values.contains_key(&metric) {
            warn!("feature key collision on {metric}, keeping first value");
            return false;
        }
        self.values.insert(metric, value.into());
        true
    }

    pub fn extend(&mut self, mapping: FeatureMapping) {
        for (metric, value) in mapping.values {
            self.insert(metric, value);
        }
    }

    pub fn apply(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Fields(mapping) => self.extend(mapping),
            StageOutcome::Failed {
                stage,
                keys,
                reason,
            } => {
                warn!("{stage} enrichment failed: {reason}");
                for key in keys {
                    self.insert(*key, FeatureValue::Error);
                }
            }
        }
    }

    pub fn get(&self, metric: &str) -> Option<&FeatureValue> {
        self.values.get(metric)
    }

    pub fn build(self) -> FeatureMapping {
        FeatureMapping {
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::{FeatureMapping, FeatureSetBuilder, FeatureValue, StageOutcome};

    #[test]
    fn sentinels_are_distinct_from_empty_values() {
        assert_ne!(FeatureValue::Unavailable, FeatureValue::text(""));
        assert_ne!(FeatureValue::Unavailable, FeatureValue::Integer(0));
        assert_ne!(FeatureValue::Unavailable, FeatureValue::Error);
        assert_eq!(
            FeatureValue::text_or_unavailable(Some("  ")),
            FeatureValue::Unavailable
        );
    }

    #[test]
    fn date_does_not_equal_its_string_form() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        assert_ne!(FeatureValue::Date(date), FeatureValue::text("2020-01-01"));
        assert_eq!(FeatureValue::Date(date).to_string(), "2020-01-01");
    }

    #[test]
    fn canonical_json_stringifies_dates_and_durations() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(FeatureValue::Date(date).to_json(), json!("2024-03-09"));
        assert_eq!(
            FeatureValue::Duration(Duration::from_millis(1500)).to_json(),
            json!("1.500s")
        );
        assert_eq!(FeatureValue::Integer(7).to_json(), json!(7));
        assert_eq!(FeatureValue::Unavailable.to_json(), json!("-"));
        assert_eq!(FeatureValue::Error.to_json(), json!("ERR"));
    }

    #[test]
    fn builder_keeps_first_value_on_collision() {
        let mut builder = FeatureSetBuilder::new();
        assert!(builder.insert("title", "first"));
        assert!(!builder.insert("title", "second"));
        let mapping = builder.build();
        assert_eq!(mapping.get("title"), Some(&FeatureValue::text("first")));
    }

    #[test]
    fn failed_stage_fills_owned_keys_with_error() {
        let mut builder = FeatureSetBuilder::new();
        builder.apply(StageOutcome::Fields(FeatureMapping::from_iter([(
            "dns_ips", "1.2.3.4",
        )])));
        builder.apply(StageOutcome::Failed {
            stage: "whois",
            keys: &["whois_registrar", "whois_org"],
            reason: "connection refused".to_string(),
        });
        let mapping = builder.build();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.get("whois_org"), Some(&FeatureValue::Error));
        assert_eq!(mapping.value_or_unavailable("tls_issuer"), FeatureValue::Unavailable);
    }
}
