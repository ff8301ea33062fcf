pub mod scorer;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::config::ConfigError;

pub use scorer::Scorer;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLabel {
    Benign,
    Suspicious,
    Malicious,
    /// Nothing carried weight, so no percentage exists to classify.
    Indeterminate,
}

impl Display for RiskLabel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let display = match self {
            Self::Benign => "BENIGN",
            Self::Suspicious => "SUSPICIOUS",
            Self::Malicious => "MALICIOUS",
            Self::Indeterminate => "INDETERMINATE",
        };
        write!(f, "{display}")
    }
}

impl FromStr for RiskLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BENIGN" => Ok(Self::Benign),
            "SUSPICIOUS" => Ok(Self::Suspicious),
            "MALICIOUS" => Ok(Self::Malicious),
            "INDETERMINATE" => Ok(Self::Indeterminate),
            other => Err(format!("unknown risk label: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RiskPercentage(pub Option<u32>);

impl RiskPercentage {
    pub const NOT_APPLICABLE: &'static str = "N/A";

    pub fn value(&self) -> Option<u32> {
        self.0
    }
}

impl Display for RiskPercentage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(pct) => write!(f, "{pct}%"),
            None => write!(f, "{}", Self::NOT_APPLICABLE),
        }
    }
}

impl Serialize for RiskPercentage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub total: f64,
    pub maximum: f64,
    pub percentage: RiskPercentage,
    pub label: RiskLabel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricWeights {
    #[serde(default = "default_metric_weight")]
    pub default_weight: f64,
    #[serde(default = "default_weight_table")]
    pub weights: BTreeMap<String, f64>,
}

impl MetricWeights {
    pub fn new(default_weight: f64, weights: BTreeMap<String, f64>) -> Result<Self, ConfigError> {
        let table = Self {
            default_weight,
            weights,
        };
        table.validate()?;
        Ok(table)
    }

    pub fn weight(&self, metric: &str) -> f64 {
        self.weights
            .get(metric)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.default_weight.is_finite() || self.default_weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                metric: "<default>".to_string(),
                weight: self.default_weight,
            });
        }
        for (metric, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    metric: metric.clone(),
                    weight: *weight,
                });
            }
        }
        Ok(())
    }
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            default_weight: default_metric_weight(),
            weights: default_weight_table(),
        }
    }
}

/// Upper bounds (inclusive) of the BENIGN and SUSPICIOUS bands, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_benign_max")]
    pub benign_max: f64,
    #[serde(default = "default_suspicious_max")]
    pub suspicious_max: f64,
}

impl Thresholds {
    pub fn new(benign_max: f64, suspicious_max: f64) -> Result<Self, ConfigError> {
        let thresholds = Self {
            benign_max,
            suspicious_max,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);
        if !in_range(self.benign_max)
            || !in_range(self.suspicious_max)
            || self.benign_max > self.suspicious_max
        {
            return Err(ConfigError::InvalidThresholds {
                benign_max: self.benign_max,
                suspicious_max: self.suspicious_max,
            });
        }
        Ok(())
    }

    pub fn classify(&self, percent: f64) -> RiskLabel {
        if percent <= self.benign_max {
            RiskLabel::Benign
        } else if percent <= self.suspicious_max {
            RiskLabel::Suspicious
        } else {
            RiskLabel::Malicious
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            benign_max: default_benign_max(),
            suspicious_max: default_suspicious_max(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(flatten)]
    pub weights: MetricWeights,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        self.thresholds.validate()
    }
}

fn default_metric_weight() -> f64 {
    1.0
}

fn default_benign_max() -> f64 {
    25.0
}

fn default_suspicious_max() -> f64 {
    60.0
}

pub fn default_weight_table() -> BTreeMap<String, f64> {
    [
        ("html_sha256", 5.0),
        ("favicon_hash", 4.0),
        ("title_font", 2.0),
        ("dns_ips", 3.0),
        ("dns_ttl", 2.0),
        ("tls_issuer", 3.0),
        ("tls_days_left", 1.0),
        ("tls_protocol", 1.0),
        ("whois_registrar", 2.0),
        ("whois_created_on", 2.0),
        ("whois_expiry_date", 2.0),
        ("urlscan_verdict", 4.0),
        ("urlscan_score", 3.0),
        ("urlscan_domain", 2.0),
        ("hdr_hsts", 1.0),
        ("hdr_csp", 1.0),
        ("hdr_xfo", 1.0),
        ("hdr_xxp", 1.0),
        ("hdr_xcto", 1.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
