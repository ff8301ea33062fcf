pub mod pipeline;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::audit::AuditMode;
use crate::compare::DiffRecord;
use crate::config::Config;
use crate::features::FeatureMapping;
use crate::scoring::ScoreResult;

pub use pipeline::Analyzer;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL is empty")]
    Empty,
    #[error("invalid URL {url}: {reason}")]
    Invalid { url: String, reason: String },
    #[error("unsupported scheme {scheme} in {url} (expected http or https)")]
    UnsupportedScheme { url: String, scheme: String },
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub browser: bool,
    pub scan: bool,
    pub ignore_keys: BTreeSet<String>,
    pub audit_mode: AuditMode,
}

impl AnalysisOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            browser: false,
            scan: false,
            ignore_keys: config.comparison.ignore_keys.iter().cloned().collect(),
            audit_mode: config.audit_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub baseline_url: String,
    pub target_url: String,
    pub generated_at: DateTime<Utc>,
    pub baseline: FeatureMapping,
    pub target: FeatureMapping,
    pub comparisons: DiffRecord,
    pub score: ScoreResult,
    pub audit_log: Option<PathBuf>,
}

impl AnalysisReport {
    pub fn mismatch_count(&self) -> usize {
        self.comparisons.mismatch_count()
    }
}

/// Trims, defaults the scheme to https and rejects anything that is not an
/// http(s) URL with a host.
pub fn normalize_url(raw: &str) -> Result<String, UrlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = Url::parse(&candidate).map_err(|err| UrlError::Invalid {
        url: trimmed.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlError::UnsupportedScheme {
            url: trimmed.to_string(),
            scheme: parsed.scheme().to_string(),
        });
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(UrlError::MissingHost(trimmed.to_string()));
    }
    Ok(parsed.to_string())
}
