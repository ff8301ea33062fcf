use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditMode;
use crate::scoring::ScoringConfig;

pub const URLSCAN_API_KEY_ENV: &str = "URLSCAN_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("metric weight for {metric} must be a finite, non-negative number (got {weight})")]
    InvalidWeight { metric: String, weight: f64 },
    #[error(
        "thresholds must satisfy 0 <= benign_max <= suspicious_max <= 100 (got {benign_max}, {suspicious_max})"
    )]
    InvalidThresholds { benign_max: f64, suspicious_max: f64 },
    #[error("scan polling needs a positive interval and at least one attempt")]
    InvalidPolling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub comparison: ComparisonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_browser_timeout_secs")]
    pub browser_timeout_secs: u64,
    #[serde(default = "default_asset_timeout_secs")]
    pub asset_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_scan_visibility")]
    pub visibility: String,
    #[serde(default = "default_scan_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonConfig {
    #[serde(default)]
    pub ignore_keys: Vec<String>,
    #[serde(default)]
    pub full_log: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,
    #[serde(default = "default_history_db_path")]
    pub history_db_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub reports_dir: Option<String>,
    pub ignore_keys: Option<Vec<String>>,
    pub full_log: Option<bool>,
    pub scan_api_key: Option<String>,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config/warm/config.toml")
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_path);
        let mut config = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed reading config: {}", path.display()))?;
            toml::from_str::<Self>(&data)
                .with_context(|| format!("failed parsing TOML config: {}", path.display()))?
        } else {
            Self::default()
        };
        if config.scan.api_key.trim().is_empty() {
            if let Ok(key) = std::env::var(URLSCAN_API_KEY_ENV) {
                config.scan.api_key = key;
            }
        }
        config
            .validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;
        if self.scan.poll_interval_secs == 0 || self.scan.max_poll_attempts == 0 {
            return Err(ConfigError::InvalidPolling);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(reports_dir) = overrides.reports_dir {
            self.storage.reports_dir = reports_dir;
        }
        if let Some(ignore_keys) = overrides.ignore_keys {
            self.comparison.ignore_keys = ignore_keys;
        }
        if let Some(full_log) = overrides.full_log {
            self.comparison.full_log = full_log;
        }
        if let Some(key) = overrides.scan_api_key {
            self.scan.api_key = key;
        }
    }

    pub fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating config directory: {}", parent.display())
            })?;
        }
        fs::write(path, Self::default_template())
            .with_context(|| format!("failed writing config template: {}", path.display()))
    }

    pub fn resolved_reports_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.reports_dir)
    }

    pub fn resolved_history_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.history_db_path)
    }

    pub fn audit_mode(&self) -> AuditMode {
        if self.comparison.full_log {
            AuditMode::Full
        } else {
            AuditMode::MismatchesOnly
        }
    }

    pub fn default_template() -> String {
        let template = r#"[fetch]
user_agent = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36"
timeout_secs = 10
browser_timeout_secs = 20
asset_timeout_secs = 8

[scan]
base_url = "https://urlscan.io/api/v1"
# Falls back to the URLSCAN_API_KEY environment variable when empty.
api_key = ""
visibility = "unlisted"
tags = ["warm-scan"]
poll_interval_secs = 5
max_poll_attempts = 10

[scoring]
default_weight = 1.0

[scoring.weights]
html_sha256 = 5.0
favicon_hash = 4.0
title_font = 2.0
dns_ips = 3.0
dns_ttl = 2.0
tls_issuer = 3.0
tls_days_left = 1.0
tls_protocol = 1.0
whois_registrar = 2.0
whois_created_on = 2.0
whois_expiry_date = 2.0
urlscan_verdict = 4.0
urlscan_score = 3.0
urlscan_domain = 2.0
hdr_hsts = 1.0
hdr_csp = 1.0
hdr_xfo = 1.0
hdr_xxp = 1.0
hdr_xcto = 1.0

[scoring.thresholds]
benign_max = 25.0
suspicious_max = 60.0

[comparison]
ignore_keys = []
full_log = false

[storage]
reports_dir = "data/reports"
history_db_path = "~/.local/share/warm/history.db"
"#;
        template.to_string()
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_timeout_secs.max(1))
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_timeout_secs.max(1))
    }
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            scan: ScanConfig::default(),
            scoring: ScoringConfig::default(),
            comparison: ComparisonConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_fetch_timeout_secs(),
            browser_timeout_secs: default_browser_timeout_secs(),
            asset_timeout_secs: default_asset_timeout_secs(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            base_url: default_scan_base_url(),
            api_key: String::new(),
            visibility: default_scan_visibility(),
            tags: default_scan_tags(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            reports_dir: default_reports_dir(),
            history_db_path: default_history_db_path(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0.0.0 Safari/537.36".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_browser_timeout_secs() -> u64 {
    20
}

fn default_asset_timeout_secs() -> u64 {
    8
}

fn default_scan_base_url() -> String {
    "https://urlscan.io/api/v1".to_string()
}

fn default_scan_visibility() -> String {
    "unlisted".to_string()
}

fn default_scan_tags() -> Vec<String> {
    vec!["warm-scan".to_string()]
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_poll_attempts() -> u32 {
    10
}

fn default_reports_dir() -> String {
    "data/reports".to_string()
}

fn default_history_db_path() -> String {
    "~/.local/share/warm/history.db".to_string()
}
