pub mod logger;

use serde::{Deserialize, Serialize};

pub use logger::AuditLogger;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    #[default]
    MismatchesOnly,
    Full,
}

impl AuditMode {
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::MismatchesOnly => "log_",
            Self::Full => "full_log_",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub legit: serde_json::Value,
    pub phish: serde_json::Value,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none", default)]
    pub is_match: Option<bool>,
    pub weight: f64,
}
