pub mod migrations;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::AnalysisReport;
use crate::scoring::{RiskLabel, RiskPercentage};

pub use store::HistoryStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub baseline_url: String,
    pub target_url: String,
    pub total: f64,
    pub maximum: f64,
    pub percentage: Option<u32>,
    pub label: RiskLabel,
    pub mismatch_count: usize,
    pub compared_count: usize,
    pub audit_log: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_report(report: &AnalysisReport) -> Self {
        Self {
            baseline_url: report.baseline_url.clone(),
            target_url: report.target_url.clone(),
            total: report.score.total,
            maximum: report.score.maximum,
            percentage: report.score.percentage.value(),
            label: report.score.label,
            mismatch_count: report.comparisons.mismatch_count(),
            compared_count: report.comparisons.len(),
            audit_log: report
                .audit_log
                .as_ref()
                .map(|path| path.display().to_string()),
            captured_at: report.generated_at,
        }
    }

    pub fn percentage_display(&self) -> String {
        RiskPercentage(self.percentage).to_string()
    }
}
