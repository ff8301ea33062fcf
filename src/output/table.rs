use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color, ContentArrangement, Row, Table};

use crate::analysis::AnalysisReport;
use crate::compare::DiffRecord;
use crate::features::{FeatureMapping, FeatureValue};
use crate::history::HistoryRecord;
use crate::scoring::{MetricWeights, RiskLabel};

const MAX_CELL_CHARS: usize = 96;

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn render_feature_panel(title: &str, features: &FeatureMapping) -> String {
    let mut table = new_table();
    table.set_header(vec![title, "Value"]);
    for (metric, value) in features.iter() {
        table.add_row(Row::from(vec![Cell::new(metric), value_cell(value)]));
    }
    table.to_string()
}

pub fn render_comparison_table(diff: &DiffRecord, weights: &MetricWeights) -> String {
    let mut table = new_table();
    table.set_header(vec!["Metric", "Baseline", "Target", "Match", "Weight"]);
    for (metric, entry) in diff.mismatches_first() {
        let match_cell = if entry.is_match {
            Cell::new("YES").fg(Color::Green)
        } else {
            Cell::new("NO").fg(Color::Red)
        };
        table.add_row(Row::from(vec![
            Cell::new(metric),
            value_cell(&entry.baseline),
            value_cell(&entry.target),
            match_cell,
            Cell::new(format!("{:.1}", weights.weight(metric))),
        ]));
    }
    table.to_string()
}

pub fn render_score_summary(report: &AnalysisReport) -> String {
    let score = &report.score;
    let audit = report
        .audit_log
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "not written".to_string());
    format!(
        "Risk score: {} [{}]\nWeighted mismatches: {:.2} / {:.2} ({} of {} metrics differ)\nAudit log: {audit}",
        score.percentage,
        score.label,
        score.total,
        score.maximum,
        report.comparisons.mismatch_count(),
        report.comparisons.len(),
    )
}

pub fn render_report(report: &AnalysisReport, weights: &MetricWeights) -> String {
    [
        render_feature_panel(&format!("Baseline: {}", report.baseline_url), &report.baseline),
        render_feature_panel(&format!("Target: {}", report.target_url), &report.target),
        render_comparison_table(&report.comparisons, weights),
        render_score_summary(report),
    ]
    .join("\n\n")
}

pub fn render_history_table(records: &[HistoryRecord]) -> String {
    let mut table = new_table();
    table.set_header(vec![
        "Captured At",
        "Baseline",
        "Target",
        "Risk",
        "Label",
        "Mismatches",
    ]);
    for rec in records {
        table.add_row(Row::from(vec![
            Cell::new(rec.captured_at.to_rfc3339()),
            Cell::new(&rec.baseline_url),
            Cell::new(&rec.target_url),
            Cell::new(rec.percentage_display()),
            label_cell(rec.label),
            Cell::new(format!("{}/{}", rec.mismatch_count, rec.compared_count)),
        ]));
    }
    table.to_string()
}

fn value_cell(value: &FeatureValue) -> Cell {
    let text = truncate(&value.to_string());
    match value {
        FeatureValue::Error => Cell::new(text).fg(Color::Yellow),
        FeatureValue::Unavailable => Cell::new(text).fg(Color::DarkGrey),
        _ => Cell::new(text),
    }
}

fn label_cell(label: RiskLabel) -> Cell {
    let color = match label {
        RiskLabel::Benign => Color::Green,
        RiskLabel::Suspicious => Color::Yellow,
        RiskLabel::Malicious => Color::Red,
        RiskLabel::Indeterminate => Color::DarkGrey,
    };
    Cell::new(label.to_string()).fg(color)
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_CELL_CHARS {
        return text.to_string();
    }
    let mut out = text.chars().take(MAX_CELL_CHARS - 3).collect::<String>();
    out.push_str("...");
    out
}
