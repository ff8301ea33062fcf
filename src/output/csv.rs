use anyhow::Result;

use crate::compare::DiffRecord;
use crate::history::HistoryRecord;
use crate::scoring::MetricWeights;

pub fn diff_to_csv(diff: &DiffRecord, weights: &MetricWeights) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["metric", "baseline", "target", "match", "weight"])?;
    for (metric, entry) in diff.mismatches_first() {
        writer.write_record([
            metric.clone(),
            entry.baseline.to_string(),
            entry.target.to_string(),
            entry.is_match.to_string(),
            format!("{:.2}", weights.weight(metric)),
        ])?;
    }
    let data = writer.into_inner()?;
    Ok(String::from_utf8_lossy(&data).to_string())
}

pub fn history_to_csv(records: &[HistoryRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record([
        "captured_at",
        "baseline_url",
        "target_url",
        "total",
        "maximum",
        "percentage",
        "label",
        "mismatch_count",
        "compared_count",
        "audit_log",
    ])?;
    for rec in records {
        writer.write_record([
            rec.captured_at.to_rfc3339(),
            rec.baseline_url.clone(),
            rec.target_url.clone(),
            format!("{:.2}", rec.total),
            format!("{:.2}", rec.maximum),
            rec.percentage_display(),
            rec.label.to_string(),
            rec.mismatch_count.to_string(),
            rec.compared_count.to_string(),
            rec.audit_log.clone().unwrap_or_default(),
        ])?;
    }
    let data = writer.into_inner()?;
    Ok(String::from_utf8_lossy(&data).to_string())
}
