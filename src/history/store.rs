use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::history::migrations::BASE_MIGRATION;
use crate::history::HistoryRecord;
use crate::scoring::RiskLabel;

pub struct HistoryStore {
    conn: Connection,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(BASE_MIGRATION)?;
        Ok(())
    }

    pub fn insert(&self, record: &HistoryRecord) -> Result<i64> {
        self.conn.execute(
            r#"
INSERT INTO analysis_history(
    baseline_url, target_url, total, maximum, percentage, label,
    mismatch_count, compared_count, audit_log, captured_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
"#,
            params![
                record.baseline_url,
                record.target_url,
                record.total,
                record.maximum,
                record.percentage.map(i64::from),
                record.label.to_string(),
                record.mismatch_count as i64,
                record.compared_count as i64,
                record.audit_log,
                record.captured_at.to_rfc3339()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT baseline_url, target_url, total, maximum, percentage, label,
       mismatch_count, compared_count, audit_log, captured_at
FROM analysis_history
ORDER BY captured_at DESC, id DESC
LIMIT ?1
"#,
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_history_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn for_target(&self, target_url: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
SELECT baseline_url, target_url, total, maximum, percentage, label,
       mismatch_count, compared_count, audit_log, captured_at
FROM analysis_history
WHERE target_url = ?1
ORDER BY captured_at DESC, id DESC
LIMIT ?2
"#,
        )?;
        let rows = stmt
            .query_map(params![target_url, limit as i64], row_to_history_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM analysis_history", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

fn row_to_history_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let label_raw: String = row.get(5)?;
    let label = label_raw
        .parse::<RiskLabel>()
        .unwrap_or(RiskLabel::Indeterminate);
    let captured_at_raw: String = row.get(9)?;
    let captured_at = DateTime::parse_from_rfc3339(&captured_at_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(HistoryRecord {
        baseline_url: row.get(0)?,
        target_url: row.get(1)?,
        total: row.get(2)?,
        maximum: row.get(3)?,
        percentage: row
            .get::<_, Option<i64>>(4)?
            .and_then(|pct| u32::try_from(pct).ok()),
        label,
        mismatch_count: row.get::<_, i64>(6)?.max(0) as usize,
        compared_count: row.get::<_, i64>(7)?.max(0) as usize,
        audit_log: row.get(8)?,
        captured_at,
    })
}
