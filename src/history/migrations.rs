pub const BASE_MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    baseline_url TEXT NOT NULL,
    target_url TEXT NOT NULL,
    total REAL NOT NULL,
    maximum REAL NOT NULL,
    percentage INTEGER,
    label TEXT NOT NULL,
    mismatch_count INTEGER NOT NULL,
    compared_count INTEGER NOT NULL,
    audit_log TEXT,
    captured_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_analysis_captured
    ON analysis_history(captured_at DESC);
CREATE INDEX IF NOT EXISTS idx_analysis_target
    ON analysis_history(target_url, captured_at DESC);
"#;
