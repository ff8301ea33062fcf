use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use tracing::{debug, warn};

use crate::audit::{AuditEntry, AuditMode};
use crate::compare::DiffRecord;
use crate::scoring::MetricWeights;

const MAX_NAME_ATTEMPTS: u32 = 1_000;

#[derive(Debug, Clone)]
pub struct AuditLogger {
    reports_dir: PathBuf,
}

impl AuditLogger {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    pub fn record(
        &self,
        diff: &DiffRecord,
        weights: &MetricWeights,
        mode: AuditMode,
    ) -> Option<PathBuf> {
        match self.try_record(diff, weights, mode) {
            Ok(path) => {
                debug!("audit record written to {}", path.display());
                Some(path)
            }
            Err(err) => {
                warn!("failed writing audit record: {err:#}");
                None
            }
        }
    }

    pub fn try_record(
        &self,
        diff: &DiffRecord,
        weights: &MetricWeights,
        mode: AuditMode,
    ) -> Result<PathBuf> {
        let entries = build_entries(diff, weights, mode);
        let body = serde_json::to_string_pretty(&entries)?;

        fs::create_dir_all(&self.reports_dir).with_context(|| {
            format!(
                "failed creating reports directory: {}",
                self.reports_dir.display()
            )
        })?;

        let stem = format!(
            "{}{}",
            mode.file_prefix(),
            Local::now().format("%Y%m%d_%H%M%S_%6f")
        );
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}-{attempt}.json")
            };
            let path = self.reports_dir.join(name);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed creating {}", path.display()))
                }
            };
            let written = file.write_all(body.as_bytes()).and_then(|_| file.sync_all());
            drop(file);
            discard_on_error(&path, written)?;
            return Ok(path);
        }
        Err(anyhow!(
            "no free audit file name for {stem} in {}",
            self.reports_dir.display()
        ))
    }
}

// Removes a half-written record.
fn discard_on_error(path: &Path, written: io::Result<()>) -> Result<()> {
    if let Err(err) = written {
        if let Err(remove_err) = fs::remove_file(path) {
            warn!("failed removing partial audit record {}: {remove_err}", path.display());
        }
        return Err(err).with_context(|| format!("failed writing {}", path.display()));
    }
    Ok(())
}

pub fn build_entries(
    diff: &DiffRecord,
    weights: &MetricWeights,
    mode: AuditMode,
) -> BTreeMap<String, AuditEntry> {
    diff.iter()
        .filter(|(_, entry)| mode == AuditMode::Full || !entry.is_match)
        .map(|(metric, entry)| {
            (
                metric.clone(),
                AuditEntry {
                    legit: entry.baseline.to_json(),
                    phish: entry.target.to_json(),
                    is_match: (mode == AuditMode::Full).then_some(entry.is_match),
                    weight: weights.weight(metric),
                },
            )
        })
        .collect()
}
