//! Link run report, written next to the materialized image.
//!
//! One JSON manifest per run: stage-by-stage entry accounting, the final
//! pool digest and UTC timestamps. Two runs over the same inputs must
//! produce the same `pool_sha256`, which is what the determinism tests
//! compare.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const REPORT_FILENAME: &str = "link-report.json";

/// Accounting for one transformer stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub category: String,
    pub entries_in: usize,
    pub entries_out: usize,
}

/// Manifest of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkReport {
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub stages: Vec<StageRecord>,
    pub pool_sha256: String,
    pub image_root: Option<String>,
    pub post_process_logs: Vec<String>,
}

impl LinkReport {
    pub fn begin() -> Self {
        Self {
            status: "running".to_string(),
            created_at_utc: now_utc(),
            finished_at_utc: None,
            stages: Vec::new(),
            pool_sha256: String::new(),
            image_root: None,
            post_process_logs: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: &str) {
        self.status = status.to_string();
        self.finished_at_utc = Some(now_utc());
    }

    /// Write the report as `link-report.json` under `dir`.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(REPORT_FILENAME);
        let bytes = serde_json::to_vec_pretty(self)
            .with_context(|| format!("serializing link report '{}'", path.display()))?;
        fs::write(&path, bytes)
            .with_context(|| format!("writing link report '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading link report '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing link report '{}'", path.display()))
    }
}

fn now_utc() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
