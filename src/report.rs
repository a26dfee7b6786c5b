//! Batch outcome triple shared by the cascade, resubmission and patch
//! commands, plus its JSON rendering and report files.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub success: Vec<String>,
    pub failed: Vec<String>,
    pub filtered: Vec<String>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "success: {}, failed: {}, filtered: {}",
            self.success.len(),
            self.failed.len(),
            self.filtered.len()
        )
    }
}

/// Human-readable rendering for stdout.
pub fn render_text(report: &BatchReport) -> String {
    let mut out = String::new();
    for (label, ids) in [
        ("success", &report.success),
        ("failed", &report.failed),
        ("filtered", &report.filtered),
    ] {
        out.push_str(&format!("{label} ({}):\n", ids.len()));
        for id in ids {
            out.push_str(&format!("  {id}\n"));
        }
    }
    out
}

pub fn render_json(report: &BatchReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("serialize batch report")
}

/// Write the report next to `dest` and rename it into place.
pub fn write_report(dest: &Path, report: &BatchReport) -> Result<()> {
    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("create {}", parent.display()))?;
    let text = render_json(report)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    writeln!(tmp, "{text}").with_context(|| format!("write {}", dest.display()))?;
    tmp.persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("publish {}", dest.display()))?;
    tracing::debug!(path = %dest.display(), "report written");
    Ok(())
}
