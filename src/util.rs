use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::Path;

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Drop duplicates while keeping first-seen order.
pub fn dedupe_preserving_order<I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Read one identifier per line; blank lines and `#` comments are skipped.
pub fn read_id_list(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read id list {}", path.display()))?;
    Ok(parse_id_list(&text))
}

pub fn parse_id_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Compact preview of a long id list for log lines.
pub fn preview_ids(ids: &[String], max: usize) -> String {
    if ids.len() <= max {
        return ids.join(", ");
    }
    format!("{}, ... ({} more)", ids[..max].join(", "), ids.len() - max)
}
