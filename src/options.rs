//! Patching of the AUT's `key:value` option file before launch.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

/// What `ensure_option` did to the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    Unchanged,
    Replaced,
    Appended,
}

/// Rewrite `lines` so that `key` maps to `value`. Every existing line for the
/// key is replaced in place; if there is none, one line is appended. All other
/// lines pass through untouched.
pub fn patch_option_lines(lines: &[&str], key: &str, value: &str) -> (Vec<String>, PatchOutcome) {
    let prefix = format!("{key}:");
    let wanted = format!("{key}:{value}");
    let mut found = false;
    let mut changed = false;

    let mut out: Vec<String> = lines
        .iter()
        .map(|line| {
            if line.trim_start().starts_with(&prefix) {
                found = true;
                if line.trim_end() != wanted {
                    changed = true;
                }
                wanted.clone()
            } else {
                (*line).to_string()
            }
        })
        .collect();

    if !found {
        out.push(wanted);
        return (out, PatchOutcome::Appended);
    }
    let outcome = if changed {
        PatchOutcome::Replaced
    } else {
        PatchOutcome::Unchanged
    };
    (out, outcome)
}

/// Make sure the option file at `path` holds `key:value`, creating the file
/// (and its parent directory) when missing. The file is only rewritten when
/// its content would change.
pub fn ensure_option(path: &Path, key: &str, value: &str) -> Result<PatchOutcome> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let lines: Vec<&str> = existing.lines().collect();
    let (patched, outcome) = patch_option_lines(&lines, key, value);

    let mut content = patched.join("\n");
    content.push('\n');
    if outcome == PatchOutcome::Unchanged && content == existing {
        debug!(path = %path.display(), key, value, "option already set");
        return Ok(PatchOutcome::Unchanged);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), key, value, outcome = ?outcome, "option file patched");
    Ok(outcome)
}
