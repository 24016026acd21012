//! Conflict backups: when both sides changed since the last sync, the local
//! copy is renamed aside before the cloud copy is downloaded into its place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

/// Renames `path` to `P.conflict.YYYYMMDD_HHMMSS<ext>`, always embedding a
/// timestamp so repeated conflicts on the same path never collide or require
/// lazy rotation.
pub fn backup(path: &Path) -> Result<PathBuf> {
    let marked = conflict_backup_path(path);
    if let Some(parent) = marked.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::rename(path, &marked).with_context(|| format!("rename {} -> {}", path.display(), marked.display()))?;
    Ok(marked)
}

fn conflict_backup_path(path: &Path) -> PathBuf {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let base = if ext.is_empty() {
        file_name.to_string()
    } else {
        file_name.strip_suffix(&format!(".{ext}")).unwrap_or(file_name).to_string()
    };
    let new_name = if ext.is_empty() {
        format!("{base}.conflict.{ts}")
    } else {
        format!("{base}.conflict.{ts}.{ext}")
    };
    path.with_file_name(new_name)
}
