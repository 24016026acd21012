//! Path exclusion rules: files that never participate in sync regardless of
//! what the decision function would otherwise say.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

const DEFAULT_IGNORE_LINES: &[&str] = &[
    ".ydsync/",
    ".ydignore",
    "**/*.conflict.*",
    "**/*.conflict",
    "**/*.rejected.*",
    "**/*.rejected",
    "**/*.part",
    "**/*.part-*",
    "**/.*.part-*",
    ".git/",
    ".DS_Store",
    "Thumbs.db",
    "*.tmp",
    "*.log",
    "~$*",
];

#[derive(Clone)]
pub struct SyncFilters {
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl SyncFilters {
    /// Loads default exclusions plus any user-supplied `.ydignore` found at the
    /// sync root. Never fails on a missing or unreadable ignore file.
    pub fn load(local_root: &Path) -> Result<Self> {
        fs::create_dir_all(local_root)
            .with_context(|| format!("create local root {}", local_root.display()))?;

        let mut builder = GitignoreBuilder::new(local_root);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let custom_path = local_root.join(".ydignore");
        if custom_path.exists() {
            for line in read_ignore_file(&custom_path)? {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add .ydignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: local_root.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore(&self, rel_path: &str) -> bool {
        self.should_ignore_path(Path::new(rel_path), false)
    }

    pub fn should_ignore_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_ignore_path(rel, is_dir)
    }

    fn should_ignore_path(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore.matched_path_or_any_parents(rel_path, is_dir).is_ignore()
    }

    /// Whether a path is itself a marker this crate wrote (a conflict backup
    /// or a partial download), used to keep the watcher from reacting to its
    /// own writes.
    pub fn is_marked_rel_path(rel: &str) -> bool {
        rel.contains(".conflict") || rel.contains(".rejected") || rel.contains(".part")
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap().as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn ignores_metadata_dir_and_markers() {
        let root = make_temp_dir("ydnote-sync-filters-test");
        let filters = SyncFilters::load(&root).unwrap();
        assert!(filters.should_ignore(".ydsync/metadata.json"));
        assert!(filters.should_ignore("notes/a.conflict.20260101_000000.md"));
        assert!(filters.should_ignore("notes/.a.md.part-123"));
    }

    #[test]
    fn regular_files_are_not_ignored() {
        let root = make_temp_dir("ydnote-sync-filters-regular-test");
        let filters = SyncFilters::load(&root).unwrap();
        assert!(!filters.should_ignore("notes/a.md"));
        assert!(!filters.should_ignore("notes/sub/b.md"));
    }

    #[test]
    fn custom_ydignore_lines_apply() {
        let root = make_temp_dir("ydnote-sync-filters-custom-test");
        fs::write(root.join(".ydignore"), "drafts/\n").unwrap();
        let filters = SyncFilters::load(&root).unwrap();
        assert!(filters.should_ignore("drafts/wip.md"));
    }

    #[test]
    fn is_marked_rel_path_detects_markers() {
        assert!(SyncFilters::is_marked_rel_path("a.conflict.20260101_000000.md"));
        assert!(SyncFilters::is_marked_rel_path("a.rejected.md"));
        assert!(!SyncFilters::is_marked_rel_path("a.md"));
    }
}
