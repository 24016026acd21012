//! Filesystem and cloud tree scanners: both produce a flat relative-path ->
//! entry map, which is all the decision function ever needs to see.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::cloud_client::{CloudClient, CloudEntry};
use crate::filters::SyncFilters;
use crate::path::normalize_rel;

#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub rel_path: String,
    pub abs_path: std::path::PathBuf,
    pub mtime: i64,
    pub size: u64,
}

#[derive(Debug, Clone)]
struct LocalScanCacheEntry {
    size: u64,
    mtime: i64,
}

/// Walks the local tree once per pass, remembering size+mtime so unchanged
/// files never need their content touched again by the scanner itself.
#[derive(Default)]
pub struct LocalScanner {
    last_state: HashMap<String, LocalScanCacheEntry>,
}

impl LocalScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self, root: &Path, filters: &SyncFilters) -> Result<HashMap<String, LocalEntry>> {
        let mut out = HashMap::new();
        let mut next_state = HashMap::new();

        if !root.exists() {
            self.last_state.clear();
            return Ok(out);
        }

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false)
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let abs_path = entry.path().to_path_buf();
            let rel_path = normalize_rel(
                &abs_path
                    .strip_prefix(root)
                    .with_context(|| format!("strip prefix {}", abs_path.display()))?
                    .to_string_lossy(),
            );
            if !rel_path.to_ascii_lowercase().ends_with(".md") {
                continue;
            }
            if filters.should_ignore(&rel_path) {
                continue;
            }

            let meta = entry.metadata()?;
            let size = meta.len();
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            next_state.insert(rel_path.clone(), LocalScanCacheEntry { size, mtime });
            out.insert(
                rel_path.clone(),
                LocalEntry {
                    rel_path,
                    abs_path,
                    mtime,
                    size,
                },
            );
        }

        self.last_state = next_state;
        Ok(out)
    }
}

/// Walks the cloud tree breadth-first, fanning page/directory fetches out
/// across a bounded worker pool so a deep tree doesn't serialize behind
/// round-trip latency.
pub struct CloudScanner {
    client: Arc<dyn CloudClient>,
    pool_size: usize,
}

impl CloudScanner {
    pub fn new(client: Arc<dyn CloudClient>, pool_size: usize) -> Self {
        Self { client, pool_size }
    }

    /// Returns (files, dirs) keyed by normalized relative path under `root_id`.
    pub async fn scan(&self, root_id: &str) -> Result<(HashMap<String, CloudEntry>, HashMap<String, CloudEntry>)> {
        let files = Arc::new(Mutex::new(HashMap::new()));
        let dirs = Arc::new(Mutex::new(HashMap::new()));
        let frontier = Arc::new(Mutex::new(VecDeque::from([(root_id.to_string(), String::new())])));
        let semaphore = Arc::new(Semaphore::new(self.pool_size.max(1)));

        loop {
            let batch: Vec<(String, String)> = {
                let mut guard = frontier.lock().await;
                let mut batch = Vec::new();
                while let Some(item) = guard.pop_front() {
                    batch.push(item);
                    if batch.len() >= self.pool_size.max(1) {
                        break;
                    }
                }
                batch
            };
            if batch.is_empty() {
                break;
            }

            let mut joins = JoinSet::new();
            for (dir_id, dir_rel) in batch {
                let client = self.client.clone();
                let semaphore = semaphore.clone();
                let files = files.clone();
                let dirs = dirs.clone();
                let frontier = frontier.clone();
                joins.spawn(async move {
                    let _permit = semaphore.acquire().await;
                    if let Err(err) = scan_one_dir(&*client, &dir_id, &dir_rel, &files, &dirs, &frontier).await {
                        crate::logging::error_kv(
                            "cloud directory scan failed",
                            &[("dir_id", dir_id.as_str()), ("error", &err.to_string())],
                        );
                    }
                });
            }
            while joins.join_next().await.is_some() {}
        }

        let files = Arc::try_unwrap(files).unwrap().into_inner();
        let dirs = Arc::try_unwrap(dirs).unwrap().into_inner();
        Ok((files, dirs))
    }
}

/// The proprietary note format uploads as `<base>.note` (see
/// `uploader::upload_name_and_domain`); rewriting it back to `.md` here keeps
/// cloud and local relative paths joinable by the decision function.
fn rewrite_note_suffix(name: &str, is_dir: bool) -> String {
    if is_dir {
        return name.to_string();
    }
    if let Some(base) = name.strip_suffix(".note").or_else(|| name.strip_suffix(".NOTE")) {
        format!("{base}.md")
    } else {
        name.to_string()
    }
}

async fn scan_one_dir(
    client: &dyn CloudClient,
    dir_id: &str,
    dir_rel: &str,
    files: &Arc<Mutex<HashMap<String, CloudEntry>>>,
    dirs: &Arc<Mutex<HashMap<String, CloudEntry>>>,
    frontier: &Arc<Mutex<VecDeque<(String, String)>>>,
) -> Result<()> {
    let mut cursor = None;
    loop {
        let page = client.list_dir(dir_id, cursor.as_deref()).await?;
        for entry in page.entries {
            let name = rewrite_note_suffix(&entry.name, entry.is_dir);
            let rel = if dir_rel.is_empty() {
                name
            } else {
                format!("{dir_rel}/{name}")
            };
            let rel = normalize_rel(&rel);
            if entry.is_dir {
                frontier.lock().await.push_back((entry.id.clone(), rel.clone()));
                dirs.lock().await.insert(rel, entry);
            } else {
                files.lock().await.insert(rel, entry);
            }
        }
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rewrite_note_suffix_converts_note_files_to_md() {
        assert_eq!(rewrite_note_suffix("idea.note", false), "idea.md");
        assert_eq!(rewrite_note_suffix("idea.md", false), "idea.md");
        assert_eq!(rewrite_note_suffix("folder.note", true), "folder.note");
    }

    #[test]
    fn local_scanner_retains_only_markdown_and_skips_dotfiles() {
        let dir = std::env::temp_dir().join("ydnote-sync-scanner-local-test");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(dir.join("notes")).unwrap();
        fs::write(dir.join("notes/a.md"), b"hi").unwrap();
        fs::write(dir.join("notes/image.png"), b"bin").unwrap();
        fs::write(dir.join(".hidden.md"), b"hi").unwrap();

        let filters = SyncFilters::load(&dir).unwrap();
        let mut scanner = LocalScanner::new();
        let found = scanner.scan(&dir, &filters).unwrap();

        assert!(found.contains_key("notes/a.md"));
        assert!(!found.contains_key("notes/image.png"));
        assert!(!found.contains_key(".hidden.md"));
    }
}
