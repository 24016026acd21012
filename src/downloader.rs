//! Fetches cloud files to disk: download to a `.part` sibling, then rename
//! into place, so a half-written file is never mistaken for a real one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cloud_client::CloudClient;
use crate::metadata_store::MetadataStore;

pub struct Downloader {
    client: Arc<dyn CloudClient>,
    store: Arc<MetadataStore>,
    pool_size: usize,
    batch_size: u64,
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub rel_path: String,
    pub file_id: String,
    pub target: PathBuf,
    pub cloud_mtime: i64,
    pub parent_id: Option<String>,
    pub domain: i32,
    pub create_time: Option<i64>,
}

#[derive(Debug, Default)]
pub struct DownloadStats {
    pub downloaded: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl Downloader {
    pub fn new(client: Arc<dyn CloudClient>, store: Arc<MetadataStore>, pool_size: usize, batch_size: usize) -> Self {
        Self { client, store, pool_size, batch_size: batch_size.max(1) as u64 }
    }

    pub async fn run(&self, jobs: Vec<DownloadJob>) -> DownloadStats {
        let semaphore = Arc::new(Semaphore::new(self.pool_size.max(1)));
        let completed = Arc::new(AtomicU64::new(0));
        let mut joins = JoinSet::new();
        let mut stats = DownloadStats::default();

        for job in jobs {
            let client = self.client.clone();
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let completed = completed.clone();
            let batch_size = self.batch_size;
            joins.spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = download_one(&*client, &store, &job).await;
                if (completed.fetch_add(1, Ordering::Relaxed) + 1) % batch_size == 0 {
                    if let Err(err) = store.save() {
                        crate::logging::warn_kv("periodic metadata save failed", &[("error", &err.to_string())]);
                    }
                }
                result
            });
        }

        while let Some(res) = joins.join_next().await {
            match res {
                Ok(Ok(true)) => stats.downloaded += 1,
                Ok(Ok(false)) => stats.skipped += 1,
                Ok(Err(err)) => {
                    crate::logging::error_kv("download failed", &[("error", &err.to_string())]);
                    stats.errors += 1;
                }
                Err(join_err) => {
                    crate::logging::error_kv("download task panicked", &[("error", &join_err.to_string())]);
                    stats.errors += 1;
                }
            }
        }
        stats
    }
}

/// Returns `Ok(true)` if a download happened, `Ok(false)` if skipped as unmodified.
async fn download_one(client: &dyn CloudClient, store: &MetadataStore, job: &DownloadJob) -> Result<bool> {
    if let Some(rec) = store.get_file_info(&job.rel_path) {
        if rec.cloud_mtime == job.cloud_mtime && job.target.exists() {
            return Ok(false);
        }
    }

    let sanitized_target = sanitize_target(&job.target);
    if let Some(parent) = sanitized_target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let file_name = sanitized_target.file_name().and_then(|n| n.to_str()).unwrap_or("download");
    let tmp = sanitized_target.with_file_name(format!(".{file_name}.part-{}", uuid::Uuid::new_v4().simple()));

    client
        .download_file(&job.file_id, &tmp)
        .await
        .with_context(|| format!("download {}", job.rel_path))?;

    if sanitized_target.exists() {
        let meta = tokio::fs::metadata(&sanitized_target).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&sanitized_target).await?;
        }
    }
    tokio::fs::rename(&tmp, &sanitized_target)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), sanitized_target.display()))?;

    let local_mtime = tokio::fs::metadata(&sanitized_target)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(now_secs);

    let content_hash = MetadataStore::compute_content_hash(&sanitized_target);
    let size = tokio::fs::metadata(&sanitized_target).await.map(|m| m.len()).unwrap_or(0);
    store.set_file_info(
        &job.rel_path,
        &job.file_id,
        job.cloud_mtime,
        local_mtime,
        job.parent_id.as_deref(),
        job.domain,
        content_hash.as_deref(),
        job.create_time,
        size,
    );

    Ok(true)
}

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Strips characters that are invalid in filenames on common platforms so a
/// cloud-provided name can never break a local write.
fn sanitize_target(target: &Path) -> PathBuf {
    let Some(name) = target.file_name().and_then(|n| n.to_str()) else {
        return target.to_path_buf();
    };
    let sanitized: String = name
        .chars()
        .map(|c| if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') { '_' } else { c })
        .collect();
    if sanitized == name {
        crate::path::escape_long_path(target)
    } else {
        crate::path::escape_long_path(&target.with_file_name(sanitized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_target_replaces_invalid_characters() {
        let p = Path::new("/tmp/notes/a:b?c.md");
        let sanitized = sanitize_target(p);
        assert_eq!(sanitized.file_name().unwrap().to_str().unwrap(), "a_b_c.md");
    }

    #[test]
    fn sanitize_target_leaves_clean_names_alone() {
        let p = Path::new("/tmp/notes/clean.md");
        assert_eq!(sanitize_target(p), p.to_path_buf());
    }
}
