//! Pushes local files and directories to the cloud. Directories are ensured
//! (created if missing) before any of their files upload; files short-circuit
//! on an unchanged local mtime.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cloud_client::CloudClient;
use crate::metadata_store::MetadataStore;

pub struct Uploader {
    client: Arc<dyn CloudClient>,
    store: Arc<MetadataStore>,
    pool_size: usize,
    upload_as_note: bool,
    batch_size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadJob {
    pub rel_path: String,
    pub abs_path: std::path::PathBuf,
    pub parent_id: String,
}

#[derive(Debug, Default)]
pub struct UploadStats {
    pub uploaded: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl Uploader {
    pub fn new(
        client: Arc<dyn CloudClient>,
        store: Arc<MetadataStore>,
        pool_size: usize,
        upload_as_note: bool,
        batch_size: usize,
    ) -> Self {
        Self { client, store, pool_size, upload_as_note, batch_size: batch_size.max(1) as u64 }
    }

    /// Generates a new cloud file id the same shape the cloud itself issues:
    /// `WEB` followed by a hyphen-free UUIDv4.
    pub fn generate_file_id() -> String {
        format!("WEB{}", Uuid::new_v4().simple())
    }

    /// Ensures a cloud directory exists for `rel_path`, creating every missing
    /// ancestor along the way. Returns its cloud directory id.
    pub async fn ensure_cloud_dir(&self, rel_path: &str, root_id: &str) -> Result<String> {
        if rel_path.is_empty() {
            return Ok(root_id.to_string());
        }
        if let Some(id) = self.store.get_dir_id(rel_path) {
            return Ok(id);
        }

        let (parent_rel, name) = match rel_path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", rel_path),
        };
        let parent_id = Box::pin(self.ensure_cloud_dir(parent_rel, root_id)).await?;

        let entry = self
            .client
            .create_dir(&parent_id, name)
            .await
            .with_context(|| format!("create cloud dir {rel_path}"))?;
        self.store.set_dir_info(rel_path, &entry.id, Some(parent_id.as_str()));
        Ok(entry.id)
    }

    pub async fn run(&self, jobs: Vec<UploadJob>) -> UploadStats {
        let semaphore = Arc::new(Semaphore::new(self.pool_size.max(1)));
        let completed = Arc::new(AtomicU64::new(0));
        let mut joins = JoinSet::new();
        let mut stats = UploadStats::default();

        for job in jobs {
            let client = self.client.clone();
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let upload_as_note = self.upload_as_note;
            let completed = completed.clone();
            let batch_size = self.batch_size;
            joins.spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = upload_one(&*client, &store, &job, upload_as_note).await;
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
                Ok(Ok(true)) => stats.uploaded += 1,
                Ok(Ok(false)) => stats.skipped += 1,
                Ok(Err(err)) => {
                    crate::logging::error_kv("upload failed", &[("error", &err.to_string())]);
                    stats.errors += 1;
                }
                Err(join_err) => {
                    crate::logging::error_kv("upload task panicked", &[("error", &join_err.to_string())]);
                    stats.errors += 1;
                }
            }
        }
        stats
    }
}

async fn upload_one(client: &dyn CloudClient, store: &MetadataStore, job: &UploadJob, upload_as_note: bool) -> Result<bool> {
    let meta = tokio::fs::metadata(&job.abs_path)
        .await
        .with_context(|| format!("stat {}", job.abs_path.display()))?;
    let local_mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let existing = store.get_file_info(&job.rel_path);
    if let Some(rec) = &existing {
        if local_mtime <= rec.local_mtime {
            return Ok(false);
        }
    }

    let file_id = existing
        .as_ref()
        .filter(|r| !r.file_id.is_empty())
        .map(|r| r.file_id.clone())
        .unwrap_or_else(Uploader::generate_file_id);

    let (name, domain) = upload_name_and_domain(&job.abs_path, upload_as_note);

    let entry = client
        .upload_file(&job.parent_id, Some(&file_id), &name, &job.abs_path, domain)
        .await
        .with_context(|| format!("upload {}", job.rel_path))?;

    let content_hash = MetadataStore::compute_content_hash(&job.abs_path);
    store.set_file_info(
        &job.rel_path,
        &entry.id,
        entry.mtime,
        local_mtime,
        Some(job.parent_id.as_str()),
        domain,
        content_hash.as_deref(),
        entry.create_time,
        meta.len(),
    );

    Ok(true)
}

fn upload_name_and_domain(path: &Path, upload_as_note: bool) -> (String, i32) {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("untitled");
    if upload_as_note && file_name.to_ascii_lowercase().ends_with(".md") {
        let base = file_name.strip_suffix(".md").or_else(|| file_name.strip_suffix(".MD")).unwrap_or(file_name);
        (format!("{base}.note"), 0)
    } else {
        let name = if file_name.to_ascii_lowercase().ends_with(".md") {
            file_name.to_string()
        } else {
            format!("{file_name}.md")
        };
        (name, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_file_id_has_web_prefix_and_no_hyphens() {
        let id = Uploader::generate_file_id();
        assert!(id.starts_with("WEB"));
        assert!(!id.contains('-'));
    }

    #[test]
    fn markdown_upload_keeps_md_extension_and_domain_one() {
        let (name, domain) = upload_name_and_domain(Path::new("notes/a.md"), false);
        assert_eq!(name, "a.md");
        assert_eq!(domain, 1);
    }

    #[test]
    fn upload_as_note_converts_to_note_extension_and_domain_zero() {
        let (name, domain) = upload_name_and_domain(Path::new("notes/a.md"), true);
        assert_eq!(name, "a.note");
        assert_eq!(domain, 0);
    }

    #[test]
    fn non_markdown_file_gets_md_suffix_appended() {
        let (name, domain) = upload_name_and_domain(Path::new("notes/readme"), false);
        assert_eq!(name, "readme.md");
        assert_eq!(domain, 1);
    }
}
