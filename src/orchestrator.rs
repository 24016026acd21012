//! Ties scanning, decision-making, and the uploader/downloader/conflict-backup
//! collaborators into a single sync pass. This is the only module that knows
//! about all the others at once.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cloud_client::CloudClient;
use crate::config::Config;
use crate::decision::{decide, Decision, SideState};
use crate::dedup::DedupEngine;
use crate::downloader::{DownloadJob, Downloader};
use crate::filters::SyncFilters;
use crate::metadata_store::MetadataStore;
use crate::scanner::{CloudScanner, LocalScanner};
use crate::uploader::{UploadJob, Uploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    Push,
    Pull,
    Both,
}

/// Final public return surface of a sync pass: six counters and nothing else.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub dedup_deleted: u64,
}

pub struct Orchestrator {
    cfg: Config,
    client: Arc<dyn CloudClient>,
    store: Arc<MetadataStore>,
    filters: SyncFilters,
    local_scanner: LocalScanner,
    changed_paths: Vec<PathBuf>,
}

impl Orchestrator {
    pub fn new(cfg: Config, client: Arc<dyn CloudClient>) -> Result<Self> {
        let store = Arc::new(MetadataStore::load(&cfg.metadata_path));
        let filters = SyncFilters::load(&cfg.local_dir)?;
        Ok(Self {
            cfg,
            client,
            store,
            filters,
            local_scanner: LocalScanner::new(),
            changed_paths: Vec::new(),
        })
    }

    pub fn store(&self) -> Arc<MetadataStore> {
        self.store.clone()
    }

    /// Absolute local paths touched (uploaded to or downloaded into) by the
    /// most recent `sync_once` call. Feeds the optional auto-commit sink.
    pub fn changed_paths(&self) -> &[PathBuf] {
        &self.changed_paths
    }

    /// Runs one full reconciliation pass: scan both sides, decide per path,
    /// execute uploads/downloads/conflict-backups, then persist metadata.
    pub async fn sync_once(&mut self) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        self.changed_paths.clear();

        let root_id = self.client.root_dir_id().await.context("root_dir_id")?;
        let local = self
            .local_scanner
            .scan(&self.cfg.local_dir, &self.filters)
            .context("scan local")?;

        let cloud_scanner = CloudScanner::new(self.client.clone(), self.cfg.pool_cloud_scan);
        let (cloud_files, _cloud_dirs) = cloud_scanner.scan(&root_id).await.context("scan cloud")?;

        let mut upload_jobs = Vec::new();
        let mut download_jobs = Vec::new();

        let mut all_paths: std::collections::HashSet<String> = std::collections::HashSet::new();
        all_paths.extend(local.keys().cloned());
        all_paths.extend(cloud_files.keys().cloned());
        for (path, _) in self.store.get_all_files() {
            all_paths.insert(path);
        }

        for rel_path in all_paths {
            if self.filters.should_ignore(&rel_path) || SyncFilters::is_marked_rel_path(&rel_path) {
                continue;
            }

            let local_entry = local.get(&rel_path);
            let cloud_entry = cloud_files.get(&rel_path);
            let known = self.store.get_file_info(&rel_path);

            let local_side = match local_entry {
                Some(e) => SideState::present(e.mtime),
                None => SideState::absent(),
            };
            let cloud_side = match cloud_entry {
                Some(e) => SideState::present(e.mtime),
                None => SideState::absent(),
            };
            let known_local = known.as_ref().map(|r| r.local_mtime);
            let known_cloud = known.as_ref().map(|r| r.cloud_mtime);

            let decision = decide(local_side, cloud_side, known_local, known_cloud);

            match decision {
                Decision::NoOp => {
                    stats.skipped += 1;
                }
                Decision::Upload if self.direction_allows_push() => {
                    if let Some(entry) = local_entry {
                        if let Some(hash) = MetadataStore::compute_content_hash(&entry.abs_path) {
                            if self.store.find_cloud_file_by_hash(&hash, Some(&rel_path)).is_some() {
                                stats.skipped += 1;
                                continue;
                            }
                        }
                        let parent_rel = parent_of(&rel_path);
                        match self.uploader().ensure_cloud_dir(&parent_rel, &root_id).await {
                            Ok(parent_id) => upload_jobs.push(UploadJob {
                                rel_path: rel_path.clone(),
                                abs_path: entry.abs_path.clone(),
                                parent_id,
                            }),
                            Err(err) => {
                                crate::logging::error_kv(
                                    "failed to ensure cloud dir for upload",
                                    &[("path", rel_path.as_str()), ("error", &err.to_string())],
                                );
                                stats.errors += 1;
                            }
                        }
                    }
                }
                Decision::Download if self.direction_allows_pull() => {
                    if let Some(entry) = cloud_entry {
                        download_jobs.push(DownloadJob {
                            rel_path: rel_path.clone(),
                            file_id: entry.id.clone(),
                            target: self.cfg.local_dir.join(&rel_path),
                            cloud_mtime: entry.mtime,
                            parent_id: entry.parent_id.clone(),
                            domain: entry.domain,
                            create_time: entry.create_time,
                        });
                    }
                }
                Decision::Conflict => {
                    stats.conflicts += 1;
                    if let Some(local_entry) = local_entry {
                        if let Err(err) = crate::conflict_backup::backup(&local_entry.abs_path) {
                            crate::logging::error_kv(
                                "conflict backup failed",
                                &[("path", rel_path.as_str()), ("error", &err.to_string())],
                            );
                            stats.errors += 1;
                            continue;
                        }
                    }
                    if self.direction_allows_pull() {
                        if let Some(entry) = cloud_entry {
                            download_jobs.push(DownloadJob {
                                rel_path: rel_path.clone(),
                                file_id: entry.id.clone(),
                                target: self.cfg.local_dir.join(&rel_path),
                                cloud_mtime: entry.mtime,
                                parent_id: entry.parent_id.clone(),
                                domain: entry.domain,
                                create_time: entry.create_time,
                            });
                        }
                    }
                }
                _ => stats.skipped += 1,
            }
        }

        self.changed_paths.extend(upload_jobs.iter().map(|j| j.abs_path.clone()));
        self.changed_paths.extend(download_jobs.iter().map(|j| j.target.clone()));

        if !upload_jobs.is_empty() {
            let upload_stats = self.uploader().run(upload_jobs).await;
            stats.uploaded += upload_stats.uploaded;
            stats.skipped += upload_stats.skipped;
            stats.errors += upload_stats.errors;
        }

        if !download_jobs.is_empty() {
            let downloader = Downloader::new(
                self.client.clone(),
                self.store.clone(),
                self.cfg.pool_downloads,
                self.cfg.batch_size,
            );
            let download_stats = downloader.run(download_jobs).await;
            stats.downloaded += download_stats.downloaded;
            stats.skipped += download_stats.skipped;
            stats.errors += download_stats.errors;
        }

        let changed = stats.downloaded > 0 || stats.uploaded > 0 || stats.conflicts > 0;
        if changed {
            let engine = DedupEngine::new(self.store.clone(), self.client.clone(), self.cfg.local_dir.clone());
            let referenced = DedupEngine::collect_referenced_paths(&engine.scan_markdown_bodies());
            let dedup_stats = engine.run(&referenced).await;
            crate::logging::info_kv(
                "post-sync dedup complete",
                &[
                    ("groups_found", &dedup_stats.groups_found.to_string()),
                    ("deleted_local", &dedup_stats.deleted_local.to_string()),
                    ("deleted_cloud", &dedup_stats.deleted_cloud.to_string()),
                    ("skipped", &dedup_stats.skipped.to_string()),
                ],
            );
            stats.dedup_deleted += dedup_stats.deleted_local;
        }

        self.store.save().context("save metadata")?;
        Ok(stats)
    }

    fn uploader(&self) -> Uploader {
        Uploader::new(
            self.client.clone(),
            self.store.clone(),
            self.cfg.pool_uploads,
            self.cfg.upload_as_note,
            self.cfg.batch_size,
        )
    }

    fn direction_allows_push(&self) -> bool {
        matches!(self.cfg.direction, SyncDirection::Push | SyncDirection::Both)
    }

    fn direction_allows_pull(&self) -> bool {
        matches!(self.cfg.direction, SyncDirection::Pull | SyncDirection::Both)
    }
}

fn parent_of(rel_path: &str) -> String {
    rel_path.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default()
}

pub fn metadata_dir(local_dir: &PathBuf) -> PathBuf {
    local_dir.join(".ydsync")
}
