//! Content-level dedup: finds groups of files sharing a content hash and
//! reconciles them down to one survivor per group.
//!
//! Three situations are handled once a hash+size group has at least two members:
//! - all-local group (neither copy was ever uploaded): left alone, there is no
//!   cloud copy to prefer over another.
//! - mixed group (some copies uploaded, some not): the local-only copies are
//!   redundant once a cloud copy exists, and are removed unless they're a
//!   referenced asset.
//! - all-cloud group (the same content uploaded more than once): one survivor
//!   is kept and the rest are deleted both locally and in the cloud, with
//!   asset files additionally protected by reference.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::cloud_client::CloudClient;
use crate::metadata_store::{FileRecord, MetadataStore, EMPTY_FILE_HASH};
use crate::path::depth;

pub const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp", ".svg", ".ico", ".pdf", ".amr", ".mp3",
    ".mp4", ".wav",
];

static MD_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!?\[[^\]]*\]\(([^)]+)\)|src="([^"]+)""#).unwrap());

#[derive(Debug, Default)]
pub struct DedupStats {
    pub groups_found: u64,
    pub deleted_local: u64,
    pub deleted_cloud: u64,
    pub referenced_skipped: u64,
    pub skipped: u64,
}

pub struct DedupEngine {
    store: Arc<MetadataStore>,
    client: Arc<dyn CloudClient>,
    local_root: PathBuf,
}

impl DedupEngine {
    pub fn new(store: Arc<MetadataStore>, client: Arc<dyn CloudClient>, local_root: PathBuf) -> Self {
        Self { store, client, local_root }
    }

    /// Reads every known `.md` file under the local root and pairs its
    /// relative path with its body, ready to hand to `collect_referenced_paths`.
    pub fn scan_markdown_bodies(&self) -> Vec<(String, String)> {
        let mut bodies = Vec::new();
        for (rel_path, _) in self.store.get_all_files() {
            if !rel_path.to_ascii_lowercase().ends_with(".md") {
                continue;
            }
            let abs = self.local_root.join(&rel_path);
            if let Ok(body) = std::fs::read_to_string(&abs) {
                bodies.push((rel_path, body));
            }
        }
        bodies
    }

    /// Scans Markdown file contents for `![..](..)` and `src="..."` references,
    /// returning the set of referenced relative paths. Referenced assets are
    /// never deleted even when they're part of a duplicate group.
    pub fn collect_referenced_paths(markdown_bodies: &[(String, String)]) -> HashSet<String> {
        let mut referenced = HashSet::new();
        for (_path, body) in markdown_bodies {
            for caps in MD_REF_RE.captures_iter(body) {
                let target = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
                if let Some(target) = target {
                    if is_remote_or_data_uri(target) {
                        continue;
                    }
                    let cleaned = target.split(['?', '#']).next().unwrap_or(target);
                    referenced.insert(crate::path::normalize_rel(cleaned));
                }
            }
        }
        referenced
    }

    pub async fn run(&self, referenced: &HashSet<String>) -> DedupStats {
        let mut stats = DedupStats::default();
        let files = self.store.get_all_files();

        let mut by_hash: HashMap<String, Vec<(String, FileRecord)>> = HashMap::new();
        for (path, record) in files {
            let Some(hash) = &record.content_hash else { continue };
            if hash == EMPTY_FILE_HASH {
                continue;
            }
            by_hash.entry(hash.clone()).or_default().push((path, record));
        }

        for (hash, group) in by_hash {
            if group.len() < 2 {
                continue;
            }

            let mut by_size: HashMap<u64, Vec<(String, FileRecord)>> = HashMap::new();
            for (path, record) in group {
                by_size.entry(record.size).or_default().push((path, record));
            }

            if by_size.len() > 1 {
                // Same hash, different sizes: MD5 collision, not a real
                // duplicate. Count the group but exclude it from deletion.
                stats.groups_found += 1;
                stats.skipped += 1;
                for (_size, sub_group) in &by_size {
                    if let Some((path, _)) = sub_group.first() {
                        crate::logging::warn_kv(
                            "hash matches but size differs, suspected MD5 collision",
                            &[("hash", hash.as_str()), ("path", path.as_str())],
                        );
                    }
                }
                continue;
            }

            for (_size, sub_group) in by_size {
                if sub_group.len() < 2 {
                    continue;
                }
                stats.groups_found += 1;
                self.process_group(sub_group, referenced, &mut stats).await;
            }
        }

        stats
    }

    async fn process_group(&self, group: Vec<(String, FileRecord)>, referenced: &HashSet<String>, stats: &mut DedupStats) {
        let (cloud_paths, local_only): (Vec<_>, Vec<_>) =
            group.into_iter().partition(|(_, r)| !r.file_id.is_empty());

        if cloud_paths.is_empty() {
            return; // all-local: never auto-prune
        }

        if !local_only.is_empty() {
            for (path, _record) in local_only {
                if is_asset_path(&path) && referenced.contains(&path) {
                    stats.referenced_skipped += 1;
                    continue;
                }
                self.delete_local_only(&path, stats);
            }
            return;
        }

        // all-cloud group
        if cloud_paths.len() < 2 {
            return;
        }

        let all_asset = cloud_paths.iter().all(|(path, _)| is_asset_path(path));
        if all_asset {
            let referenced_count = cloud_paths.iter().filter(|(path, _)| referenced.contains(path)).count();
            if referenced_count == cloud_paths.len() {
                return; // all referenced: skip entirely
            }
            if referenced_count == 0 {
                self.keep_best_delete_rest(cloud_paths, stats).await;
            } else {
                for (path, record) in cloud_paths {
                    if referenced.contains(&path) {
                        stats.referenced_skipped += 1;
                        continue;
                    }
                    self.delete_cloud_and_local(&path, &record, stats).await;
                }
            }
        } else {
            self.keep_best_delete_rest(cloud_paths, stats).await;
        }
    }

    async fn keep_best_delete_rest(&self, mut group: Vec<(String, FileRecord)>, stats: &mut DedupStats) {
        group.sort_by(|a, b| score_key(a).cmp(&score_key(b)));
        for (path, record) in group.into_iter().skip(1) {
            self.delete_cloud_and_local(&path, &record, stats).await;
        }
    }

    async fn delete_cloud_and_local(&self, path: &str, record: &FileRecord, stats: &mut DedupStats) {
        if !record.file_id.is_empty() {
            match self.client.delete_file(&record.file_id).await {
                Ok(()) => stats.deleted_cloud += 1,
                Err(err) => {
                    crate::logging::warn_kv(
                        "cloud-side duplicate delete failed, keeping record",
                        &[("path", path), ("error", &err.to_string())],
                    );
                    return;
                }
            }
        }
        self.delete_local_only(path, stats);
    }

    fn delete_local_only(&self, path: &str, stats: &mut DedupStats) {
        let abs = self.local_root.join(path);
        if let Err(err) = std::fs::remove_file(&abs) {
            if err.kind() != std::io::ErrorKind::NotFound {
                crate::logging::warn_kv(
                    "local duplicate delete failed",
                    &[("path", path), ("error", &err.to_string())],
                );
            }
        }
        self.store.remove_file(path);
        stats.deleted_local += 1;
        gc_empty_parents(&self.local_root, &abs);
    }
}

fn is_remote_or_data_uri(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("data:")
        || target.starts_with("//")
}

fn is_asset_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    ASSET_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Removes `leaf`'s parent directory and every empty ancestor above it, up to
/// (but never including) `root`.
fn gc_empty_parents(root: &Path, leaf: &Path) {
    let mut dir = leaf.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        match std::fs::read_dir(&d) {
            Ok(mut entries) if entries.next().is_none() => {
                if std::fs::remove_dir(&d).is_err() {
                    break;
                }
                dir = d.parent().map(Path::to_path_buf);
            }
            _ => break,
        }
    }
}

/// Sort key: deeper paths first (tiebreak: shorter basename, earlier create
/// time, earlier cloud mtime, earlier on-disk mtime). The first element after
/// sorting is the preferred survivor.
fn score_key(entry: &(String, FileRecord)) -> (std::cmp::Reverse<usize>, usize, i64, i64, i64) {
    let (path, record) = entry;
    let basename_len = path.rsplit('/').next().unwrap_or(path).len();
    let create_time = record.create_time.unwrap_or(i64::MAX);
    (
        std::cmp::Reverse(depth(path)),
        basename_len,
        create_time,
        record.cloud_mtime,
        record.local_mtime,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_referenced_paths_finds_markdown_image_links() {
        let bodies = vec![(
            "a.md".to_string(),
            "see ![pic](assets/pic.png) and <img src=\"assets/b.jpg\">".to_string(),
        )];
        let refs = DedupEngine::collect_referenced_paths(&bodies);
        assert!(refs.contains("assets/pic.png"));
        assert!(refs.contains("assets/b.jpg"));
    }

    #[test]
    fn collect_referenced_paths_ignores_remote_and_data_uris() {
        let bodies = vec![(
            "a.md".to_string(),
            "![remote](https://example.com/x.png) ![inline](data:image/png;base64,AAAA)".to_string(),
        )];
        let refs = DedupEngine::collect_referenced_paths(&bodies);
        assert!(refs.is_empty());
    }

    #[test]
    fn is_asset_path_matches_known_extensions_case_insensitively() {
        assert!(is_asset_path("assets/PHOTO.PNG"));
        assert!(is_asset_path("assets/clip.mp4"));
        assert!(!is_asset_path("notes/readme.md"));
    }

    #[test]
    fn score_key_prefers_deeper_path() {
        let shallow = ("a.md".to_string(), FileRecord::default());
        let deep = ("folder/sub/a.md".to_string(), FileRecord::default());
        assert!(score_key(&deep) < score_key(&shallow));
    }

    #[test]
    fn score_key_prefers_earlier_create_time() {
        let earlier = (
            "a.md".to_string(),
            FileRecord { create_time: Some(100), ..Default::default() },
        );
        let later = (
            "b.md".to_string(),
            FileRecord { create_time: Some(200), ..Default::default() },
        );
        assert!(score_key(&earlier) < score_key(&later));
    }

    #[tokio::test]
    async fn all_local_group_is_left_alone() {
        let dir = std::env::temp_dir().join("ydnote-sync-dedup-all-local");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let store = Arc::new(MetadataStore::load(&dir.join("metadata.json")));
        store.set_file_info("a.md", "", 0, 1, None, 1, Some("H"), None, 10);
        store.set_file_info("b.md", "", 0, 1, None, 1, Some("H"), None, 10);

        let client: Arc<dyn CloudClient> = Arc::new(NoopClient);
        let engine = DedupEngine::new(store.clone(), client, dir);
        let stats = engine.run(&HashSet::new()).await;
        assert_eq!(stats.deleted_local, 0);
        assert_eq!(stats.deleted_cloud, 0);
        assert!(store.get_file_info("a.md").is_some());
        assert!(store.get_file_info("b.md").is_some());
    }

    #[tokio::test]
    async fn mixed_group_deletes_unreferenced_local_only_copy() {
        let dir = std::env::temp_dir().join("ydnote-sync-dedup-mixed");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("local_copy.png"), b"same-bytes").unwrap();

        let store = Arc::new(MetadataStore::load(&dir.join("metadata.json")));
        store.set_file_info("cloud_copy.png", "WEB1", 1, 1, None, 1, Some("H"), None, 10);
        store.set_file_info("local_copy.png", "", 0, 1, None, 1, Some("H"), None, 10);

        let client: Arc<dyn CloudClient> = Arc::new(NoopClient);
        let engine = DedupEngine::new(store.clone(), client, dir.clone());
        let stats = engine.run(&HashSet::new()).await;

        assert_eq!(stats.deleted_local, 1);
        assert!(store.get_file_info("cloud_copy.png").is_some());
        assert!(store.get_file_info("local_copy.png").is_none());
        assert!(!dir.join("local_copy.png").exists());
    }

    #[tokio::test]
    async fn collision_guard_skips_same_hash_different_size() {
        let dir = std::env::temp_dir().join("ydnote-sync-dedup-collision");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let store = Arc::new(MetadataStore::load(&dir.join("metadata.json")));
        store.set_file_info("a.md", "", 0, 1, None, 1, Some("H"), None, 5);
        store.set_file_info("b.md", "", 0, 1, None, 1, Some("H"), None, 29);

        let client: Arc<dyn CloudClient> = Arc::new(NoopClient);
        let engine = DedupEngine::new(store.clone(), client, dir);
        let stats = engine.run(&HashSet::new()).await;

        assert_eq!(stats.groups_found, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.deleted_local, 0);
        assert_eq!(stats.deleted_cloud, 0);
        assert!(store.get_file_info("a.md").is_some());
        assert!(store.get_file_info("b.md").is_some());
    }

    struct NoopClient;

    #[async_trait::async_trait]
    impl CloudClient for NoopClient {
        async fn root_dir_id(&self) -> anyhow::Result<String> {
            Ok("root".to_string())
        }
        async fn list_dir(&self, _dir_id: &str, _cursor: Option<&str>) -> anyhow::Result<crate::cloud_client::CloudListPage> {
            Ok(crate::cloud_client::CloudListPage { entries: vec![], next_cursor: None })
        }
        async fn create_dir(&self, _parent_id: &str, _name: &str) -> anyhow::Result<crate::cloud_client::CloudEntry> {
            anyhow::bail!("not supported in test")
        }
        async fn download_file(&self, _file_id: &str, _dest: &Path) -> anyhow::Result<()> {
            anyhow::bail!("not supported in test")
        }
        async fn upload_file(
            &self,
            _parent_id: &str,
            _file_id: Option<&str>,
            _name: &str,
            _local_path: &Path,
            _domain: i32,
        ) -> anyhow::Result<crate::cloud_client::CloudEntry> {
            anyhow::bail!("not supported in test")
        }
        async fn delete_file(&self, _file_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
