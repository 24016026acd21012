//! Persistent metadata store: per-path (cloud id, mtimes, parent id, content hash)
//! tuples plus a reverse content-hash index, saved as a single atomically-written
//! JSON file.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::path::normalize_rel;

/// MD5 of the empty byte string; the dedup engine treats this hash as a
/// never-duplicate sentinel rather than a real collision.
pub const EMPTY_FILE_HASH: &str = "d41d8cd98f00b204e9800998ecf8427e";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FileRecord {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub cloud_mtime: i64,
    #[serde(default)]
    pub local_mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub domain: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub size: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DirRecord {
    #[serde(default)]
    pub dir_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    files: HashMap<String, FileRecord>,
    #[serde(default)]
    directories: HashMap<String, DirRecord>,
}

struct Inner {
    files: HashMap<String, FileRecord>,
    directories: HashMap<String, DirRecord>,
    hash_index: HashMap<String, String>,
}

pub struct MetadataStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl MetadataStore {
    /// Opens the store at `path`, loading existing content if present. A malformed
    /// file is treated as an empty store with a warning, never a fatal error.
    pub fn load(path: &Path) -> Self {
        let state = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<PersistedState>(&raw).unwrap_or_else(|err| {
                crate::logging::warn(format!(
                    "malformed metadata file at {}: {err}, starting fresh",
                    path.display()
                ));
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        };

        let hash_index = rebuild_hash_index(&state.files);
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                files: state.files,
                directories: state.directories,
                hash_index,
            }),
        }
    }

    /// Atomically persists the store: write to a temp sibling, then rename over.
    pub fn save(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let state = PersistedState {
            files: guard.files.clone(),
            directories: guard.directories.clone(),
        };
        drop(guard);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&state).context("serialize metadata")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    pub fn get_file_info(&self, rel_path: &str) -> Option<FileRecord> {
        let rel_path = normalize_rel(rel_path);
        self.inner.lock().unwrap().files.get(&rel_path).cloned()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_file_info(
        &self,
        rel_path: &str,
        file_id: &str,
        cloud_mtime: i64,
        local_mtime: i64,
        parent_id: Option<&str>,
        domain: i32,
        content_hash: Option<&str>,
        create_time: Option<i64>,
        size: u64,
    ) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();
        let record = FileRecord {
            file_id: file_id.to_string(),
            cloud_mtime,
            local_mtime,
            parent_id: parent_id.map(|s| s.to_string()),
            domain,
            content_hash: content_hash.map(|s| s.to_string()),
            create_time,
            size,
            extra: guard
                .files
                .get(&rel_path)
                .map(|r| r.extra.clone())
                .unwrap_or_default(),
        };
        guard.files.insert(rel_path.clone(), record);
        if let Some(hash) = content_hash {
            if !file_id.is_empty() {
                guard.hash_index.insert(hash.to_string(), rel_path);
            }
        }
    }

    pub fn update_local_mtime(&self, rel_path: &str, mtime: i64) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();
        if let Some(rec) = guard.files.get_mut(&rel_path) {
            rec.local_mtime = mtime;
        }
    }

    pub fn update_cloud_mtime(&self, rel_path: &str, mtime: i64) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();
        if let Some(rec) = guard.files.get_mut(&rel_path) {
            rec.cloud_mtime = mtime;
        }
    }

    /// Updates a record's content hash, maintaining the reverse index
    /// transitively: the old hash's pointer is evicted (re-pointed to another
    /// path with the same old hash if one exists), then the new pointer is set.
    pub fn update_content_hash(&self, rel_path: &str, hash: &str) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();

        let old_hash = guard
            .files
            .get(&rel_path)
            .and_then(|r| r.content_hash.clone());

        if let Some(old) = old_hash {
            if guard.hash_index.get(&old).map(|p| p.as_str()) == Some(rel_path.as_str()) {
                let replacement = guard
                    .files
                    .iter()
                    .find(|(p, r)| {
                        p.as_str() != rel_path
                            && r.content_hash.as_deref() == Some(old.as_str())
                            && !r.file_id.is_empty()
                    })
                    .map(|(p, _)| p.clone());
                match replacement {
                    Some(p) => {
                        guard.hash_index.insert(old, p);
                    }
                    None => {
                        guard.hash_index.remove(&old);
                    }
                }
            }
        }

        let file_id_nonempty = guard
            .files
            .get(&rel_path)
            .map(|r| !r.file_id.is_empty())
            .unwrap_or(false);

        if let Some(rec) = guard.files.get_mut(&rel_path) {
            rec.content_hash = Some(hash.to_string());
        }
        if file_id_nonempty {
            guard.hash_index.insert(hash.to_string(), rel_path);
        }
    }

    /// Evicts the file record at `rel_path`. If the reverse index pointed here,
    /// re-scans for another path holding the same hash; otherwise drops the entry.
    pub fn remove_file(&self, rel_path: &str) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();
        let removed = guard.files.remove(&rel_path);
        if let Some(rec) = removed {
            if let Some(hash) = rec.content_hash {
                if guard.hash_index.get(&hash).map(|p| p.as_str()) == Some(rel_path.as_str()) {
                    let replacement = guard
                        .files
                        .iter()
                        .find(|(_, r)| r.content_hash.as_deref() == Some(hash.as_str()) && !r.file_id.is_empty())
                        .map(|(p, _)| p.clone());
                    match replacement {
                        Some(p) => {
                            guard.hash_index.insert(hash, p);
                        }
                        None => {
                            guard.hash_index.remove(&hash);
                        }
                    }
                }
            }
        }
    }

    pub fn find_by_file_id(&self, id: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap();
        guard
            .files
            .iter()
            .find(|(_, r)| r.file_id == id)
            .map(|(p, _)| p.clone())
    }

    pub fn find_by_dir_id(&self, id: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap();
        guard
            .directories
            .iter()
            .find(|(_, r)| r.dir_id == id)
            .map(|(p, _)| p.clone())
    }

    /// O(1) lookup via the reverse index, with validation and self-heal: if the
    /// index is stale, falls back to a linear scan, fixing the index on hit and
    /// evicting it on miss.
    pub fn find_cloud_file_by_hash(&self, hash: &str, exclude_path: Option<&str>) -> Option<String> {
        let exclude_path = exclude_path.map(normalize_rel);
        let mut guard = self.inner.lock().unwrap();

        if let Some(candidate) = guard.hash_index.get(hash).cloned() {
            let valid = guard
                .files
                .get(&candidate)
                .map(|r| r.content_hash.as_deref() == Some(hash) && !r.file_id.is_empty())
                .unwrap_or(false);
            if valid && exclude_path.as_deref() != Some(candidate.as_str()) {
                return Some(candidate);
            }
            if valid {
                // matched only the excluded path; fall through to linear scan for another
            } else {
                guard.hash_index.remove(hash);
            }
        }

        let found = guard
            .files
            .iter()
            .find(|(p, r)| {
                exclude_path.as_deref() != Some(p.as_str())
                    && r.content_hash.as_deref() == Some(hash)
                    && !r.file_id.is_empty()
            })
            .map(|(p, _)| p.clone());

        if let Some(p) = &found {
            guard.hash_index.insert(hash.to_string(), p.clone());
        }
        found
    }

    pub fn get_dir_id(&self, rel_path: &str) -> Option<String> {
        let rel_path = normalize_rel(rel_path);
        self.inner
            .lock()
            .unwrap()
            .directories
            .get(&rel_path)
            .map(|r| r.dir_id.clone())
    }

    pub fn set_dir_info(&self, rel_path: &str, dir_id: &str, parent_id: Option<&str>) {
        let rel_path = normalize_rel(rel_path);
        let mut guard = self.inner.lock().unwrap();
        let extra = guard
            .directories
            .get(&rel_path)
            .map(|r| r.extra.clone())
            .unwrap_or_default();
        guard.directories.insert(
            rel_path,
            DirRecord {
                dir_id: dir_id.to_string(),
                parent_id: parent_id.map(|s| s.to_string()),
                extra,
            },
        );
    }

    pub fn get_all_files(&self) -> Vec<(String, FileRecord)> {
        let guard = self.inner.lock().unwrap();
        guard.files.iter().map(|(p, r)| (p.clone(), r.clone())).collect()
    }

    pub fn get_all_dirs(&self) -> Vec<(String, DirRecord)> {
        let guard = self.inner.lock().unwrap();
        guard
            .directories
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect()
    }

    /// Reads bytes, normalizes CRLF to LF and strips a leading UTF-8 BOM, then MD5s.
    pub fn compute_content_hash(path: &Path) -> Option<String> {
        let mut file = fs::File::open(path).ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).ok()?;
        Some(hash_normalized_bytes(&buf))
    }
}

fn hash_normalized_bytes(raw: &[u8]) -> String {
    let crlf_normalized = normalize_crlf(raw);
    let stripped = strip_bom(&crlf_normalized);
    format!("{:x}", md5::compute(stripped))
}

fn normalize_crlf(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\r' && i + 1 < raw.len() && raw[i + 1] == b'\n' {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

fn strip_bom(raw: &[u8]) -> &[u8] {
    const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
    if raw.starts_with(&BOM) {
        &raw[3..]
    } else {
        raw
    }
}

fn rebuild_hash_index(files: &HashMap<String, FileRecord>) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for (path, record) in files {
        if record.file_id.is_empty() {
            continue;
        }
        if let Some(hash) = &record.content_hash {
            index.entry(hash.clone()).or_insert_with(|| path.clone());
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_store_path(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("ydnote-sync-metadata-test-{name}"));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.join("metadata.json")
    }

    #[test]
    fn compute_content_hash_normalizes_crlf_and_bom() {
        let dir = env::temp_dir().join("ydnote-sync-hash-test");
        fs::create_dir_all(&dir).unwrap();
        let p1 = dir.join("a.md");
        let p2 = dir.join("b.md");
        fs::write(&p1, b"hello\nworld").unwrap();
        fs::write(&p2, b"\xEF\xBB\xBFhello\r\nworld").unwrap();
        let h1 = MetadataStore::compute_content_hash(&p1).unwrap();
        let h2 = MetadataStore::compute_content_hash(&p2).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn empty_file_hash_matches_known_constant() {
        let dir = env::temp_dir().join("ydnote-sync-empty-hash-test");
        fs::create_dir_all(&dir).unwrap();
        let p = dir.join("empty.md");
        fs::write(&p, b"").unwrap();
        assert_eq!(MetadataStore::compute_content_hash(&p).unwrap(), EMPTY_FILE_HASH);
    }

    #[test]
    fn set_and_get_file_info_round_trips() {
        let path = temp_store_path("basic");
        let store = MetadataStore::load(&path);
        store.set_file_info("a/b.md", "WEB1", 100, 100, Some("parent1"), 1, Some("H1"), Some(50), 100);
        let rec = store.get_file_info("a/b.md").unwrap();
        assert_eq!(rec.file_id, "WEB1");
        assert_eq!(rec.cloud_mtime, 100);
        assert_eq!(store.find_cloud_file_by_hash("H1", None), Some("a/b.md".to_string()));
    }

    #[test]
    fn save_then_load_round_trips_files_and_index() {
        let path = temp_store_path("roundtrip");
        {
            let store = MetadataStore::load(&path);
            store.set_file_info("x.md", "WEB1", 10, 10, None, 1, Some("HX"), None, 100);
            store.set_file_info("y.md", "WEB2", 20, 20, None, 1, Some("HY"), None, 100);
            store.save().unwrap();
        }
        let reloaded = MetadataStore::load(&path);
        let files = reloaded.get_all_files();
        assert_eq!(files.len(), 2);
        assert_eq!(reloaded.find_cloud_file_by_hash("HX", None), Some("x.md".to_string()));
        assert_eq!(reloaded.find_cloud_file_by_hash("HY", None), Some("y.md".to_string()));
    }

    #[test]
    fn remove_file_evicts_and_reassigns_hash_index() {
        let path = temp_store_path("remove-reassign");
        let store = MetadataStore::load(&path);
        store.set_file_info("old.md", "WEB1", 1, 1, None, 1, Some("H"), None, 100);
        store.set_file_info("dup.md", "WEB2", 1, 1, None, 1, Some("H"), None, 100);
        assert_eq!(store.find_cloud_file_by_hash("H", None), Some("old.md".to_string()));

        store.remove_file("old.md");
        // self-heal: index re-points to the remaining holder of the same hash
        assert_eq!(store.find_cloud_file_by_hash("H", None), Some("dup.md".to_string()));
    }

    #[test]
    fn remove_file_drops_index_entry_when_no_replacement_exists() {
        let path = temp_store_path("remove-drop");
        let store = MetadataStore::load(&path);
        store.set_file_info("only.md", "WEB1", 1, 1, None, 1, Some("H"), None, 100);
        store.remove_file("only.md");
        assert_eq!(store.find_cloud_file_by_hash("H", None), None);
    }

    #[test]
    fn update_content_hash_reassigns_old_pointer() {
        let path = temp_store_path("update-hash");
        let store = MetadataStore::load(&path);
        store.set_file_info("a.md", "WEB1", 1, 1, None, 1, Some("H1"), None, 100);
        store.set_file_info("b.md", "WEB2", 1, 1, None, 1, Some("H1"), None, 100);
        assert_eq!(store.find_cloud_file_by_hash("H1", None), Some("a.md".to_string()));

        store.update_content_hash("a.md", "H2");
        assert_eq!(store.find_cloud_file_by_hash("H1", None), Some("b.md".to_string()));
        assert_eq!(store.find_cloud_file_by_hash("H2", None), Some("a.md".to_string()));
    }

    #[test]
    fn find_cloud_file_by_hash_self_heals_on_stale_index() {
        let path = temp_store_path("self-heal");
        let store = MetadataStore::load(&path);
        store.set_file_info("a.md", "WEB1", 1, 1, None, 1, Some("H"), None, 100);
        // directly corrupt the index by pointing it at a path that no longer carries H
        store.update_content_hash("a.md", "other");
        store.set_file_info("b.md", "WEB2", 1, 1, None, 1, Some("H"), None, 100);
        assert_eq!(store.find_cloud_file_by_hash("H", None), Some("b.md".to_string()));
    }

    #[test]
    fn unknown_fields_round_trip_through_extra() {
        let path = temp_store_path("extra-fields");
        fs::write(
            &path,
            r#"{"files":{"a.md":{"file_id":"WEB1","cloud_mtime":1,"local_mtime":1,"legacy_flag":true}},"directories":{}}"#,
        )
        .unwrap();
        let store = MetadataStore::load(&path);
        store.save().unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("legacy_flag"));
    }
}
