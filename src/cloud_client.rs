//! Abstract cloud transport boundary (`CloudClient`) plus the one concrete,
//! network-facing implementation (`HttpCloudClient`). Every other module talks
//! to the cloud only through the trait, so the transport is swappable in tests.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, ClientBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(200);

/// A single entry returned while listing a cloud directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEntry {
    pub id: String,
    pub name: String,
    pub is_dir: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub domain: i32,
}

/// Body returned alongside a 409 on `mkdir` when the name already exists
/// under that parent; the cloud treats this as the existing directory's id.
#[derive(Debug, Deserialize)]
struct DuplicateNameResponse {
    #[serde(rename = "existingId")]
    existing_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudListPage {
    pub entries: Vec<CloudEntry>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// The abstract boundary between sync logic and the network. Implemented once
/// for real traffic (`HttpCloudClient`) and by hand in tests.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn root_dir_id(&self) -> Result<String>;

    /// One page of a directory's children. Callers paginate by following
    /// `next_cursor` until it is `None`.
    async fn list_dir(&self, dir_id: &str, cursor: Option<&str>) -> Result<CloudListPage>;

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<CloudEntry>;

    /// Downloads file content to `dest` (a local, non-final path the caller
    /// renames into place).
    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()>;

    /// Uploads `local_path` as a child of `parent_id`. `file_id` is `Some` when
    /// overwriting an existing cloud file, `None` when creating a new one.
    async fn upload_file(
        &self,
        parent_id: &str,
        file_id: Option<&str>,
        name: &str,
        local_path: &Path,
        domain: i32,
    ) -> Result<CloudEntry>;

    /// Deletes a cloud file outright (used by the dedup engine to remove a
    /// redundant cloud copy, never by ordinary sync).
    async fn delete_file(&self, file_id: &str) -> Result<()>;
}

pub struct HttpCloudClient {
    base: String,
    http: HttpClient,
    email: String,
}

impl HttpCloudClient {
    pub fn new(base_url: &str, email: &str) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(5 * 60))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("ydnote-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
            email: email.to_string(),
        })
    }

    async fn with_retry<F, Fut>(&self, op: &str, mut make_request: F) -> Result<Response>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = reqwest::Result<Response>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match make_request().await {
                Ok(resp) if resp.status().is_server_error() && attempt < MAX_ATTEMPTS => {
                    crate::logging::warn_kv(
                        "cloud request retrying after server error",
                        &[("op", op), ("attempt", &attempt.to_string()), ("status", resp.status().as_str())],
                    );
                }
                Ok(resp) => return Ok(resp),
                Err(err) if attempt < MAX_ATTEMPTS && (err.is_timeout() || err.is_connect()) => {
                    crate::logging::warn_kv(
                        "cloud request retrying after transport error",
                        &[("op", op), ("attempt", &attempt.to_string()), ("error", &err.to_string())],
                    );
                }
                Err(err) => return Err(err).with_context(|| format!("{op} request")),
            }
            tokio::time::sleep(BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
        }
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn root_dir_id(&self) -> Result<String> {
        let url = format!("{}/yws/open/api/personal/file/root", self.base);
        let resp = self
            .with_retry("root_dir_id", || self.http.get(&url).query(&[("userid", &self.email)]).send())
            .await?;
        let entry: CloudEntry = map_json(resp, "root_dir_id").await?;
        Ok(entry.id)
    }

    async fn list_dir(&self, dir_id: &str, cursor: Option<&str>) -> Result<CloudListPage> {
        let url = format!("{}/yws/open/api/personal/file/list", self.base);
        let cursor = cursor.unwrap_or("");
        let resp = self
            .with_retry("list_dir", || {
                self.http
                    .get(&url)
                    .query(&[("dirId", dir_id), ("cursor", cursor)])
                    .send()
            })
            .await?;
        map_json(resp, "list_dir").await
    }

    async fn create_dir(&self, parent_id: &str, name: &str) -> Result<CloudEntry> {
        let url = format!("{}/yws/open/api/personal/file/mkdir", self.base);
        let resp = self
            .with_retry("create_dir", || {
                self.http
                    .post(&url)
                    .form(&[("parentId", parent_id), ("name", name)])
                    .send()
            })
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            let text = resp.text().await.unwrap_or_default();
            let existing: DuplicateNameResponse = serde_json::from_str(&text)
                .with_context(|| format!("create_dir duplicate-name payload: {text}"))?;
            return Ok(CloudEntry {
                id: existing.existing_id,
                name: name.to_string(),
                is_dir: true,
                parent_id: Some(parent_id.to_string()),
                mtime: 0,
                create_time: None,
                size: 0,
                domain: 0,
            });
        }

        map_json(resp, "create_dir").await
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/yws/open/api/personal/file/download", self.base);
        let resp = self
            .with_retry("download_file", || self.http.get(&url).query(&[("fileId", file_id)]).send())
            .await?;
        let resp = check_status(resp, "download_file").await?;
        let bytes = resp.bytes().await.context("read download body")?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(dest, &bytes)
            .await
            .with_context(|| format!("write {}", dest.display()))?;
        Ok(())
    }

    async fn upload_file(
        &self,
        parent_id: &str,
        file_id: Option<&str>,
        name: &str,
        local_path: &Path,
        domain: i32,
    ) -> Result<CloudEntry> {
        let url = format!("{}/yws/open/api/personal/file/upload", self.base);
        let file_id = file_id.map(|s| s.to_string());
        let name = name.to_string();
        let parent_id = parent_id.to_string();
        let local_path = local_path.to_path_buf();

        let resp = self
            .with_retry("upload_file", || {
                let file_id = file_id.clone();
                let name = name.clone();
                let parent_id = parent_id.clone();
                let local_path = local_path.clone();
                async move {
                    let form = reqwest::multipart::Form::new()
                        .text("parentId", parent_id)
                        .text("name", name)
                        .text("domain", domain.to_string())
                        .text("fileId", file_id.unwrap_or_default())
                        .file("file", &local_path)
                        .await?;
                    self.http.post(&url).multipart(form).send().await
                }
            })
            .await?;
        map_json(resp, "upload_file").await
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/yws/open/api/personal/file/delete", self.base);
        let resp = self
            .with_retry("delete_file", || self.http.post(&url).form(&[("fileId", file_id)]).send())
            .await?;
        check_status(resp, "delete_file").await?;
        Ok(())
    }
}

async fn check_status(resp: Response, op: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => anyhow::bail!("{op} unauthorized: {text}"),
        StatusCode::FORBIDDEN => anyhow::bail!("{op} forbidden: {text}"),
        StatusCode::NOT_FOUND => anyhow::bail!("{op} not found: {text}"),
        _ => anyhow::bail!("{op} failed: {status} {text}"),
    }
}

async fn map_json<T: serde::de::DeserializeOwned>(resp: Response, op: &str) -> Result<T> {
    let resp = check_status(resp, op).await?;
    resp.json::<T>().await.with_context(|| format!("{op} parse response"))
}
