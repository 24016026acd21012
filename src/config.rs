use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::orchestrator::SyncDirection;
use crate::path::absolutize;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    local_dir: Option<PathBuf>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    pool_cloud_scan: Option<usize>,
    #[serde(default)]
    pool_downloads: Option<usize>,
    #[serde(default)]
    pool_uploads: Option<usize>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default)]
    debounce_seconds: Option<u64>,
    #[serde(default)]
    poll_interval_seconds: Option<u64>,
    #[serde(default)]
    metadata_path: Option<PathBuf>,
    #[serde(default)]
    upload_as_note: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub local_dir: PathBuf,
    #[serde(default)]
    pub email: Option<String>,
    pub server_url: String,
    pub direction: SyncDirection,
    pub pool_cloud_scan: usize,
    pub pool_downloads: usize,
    pub pool_uploads: usize,
    pub batch_size: usize,
    pub debounce_seconds: u64,
    pub poll_interval_seconds: u64,
    pub metadata_path: PathBuf,
    pub upload_as_note: bool,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub local_dir: Option<PathBuf>,
    pub email: Option<String>,
    pub server_url: Option<String>,
    pub direction: Option<SyncDirection>,
    pub upload_as_note: Option<bool>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".ydnote-sync").join("logs").join("sync.log")
}

impl Config {
    pub fn default_local_dir() -> PathBuf {
        home_dir().join("YoudaoNote")
    }

    pub fn default_server_url() -> &'static str {
        "https://note.youdao.com"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".ydnote-sync").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize(p);
        }
        if let Ok(env_path) = std::env::var("YDNOTE_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize(Path::new(env_path));
            }
        }
        absolutize(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).unwrap_or_else(|err| {
                crate::logging::warn(format!("malformed config at {}: {err}", path.display()));
                PartialConfig::default()
            })
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let local_dir = overrides
            .local_dir
            .or(env_cfg.local_dir)
            .or(file_cfg.local_dir)
            .unwrap_or_else(Self::default_local_dir);
        let email = overrides.email.or(env_cfg.email).or(file_cfg.email);
        let server_url = overrides
            .server_url
            .or(env_cfg.server_url)
            .or(file_cfg.server_url)
            .unwrap_or_else(|| Self::default_server_url().to_string());
        let direction = overrides
            .direction
            .or(env_cfg.direction.and_then(|d| parse_direction(&d)))
            .or(file_cfg.direction.and_then(|d| parse_direction(&d)))
            .unwrap_or(SyncDirection::Both);
        let pool_cloud_scan = file_cfg.pool_cloud_scan.unwrap_or(8);
        let pool_downloads = file_cfg.pool_downloads.unwrap_or(10);
        let pool_uploads = file_cfg.pool_uploads.unwrap_or(5);
        let batch_size = file_cfg.batch_size.unwrap_or(50);
        let debounce_seconds = file_cfg.debounce_seconds.unwrap_or(5);
        let poll_interval_seconds = file_cfg.poll_interval_seconds.unwrap_or(60);
        let upload_as_note = overrides
            .upload_as_note
            .or(file_cfg.upload_as_note)
            .unwrap_or(false);
        let metadata_path = file_cfg
            .metadata_path
            .unwrap_or_else(|| local_dir.join(".ydsync").join("metadata.json"));

        let mut cfg = Config {
            local_dir,
            email,
            server_url,
            direction,
            pool_cloud_scan,
            pool_downloads,
            pool_uploads,
            batch_size,
            debounce_seconds,
            poll_interval_seconds,
            metadata_path,
            upload_as_note,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }

    fn normalize(&mut self) {
        if let Some(email) = &mut self.email {
            *email = email.to_lowercase();
        }
        self.local_dir = absolutize(&self.local_dir);
        self.metadata_path = absolutize(&self.metadata_path);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize(&p));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.local_dir.as_os_str().is_empty() {
            anyhow::bail!("local_dir must not be empty");
        }
        validate_url(&self.server_url).context("server_url")?;
        if let Some(email) = &self.email {
            validate_email(email)?;
        }
        if self.pool_cloud_scan == 0 || self.pool_downloads == 0 || self.pool_uploads == 0 {
            anyhow::bail!("pool sizes must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    local_dir: &'a PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: &'a Option<String>,
    server_url: &'a str,
    direction: SyncDirection,
    pool_cloud_scan: usize,
    pool_downloads: usize,
    pool_uploads: usize,
    batch_size: usize,
    debounce_seconds: u64,
    poll_interval_seconds: u64,
    metadata_path: &'a PathBuf,
    upload_as_note: bool,
}

fn save_config_file(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let persisted = PersistedConfig {
        local_dir: &cfg.local_dir,
        email: &cfg.email,
        server_url: &cfg.server_url,
        direction: cfg.direction,
        pool_cloud_scan: cfg.pool_cloud_scan,
        pool_downloads: cfg.pool_downloads,
        pool_uploads: cfg.pool_uploads,
        batch_size: cfg.batch_size,
        debounce_seconds: cfg.debounce_seconds,
        poll_interval_seconds: cfg.poll_interval_seconds,
        metadata_path: &cfg.metadata_path,
        upload_as_note: cfg.upload_as_note,
    };
    let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn parse_direction(raw: &str) -> Option<SyncDirection> {
    match raw.to_ascii_lowercase().as_str() {
        "push" => Some(SyncDirection::Push),
        "pull" => Some(SyncDirection::Pull),
        "both" => Some(SyncDirection::Both),
        _ => None,
    }
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap()
    });
    if PATTERN.is_match(email) {
        Ok(())
    } else {
        anyhow::bail!("invalid email: {email}")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("YDNOTE_EMAIL") {
        let v = v.trim();
        if !v.is_empty() {
            out.email = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("YDNOTE_LOCAL_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            out.local_dir = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("YDNOTE_SERVER_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.server_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("YDNOTE_DIRECTION") {
        let v = v.trim();
        if !v.is_empty() {
            out.direction = Some(v.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> =
        once_cell::sync::Lazy::new(|| Mutex::new(()));

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    const ENV_KEYS: &[&str] = &[
        "YDNOTE_EMAIL",
        "YDNOTE_LOCAL_DIR",
        "YDNOTE_SERVER_URL",
        "YDNOTE_DIRECTION",
    ];

    #[test]
    fn load_config_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);
        for k in ENV_KEYS {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("ydnote-sync-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let local_dir = tmp.join("data").display().to_string().replace('\\', "/");
        let json = format!(
            r#"{{
                "email": "Alice@Example.com",
                "local_dir": "{local_dir}",
                "server_url": "http://127.0.0.1:8080",
                "direction": "push"
            }}"#
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email.as_deref(), Some("alice@example.com"));
        assert_eq!(cfg.server_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.direction, SyncDirection::Push);
        assert!(cfg.local_dir.is_absolute());
        assert_eq!(
            cfg.metadata_path,
            absolutize(&cfg.local_dir.join(".ydsync").join("metadata.json"))
        );
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);
        for k in ENV_KEYS {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("ydnote-sync-config-test-bad-url");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{"local_dir":"/tmp/data","server_url":"ftp://bad.example.com"}"#,
        )
        .unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }

    #[test]
    fn reject_invalid_email() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);
        for k in ENV_KEYS {
            env::remove_var(k);
        }

        let tmp = env::temp_dir().join("ydnote-sync-config-test-bad-email");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            r#"{"local_dir":"/tmp/data","server_url":"http://localhost:8080","email":"not-an-email"}"#,
        )
        .unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid email"));
    }

    #[test]
    fn overrides_beat_env_beat_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("ydnote-sync-config-precedence");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let file_dir = tmp.join("file-data");
        let env_dir = tmp.join("env-data");
        let flag_dir = tmp.join("flag-data");

        let cfg_path = tmp.join("config.json");
        let file_dir_str = file_dir.display().to_string().replace('\\', "/");
        fs::write(
            &cfg_path,
            format!(
                r#"{{"email":"file@example.com","local_dir":"{file_dir_str}","server_url":"https://file.example.com"}}"#
            ),
        )
        .unwrap();

        env::set_var("YDNOTE_EMAIL", "env@example.com");
        env::set_var("YDNOTE_LOCAL_DIR", env_dir.to_string_lossy().as_ref());
        env::set_var("YDNOTE_SERVER_URL", "https://env.example.com");

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email.as_deref(), Some("env@example.com"));
        assert_eq!(cfg.local_dir, env_dir);
        assert_eq!(cfg.server_url, "https://env.example.com");

        let overrides = ConfigOverrides {
            email: Some("flag@example.com".to_string()),
            local_dir: Some(flag_dir.clone()),
            server_url: Some("https://flag.example.com".to_string()),
            direction: None,
            upload_as_note: None,
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.email.as_deref(), Some("flag@example.com"));
        assert_eq!(cfg.local_dir, flag_dir);
        assert_eq!(cfg.server_url, "https://flag.example.com");
    }

    #[test]
    fn default_log_file_path_lives_under_home() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(&["HOME"]);

        let tmp = env::temp_dir().join("ydnote-sync-log-path-home");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        env::set_var("HOME", &tmp);

        let p = default_log_file_path();
        assert!(p.ends_with(".ydnote-sync/logs/sync.log"));
    }
}
