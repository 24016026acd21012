use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use ydnote_sync::cloud_client::HttpCloudClient;
use ydnote_sync::commit_sink::GitCommitSink;
use ydnote_sync::config::{Config, ConfigOverrides};
use ydnote_sync::dedup::DedupEngine;
use ydnote_sync::orchestrator::{Orchestrator, SyncDirection};
use ydnote_sync::watcher::AutoSync;

#[derive(Parser, Debug)]
#[command(name = "ydnote-sync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Local sync directory override
    #[arg(long = "local-dir")]
    local_dir: Option<PathBuf>,

    /// Server URL override
    #[arg(long = "server")]
    server: Option<String>,

    /// Sync direction override: push, pull, or both
    #[arg(long = "direction")]
    direction: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single sync pass and exit
    Sync {
        /// Auto-commit changed files to git afterward, if the local dir is a repo
        #[arg(long = "commit", default_value_t = false)]
        commit: bool,
    },

    /// Run continuously: initial sync, then react to filesystem and cloud changes
    Watch,

    /// Scan metadata for duplicate content and reconcile it
    Dedup,

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let resolved_config = Config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("ydnote-sync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Sync { commit }) => {
            let cfg = load_config(&resolved_config, &cli)?;
            run_sync_once(cfg, commit).await
        }
        Some(Commands::Watch) => {
            let cfg = load_config(&resolved_config, &cli)?;
            run_watch(cfg).await
        }
        Some(Commands::Dedup) => {
            let cfg = load_config(&resolved_config, &cli)?;
            run_dedup(cfg).await
        }
        None => {
            let cfg = load_config(&resolved_config, &cli)?;
            run_sync_once(cfg, false).await
        }
    }
}

fn load_config(resolved_config: &PathBuf, cli: &Cli) -> Result<Config> {
    let overrides = ConfigOverrides {
        local_dir: cli.local_dir.clone(),
        email: cli.email.clone(),
        server_url: cli.server.clone(),
        direction: cli.direction.as_deref().map(parse_direction).transpose()?,
        upload_as_note: None,
    };
    Config::load_with_overrides(resolved_config, overrides)
}

fn parse_direction(raw: &str) -> Result<SyncDirection> {
    match raw.to_ascii_lowercase().as_str() {
        "push" => Ok(SyncDirection::Push),
        "pull" => Ok(SyncDirection::Pull),
        "both" => Ok(SyncDirection::Both),
        other => anyhow::bail!("invalid direction: {other} (expected push, pull, or both)"),
    }
}

async fn run_sync_once(cfg: Config, commit: bool) -> Result<()> {
    ydnote_sync::logging::init_default_log_file()?;
    let client = Arc::new(HttpCloudClient::new(&cfg.server_url, cfg.email.as_deref().unwrap_or(""))?);
    let local_dir = cfg.local_dir.clone();
    let mut orchestrator = Orchestrator::new(cfg, client)?;
    let stats = orchestrator.sync_once().await?;
    println!(
        "downloaded={} uploaded={} skipped={} conflicts={} errors={} dedup_deleted={}",
        stats.downloaded, stats.uploaded, stats.skipped, stats.conflicts, stats.errors, stats.dedup_deleted
    );
    if commit {
        let sink = GitCommitSink::new(&local_dir);
        sink.commit_sync(orchestrator.changed_paths(), &stats);
    }
    Ok(())
}

async fn run_watch(cfg: Config) -> Result<()> {
    ydnote_sync::logging::init_default_log_file()?;
    let local_dir = cfg.local_dir.clone();
    let debounce = cfg.debounce_seconds;
    let poll_interval = cfg.poll_interval_seconds;
    let client = Arc::new(HttpCloudClient::new(&cfg.server_url, cfg.email.as_deref().unwrap_or(""))?);
    let orchestrator = Orchestrator::new(cfg, client)?;
    let auto_sync = AutoSync::new(orchestrator, debounce, poll_interval);

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
    });

    auto_sync.run(&local_dir, shutdown).await
}

async fn run_dedup(cfg: Config) -> Result<()> {
    ydnote_sync::logging::init_default_log_file()?;
    let client = Arc::new(HttpCloudClient::new(&cfg.server_url, cfg.email.as_deref().unwrap_or(""))?);
    let local_dir = cfg.local_dir.clone();
    let orchestrator = Orchestrator::new(cfg, client.clone())?;
    let store = orchestrator.store();
    let engine = DedupEngine::new(store.clone(), client, local_dir);
    let referenced = DedupEngine::collect_referenced_paths(&engine.scan_markdown_bodies());
    let stats = engine.run(&referenced).await;
    store.save()?;
    println!(
        "groups_found={} deleted_local={} deleted_cloud={} referenced_skipped={} skipped={}",
        stats.groups_found, stats.deleted_local, stats.deleted_cloud, stats.referenced_skipped, stats.skipped
    );
    Ok(())
}
