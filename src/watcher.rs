//! Background daemon: runs an initial sync pass, then reacts to local
//! filesystem events (debounced) and a periodic cloud poll timer, never
//! letting two passes overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};

use crate::orchestrator::Orchestrator;

const DEFAULT_DEBOUNCE_TICK: Duration = Duration::from_secs(1);

pub struct AutoSync {
    orchestrator: Arc<Mutex<Orchestrator>>,
    debounce: Duration,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl AutoSync {
    pub fn new(orchestrator: Orchestrator, debounce_seconds: u64, poll_interval_seconds: u64) -> Self {
        Self {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            debounce: Duration::from_secs(debounce_seconds.max(1)),
            poll_interval: Duration::from_secs(poll_interval_seconds.max(1)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs until `shutdown` resolves. Always performs one full pass on
    /// startup before entering the event loop.
    pub async fn run(&self, local_dir: &std::path::Path, shutdown: Arc<tokio::sync::Notify>) -> Result<()> {
        self.run_pass_if_idle().await;

        let (tx, mut local_events) = mpsc::unbounded_channel::<()>();
        let mut fs_watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                if event.paths.iter().any(|p| is_relevant_path(p)) {
                    let _ = tx.send(());
                }
            },
            notify::Config::default(),
        )
        .context("create filesystem watcher")?;
        fs_watcher
            .watch(local_dir, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", local_dir.display()))?;

        let mut debounce_tick = tokio::time::interval(DEFAULT_DEBOUNCE_TICK);
        let mut poll_tick = tokio::time::interval(self.poll_interval);
        poll_tick.tick().await; // consume the immediate first tick

        let mut pending_since: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    crate::logging::info("watcher received shutdown signal");
                    return Ok(());
                }
                _ = local_events.recv() => {
                    pending_since = Some(tokio::time::Instant::now());
                }
                _ = debounce_tick.tick() => {
                    if let Some(since) = pending_since {
                        if since.elapsed() >= self.debounce {
                            pending_since = None;
                            self.run_pass_if_idle().await;
                        }
                    }
                }
                _ = poll_tick.tick() => {
                    self.run_pass_if_idle().await;
                }
            }
        }
    }

    /// Single-flight guard: if a pass is already running, this tick is
    /// dropped rather than queued.
    async fn run_pass_if_idle(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            crate::logging::info("skipping sync pass: previous pass still running");
            return;
        }
        let mut orchestrator = self.orchestrator.lock().await;
        match orchestrator.sync_once().await {
            Ok(stats) => crate::logging::info_kv(
                "sync pass complete",
                &[
                    ("downloaded", &stats.downloaded.to_string()),
                    ("uploaded", &stats.uploaded.to_string()),
                    ("conflicts", &stats.conflicts.to_string()),
                    ("errors", &stats.errors.to_string()),
                ],
            ),
            Err(err) => crate::logging::error_kv("sync pass failed", &[("error", &err.to_string())]),
        }
        drop(orchestrator);
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Matches the scanner's own filter: non-directory, `.md`, never under a
/// `.git/` directory or a `.conflict.` backup.
fn is_relevant_path(path: &std::path::Path) -> bool {
    if path.is_dir() {
        return false;
    }
    let s = path.to_string_lossy();
    s.to_ascii_lowercase().ends_with(".md") && !s.contains(".git/") && !s.contains(".conflict.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_relevant_path_accepts_plain_markdown() {
        let dir = std::env::temp_dir().join("ydnote-sync-watcher-relevant");
        std::fs::create_dir_all(&dir).unwrap();
        let p = dir.join("notes.md");
        std::fs::write(&p, b"hi").unwrap();
        assert!(is_relevant_path(&p));
    }

    #[test]
    fn is_relevant_path_rejects_conflict_backups_and_non_markdown() {
        assert!(!is_relevant_path(std::path::Path::new("/tmp/a.conflict.20260101_000000.md")));
        assert!(!is_relevant_path(std::path::Path::new("/tmp/repo/.git/index")));
        assert!(!is_relevant_path(std::path::Path::new("/tmp/notes.txt")));
    }
}
