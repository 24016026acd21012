//! Optional auto-commit sink: after a sync pass, stage and commit the files
//! that changed to a local git repository, if one exists. Entirely best-effort
//! and never fatal to the sync pass itself.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Local;

use crate::orchestrator::SyncStats;

const ADD_BATCH_SIZE: usize = 50;
const COMMAND_TIMEOUT_SECS: u64 = 120;

pub struct GitCommitSink {
    repo_dir: PathBuf,
}

impl GitCommitSink {
    pub fn new(repo_dir: &Path) -> Self {
        Self { repo_dir: repo_dir.to_path_buf() }
    }

    pub fn is_git_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Stages `changed_paths` (in batches) plus any dedup-deletions, then
    /// commits with a message summarizing `stats`. Returns `true` on a real
    /// commit, `false` if skipped (not a repo, nothing changed, or `git`
    /// itself failed).
    pub fn commit_sync(&self, changed_paths: &[PathBuf], stats: &SyncStats) -> bool {
        if !self.is_git_repo() || changed_paths.is_empty() {
            return false;
        }

        for batch in changed_paths.chunks(ADD_BATCH_SIZE) {
            let existing: Vec<&str> = batch
                .iter()
                .filter(|p| p.exists())
                .filter_map(|p| p.to_str())
                .collect();
            if existing.is_empty() {
                continue;
            }
            let mut args = vec!["add", "--"];
            args.extend(existing);
            if let Err(err) = self.run(&args) {
                crate::logging::warn_kv("git add failed", &[("error", &err.to_string())]);
            }
        }

        if stats.dedup_deleted > 0 {
            if let Err(err) = self.run(&["add", "-u", "--", "."]) {
                crate::logging::warn_kv("git add -u failed", &[("error", &err.to_string())]);
            }
        }

        let message = commit_message(stats);
        match self.run(&["commit", "--no-verify", "-m", &message]) {
            Ok(out) if out.status.success() => {
                crate::logging::info(format!("git commit succeeded: {message}"));
                true
            }
            Ok(out) => {
                crate::logging::info_kv(
                    "git commit returned non-zero",
                    &[("stderr", &String::from_utf8_lossy(&out.stderr))],
                );
                false
            }
            Err(err) => {
                crate::logging::error(format!("git commit failed: {err}"));
                false
            }
        }
    }

    fn run(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output_with_timeout(COMMAND_TIMEOUT_SECS)
    }
}

fn commit_message(stats: &SyncStats) -> String {
    let now = Local::now().format("%Y-%m-%d %H:%M:%S");
    let mut parts = Vec::new();
    if stats.downloaded > 0 {
        parts.push(format!("downloaded {}", stats.downloaded));
    }
    if stats.uploaded > 0 {
        parts.push(format!("uploaded {}", stats.uploaded));
    }
    if stats.conflicts > 0 {
        parts.push(format!("conflicts {}", stats.conflicts));
    }
    if stats.dedup_deleted > 0 {
        parts.push(format!("deduped {}", stats.dedup_deleted));
    }
    let summary = if parts.is_empty() { "sync".to_string() } else { parts.join(", ") };
    format!("sync: {summary} ({now})")
}

/// `std::process::Command` has no built-in timeout; this crate's commands are
/// short local git invocations, so a simple spawn-and-wait is sufficient and
/// the timeout is enforced as a courtesy kill if git ever hangs on a prompt.
trait OutputWithTimeout {
    fn output_with_timeout(&mut self, secs: u64) -> std::io::Result<std::process::Output>;
}

impl OutputWithTimeout for Command {
    fn output_with_timeout(&mut self, secs: u64) -> std::io::Result<std::process::Output> {
        use std::process::Stdio;
        use std::time::{Duration, Instant};

        let mut child = self.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
        let deadline = Instant::now() + Duration::from_secs(secs);
        loop {
            if let Some(_status) = child.try_wait()? {
                return child.wait_with_output();
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                return child.wait_with_output();
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_summarizes_nonzero_counters() {
        let stats = SyncStats { downloaded: 2, uploaded: 1, conflicts: 0, dedup_deleted: 3, skipped: 0, errors: 0 };
        let msg = commit_message(&stats);
        assert!(msg.contains("downloaded 2"));
        assert!(msg.contains("uploaded 1"));
        assert!(msg.contains("deduped 3"));
        assert!(!msg.contains("conflicts"));
    }

    #[test]
    fn commit_message_falls_back_to_sync_when_all_zero() {
        let stats = SyncStats::default();
        let msg = commit_message(&stats);
        assert!(msg.starts_with("sync: sync ("));
    }

    #[test]
    fn non_git_directory_is_not_a_repo() {
        let dir = std::env::temp_dir().join("ydnote-sync-not-a-repo");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let sink = GitCommitSink::new(&dir);
        assert!(!sink.is_git_repo());
    }
}
