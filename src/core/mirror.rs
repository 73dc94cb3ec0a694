//! Delete-aware directory mirroring onto the mounted volume.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::core::prompt::{self, Prompter};
use crate::logging::LogThrottle;
use crate::runner::{CommandSpec, ProcessRunner, RunnerError};

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror destination {0} does not exist and its creation was not confirmed")]
    DestinationMissing(PathBuf),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// How a full mirror pass went. Individual source failures never abort the
/// pass; they are counted here instead.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MirrorSummary {
    pub synced: usize,
    pub failed: usize,
}

pub struct MirrorStage {
    config: Arc<BackupConfig>,
    runner: Arc<dyn ProcessRunner>,
    prompter: Arc<dyn Prompter>,
}

impl MirrorStage {
    pub fn new(
        config: Arc<BackupConfig>,
        runner: Arc<dyn ProcessRunner>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            config,
            runner,
            prompter,
        }
    }

    /// Mirror every configured source into the volume's backup directory,
    /// best-effort: a failing source is logged and the rest still run.
    pub async fn sync(&self) -> Result<MirrorSummary, MirrorError> {
        let sources = &self.config.dirs.rsync_directories;
        if sources.is_empty() {
            debug!("No mirror directories configured");
            return Ok(MirrorSummary::default());
        }

        let dest = self.config.backup_dir();
        if !prompt::ensure_directory(self.prompter.as_ref(), &dest, "Mirror destination")? {
            return Err(MirrorError::DestinationMissing(dest));
        }

        let mut summary = MirrorSummary::default();
        for source in sources {
            let source = normalize_source(source);
            match self.sync_one(&source, &dest).await {
                Ok(true) => summary.synced += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "Mirror source failed");
                    summary.failed += 1;
                }
            }
        }
        info!(
            synced = summary.synced,
            failed = summary.failed,
            "Mirror pass finished"
        );
        Ok(summary)
    }

    async fn sync_one(&self, source: &Path, dest: &Path) -> Result<bool, MirrorError> {
        info!(source = %source.display(), "Mirroring directory");

        let (tx, mut rx) = mpsc::channel(32);
        // Matches progress2 repaints: "  12,345,678  45%  10.2MB/s ..."
        let progress = Regex::new(r"^\s*([\d,]+)\s+(\d+)%").unwrap();
        let throttle = LogThrottle::new(Duration::from_millis(500));

        let run = self.runner.run_streaming(rsync_command(source, dest), tx);
        let log_progress = async {
            while let Some(line) = rx.recv().await {
                if let Some(caps) = progress.captures(&line) {
                    if throttle.should_log() {
                        debug!(bytes = &caps[1], percent = &caps[2], "rsync progress");
                    }
                }
            }
        };
        let (status, ()) = tokio::join!(run, log_progress);

        let status = status?;
        if status.success() {
            Ok(true)
        } else {
            warn!(source = %source.display(), code = ?status.code(), "rsync exited non-zero");
            Ok(false)
        }
    }
}

/// rsync treats "dir/" and "dir" differently: with the slash only the
/// contents travel, and delete-mirroring then compares inside the
/// destination root instead of on the directory itself. The directory is
/// the unit here, so trailing separators are stripped.
fn normalize_source(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

fn rsync_command(source: &Path, dest: &Path) -> CommandSpec {
    CommandSpec::new("rsync")
        .arg("-az")
        .arg("--human-readable")
        .arg("--delete-before")
        .arg("--exclude=*.swp")
        .arg("--info=progress2")
        .arg("--no-inc-recursive")
        .arg(source)
        .arg(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_stripped() {
        assert_eq!(
            normalize_source(Path::new("/data/photos/")),
            PathBuf::from("/data/photos")
        );
        assert_eq!(
            normalize_source(Path::new("/data/photos")),
            PathBuf::from("/data/photos")
        );
        assert_eq!(normalize_source(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn slashed_and_unslashed_sources_build_identical_commands() {
        let dest = Path::new("/mnt/vault/backups");
        let with_slash = rsync_command(&normalize_source(Path::new("/data/photos/")), dest);
        let without = rsync_command(&normalize_source(Path::new("/data/photos")), dest);
        assert_eq!(with_slash, without);
    }

    #[test]
    fn rsync_command_mirrors_with_deletion_and_swap_exclusion() {
        let cmd = rsync_command(Path::new("/data/photos"), Path::new("/mnt/vault/backups"));
        let args: Vec<String> = cmd
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"--delete-before".to_string()));
        assert!(args.contains(&"--exclude=*.swp".to_string()));
        assert_eq!(args.last().unwrap(), "/mnt/vault/backups");
    }
}
