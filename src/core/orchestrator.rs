//! Run-mode sequencing, failure unwinding, and cancellation.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::context::AppContext;
use crate::core::archive::{ArchiveArtifact, ArchiveBuilder, BuildOutcome};
use crate::core::mirror::MirrorStage;
use crate::core::passphrase::Passphrase;
use crate::core::prompt;
use crate::core::transfer::{TransferError, TransferStage};
use crate::core::volume::{EncryptedVolume, MountTable};

/// Which stages one invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    MountOnly,
    UnmountOnly,
    LocalBackup,
    RemoteBackup,
    MirrorOnly,
    Decrypt {
        input: PathBuf,
        output_dir: Option<PathBuf>,
    },
    FullDefault,
}

impl RunMode {
    /// External executables the mode sequences, probed before anything runs.
    pub fn required_tools(&self) -> &'static [&'static str] {
        match self {
            RunMode::MountOnly | RunMode::UnmountOnly => &["cryptsetup"],
            RunMode::LocalBackup => &["cryptsetup", "tar", "gzip", "pv", "du", "rsync"],
            RunMode::RemoteBackup => &["tar", "gzip", "pv", "du", "gpg", "scp"],
            RunMode::MirrorOnly => &["cryptsetup", "rsync"],
            RunMode::Decrypt { .. } => &["gpg"],
            RunMode::FullDefault => &[
                "cryptsetup",
                "tar",
                "gzip",
                "pv",
                "du",
                "gpg",
                "scp",
                "rsync",
            ],
        }
    }

    /// Decrypt is the only mode that runs without elevated privilege.
    pub fn requires_root(&self) -> bool {
        !matches!(self, RunMode::Decrypt { .. })
    }

    /// Modes that own the staging area or the volume take the run lock.
    pub fn takes_run_lock(&self) -> bool {
        !matches!(self, RunMode::Decrypt { .. })
    }
}

/// The run was cancelled from outside (interrupt signal).
#[derive(Debug, thiserror::Error)]
#[error("interrupted; backup run aborted")]
pub struct Interrupted;

#[derive(Debug, thiserror::Error)]
pub enum RunLockError {
    #[error("another backup run appears to be active (lock file {0} exists)")]
    AlreadyRunning(PathBuf),
    #[error("could not create lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Inter-process guard against two orchestrators contending for the same
/// volume or staging area. Holds a pid-stamped lock file for the lifetime
/// of the guard.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(tmp_path: &Path) -> Result<Self, RunLockError> {
        let path = tmp_path.join("luksbak.lock");
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RunLockError::AlreadyRunning(path))
            }
            Err(source) => Err(RunLockError::Io { path, source }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not remove run lock");
        }
    }
}

/// Sequences the pipeline stages for one run and owns the unwind logic:
/// unmount whenever mount succeeded, and never leave a staged artifact
/// behind except after a failed local copy.
pub struct Orchestrator {
    ctx: AppContext,
    volume: EncryptedVolume,
    archives: ArchiveBuilder,
    transfer: TransferStage,
    mirror: MirrorStage,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self::with_mount_table(ctx, MountTable::system())
    }

    pub fn with_mount_table(ctx: AppContext, mount_table: MountTable) -> Self {
        let volume = EncryptedVolume::with_mount_table(&ctx.config, ctx.runner.clone(), mount_table);
        let archives = ArchiveBuilder::new(ctx.config.clone(), ctx.runner.clone());
        let transfer = TransferStage::new(
            ctx.config.clone(),
            ctx.runner.clone(),
            ctx.prompter.clone(),
        );
        let mirror = MirrorStage::new(
            ctx.config.clone(),
            ctx.runner.clone(),
            ctx.prompter.clone(),
        );
        Self {
            ctx,
            volume,
            archives,
            transfer,
            mirror,
        }
    }

    pub async fn run(&self, mode: RunMode) -> anyhow::Result<()> {
        info!(?mode, "Starting run");
        match mode {
            RunMode::MountOnly => Ok(self.volume.mount().await?),
            RunMode::UnmountOnly => Ok(self.volume.unmount().await?),
            RunMode::Decrypt { input, output_dir } => {
                self.transfer.decrypt(&input, output_dir.as_deref()).await?;
                Ok(())
            }
            RunMode::RemoteBackup => {
                self.ctx.config.remote()?;
                self.archive_rounds(false, true).await?;
                Ok(())
            }
            RunMode::LocalBackup => self.mounted_run(true, false).await,
            RunMode::MirrorOnly => self.mounted_run(false, false).await,
            RunMode::FullDefault => {
                let remote = self.ctx.config.settings.remote.is_some();
                if !remote {
                    info!("No remote endpoint configured; skipping the remote transfer leg");
                }
                self.mounted_run(true, remote).await
            }
        }
    }

    /// Mount, run the volume-bound stages, and always attempt the unmount
    /// afterwards, whether the stages succeeded or not. When both a stage
    /// and the unmount fail, the stage failure is the one reported.
    async fn mounted_run(&self, archives: bool, remote: bool) -> anyhow::Result<()> {
        self.volume.mount().await?;
        let staged = self.mounted_stages(archives, remote).await;
        let unmounted = self.volume.unmount().await;
        match (staged, unmounted) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unmount_err)) => {
                error!(error = %unmount_err, "Unmount after a failed run also failed");
                Err(e)
            }
        }
    }

    async fn mounted_stages(&self, archives: bool, remote: bool) -> anyhow::Result<()> {
        let mut proceed = true;
        if archives {
            proceed = self.archive_rounds(true, remote).await?;
        }
        if proceed {
            self.checkpoint()?;
            self.mirror.sync().await?;
        }
        Ok(())
    }

    /// Build, transfer, and delete each configured archive kind in turn, so
    /// at most one staged artifact is alive at any point. Returns false
    /// when a still-staged artifact from an earlier run stopped the
    /// pipeline early.
    async fn archive_rounds(&self, local: bool, remote: bool) -> anyhow::Result<bool> {
        let mut passphrase: Option<Passphrase> = None;
        for kind in self.archives.configured_kinds() {
            self.checkpoint()?;
            let artifact = match self.archives.build(kind).await? {
                BuildOutcome::Created(artifact) => artifact,
                BuildOutcome::Skipped(path) => {
                    info!(
                        artifact = %path.display(),
                        "Artifact from an earlier run is still staged; stopping here"
                    );
                    return Ok(false);
                }
            };

            match self
                .transfer_round(&artifact, local, remote, &mut passphrase)
                .await
            {
                Ok(()) => self.remove_artifact(&artifact).await,
                Err(err) => {
                    let keep = matches!(
                        err.downcast_ref::<TransferError>(),
                        Some(TransferError::LocalCopyFailed { .. })
                    );
                    if keep {
                        warn!(
                            artifact = %artifact.path.display(),
                            "Artifact kept on disk after failed local copy"
                        );
                    } else {
                        self.remove_artifact(&artifact).await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    async fn transfer_round(
        &self,
        artifact: &ArchiveArtifact,
        local: bool,
        remote: bool,
        passphrase: &mut Option<Passphrase>,
    ) -> anyhow::Result<()> {
        if local {
            self.checkpoint()?;
            self.transfer.copy_local(artifact).await?;
        }
        if remote {
            self.checkpoint()?;
            // One passphrase per run, acquired only once an artifact
            // actually needs shipping.
            if passphrase.is_none() {
                *passphrase = Some(prompt::encryption_passphrase(self.ctx.prompter.as_ref())?);
            }
            if let Some(secret) = passphrase.as_ref() {
                let remote_settings = self.ctx.config.remote()?;
                self.transfer
                    .transfer_remote(artifact, secret, remote_settings)
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_artifact(&self, artifact: &ArchiveArtifact) {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => info!(artifact = %artifact.path.display(), "Staged artifact removed"),
            Err(e) => {
                warn!(artifact = %artifact.path.display(), error = %e, "Could not remove staged artifact")
            }
        }
    }

    /// Cancellation boundary between stages: once the token fires the run
    /// unwinds here instead of starting the next stage.
    fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.ctx.cancel.is_cancelled() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_runs_unprivileged_and_unlocked() {
        let mode = RunMode::Decrypt {
            input: PathBuf::from("x.tar.gz.gpg"),
            output_dir: None,
        };
        assert!(!mode.requires_root());
        assert!(!mode.takes_run_lock());
        assert_eq!(mode.required_tools(), &["gpg"]);
    }

    #[test]
    fn volume_modes_require_root() {
        assert!(RunMode::MountOnly.requires_root());
        assert!(RunMode::LocalBackup.requires_root());
        assert!(RunMode::FullDefault.requires_root());
    }

    #[test]
    fn remote_mode_needs_no_volume_tools() {
        assert!(!RunMode::RemoteBackup.required_tools().contains(&"cryptsetup"));
        assert!(RunMode::RemoteBackup.required_tools().contains(&"scp"));
    }

    #[test]
    fn run_lock_is_exclusive_and_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();

        let lock = RunLock::acquire(tmp.path()).unwrap();
        assert!(matches!(
            RunLock::acquire(tmp.path()),
            Err(RunLockError::AlreadyRunning(_))
        ));

        drop(lock);
        assert!(RunLock::acquire(tmp.path()).is_ok());
    }

    #[test]
    fn run_lock_records_the_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let _lock = RunLock::acquire(tmp.path()).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("luksbak.lock")).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
