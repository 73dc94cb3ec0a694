//! Mount/unmount lifecycle for the encrypted backup volume.
//!
//! The lifecycle is Unmounted → Opening → Mounted → Closing → Unmounted,
//! driven by cryptsetup and mount/umount. State is verified against the
//! filesystem and the live mount table rather than remembered from earlier
//! calls, so an interrupted run cannot confuse a later one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::BackupConfig;
use crate::runner::{CommandSpec, ProcessRunner, RunnerError};

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("mount point {0} already exists, refusing to mount over it")]
    MountPointExists(PathBuf),
    #[error("encrypted volume {0} could not be opened")]
    VolumeUnavailable(PathBuf),
    #[error("{0} is not mounted")]
    NotMounted(PathBuf),
    #[error("could not create mount point {path}: {source}")]
    CreateMountPoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not remove mount point {path}: {source}")]
    RemoveMountPoint {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mounting {device} at {mount_point} failed")]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
    },
    #[error("unmounting {0} failed")]
    UnmountFailed(PathBuf),
    #[error("closing encrypted volume mapping {0} failed")]
    CloseFailed(String),
    #[error("could not read mount table: {0}")]
    MountTable(std::io::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Where the live mount table is read from. Injectable so tests can point
/// it at a fixture file instead of /proc/mounts.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn system() -> Self {
        Self {
            path: PathBuf::from("/proc/mounts"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// True when `mount_point` appears as a mount target in the table.
    pub fn contains(&self, mount_point: &Path) -> std::io::Result<bool> {
        let table = std::fs::read_to_string(&self.path)?;
        let needle = escape_mount_path(mount_point);
        Ok(table
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(needle.as_str())))
    }
}

/// The kernel writes whitespace and backslashes in mount entries as octal
/// escapes; our path must be escaped the same way before comparing.
fn escape_mount_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\134")
        .replace(' ', "\\040")
        .replace('\t', "\\011")
        .replace('\n', "\\012")
}

/// Handle for the one encrypted volume a run operates on.
pub struct EncryptedVolume {
    device: PathBuf,
    mapper_name: String,
    mount_point: PathBuf,
    runner: Arc<dyn ProcessRunner>,
    mount_table: MountTable,
}

impl EncryptedVolume {
    pub fn new(config: &BackupConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_mount_table(config, runner, MountTable::system())
    }

    pub fn with_mount_table(
        config: &BackupConfig,
        runner: Arc<dyn ProcessRunner>,
        mount_table: MountTable,
    ) -> Self {
        Self {
            device: config.settings.luks_device.clone(),
            mapper_name: config.settings.mapper_name.clone(),
            mount_point: config.settings.mount_point.clone(),
            runner,
            mount_table,
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn mapper_device(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.mapper_name)
    }

    pub fn is_mounted(&self) -> Result<bool, VolumeError> {
        self.mount_table
            .contains(&self.mount_point)
            .map_err(VolumeError::MountTable)
    }

    /// Open the encrypted volume and mount it.
    ///
    /// An existing mount point path aborts before anything is touched. If
    /// the open step fails nothing was created; if a later step fails the
    /// mount point directory is removed and the mapping closed again, so a
    /// failed mount leaves no residue.
    pub async fn mount(&self) -> Result<(), VolumeError> {
        if self.mount_point.exists() {
            return Err(VolumeError::MountPointExists(self.mount_point.clone()));
        }

        info!(device = %self.device.display(), "Opening encrypted volume");
        let open = CommandSpec::new("cryptsetup")
            .arg("luksOpen")
            .arg(&self.device)
            .arg(&self.mapper_name);
        if !self.runner.run(open).await?.success() {
            return Err(VolumeError::VolumeUnavailable(self.device.clone()));
        }

        if let Err(source) = std::fs::create_dir(&self.mount_point) {
            self.close_mapping_best_effort().await;
            return Err(VolumeError::CreateMountPoint {
                path: self.mount_point.clone(),
                source,
            });
        }

        let mount = CommandSpec::new("mount")
            .arg(self.mapper_device())
            .arg(&self.mount_point);
        if !self.runner.run(mount).await?.success() {
            if let Err(e) = std::fs::remove_dir(&self.mount_point) {
                warn!(path = %self.mount_point.display(), error = %e, "Could not remove mount point after failed mount");
            }
            self.close_mapping_best_effort().await;
            return Err(VolumeError::MountFailed {
                device: self.mapper_device(),
                mount_point: self.mount_point.clone(),
            });
        }

        info!(mount_point = %self.mount_point.display(), "Encrypted volume mounted");
        Ok(())
    }

    /// Unmount the volume, remove the mount point directory, and close the
    /// mapping, in that order. Verified against the live mount table first:
    /// a volume this process never actually mounted is reported, untouched.
    /// Later steps still run when an earlier one fails; the first failure
    /// is the one reported.
    pub async fn unmount(&self) -> Result<(), VolumeError> {
        if !self.is_mounted()? {
            return Err(VolumeError::NotMounted(self.mount_point.clone()));
        }

        let mut first_error: Option<VolumeError> = None;

        let umount = CommandSpec::new("umount").arg(&self.mount_point);
        if !self.runner.run(umount).await?.success() {
            warn!(mount_point = %self.mount_point.display(), "umount failed");
            first_error.get_or_insert(VolumeError::UnmountFailed(self.mount_point.clone()));
        }

        if let Err(source) = std::fs::remove_dir(&self.mount_point) {
            warn!(path = %self.mount_point.display(), error = %source, "Could not remove mount point");
            first_error.get_or_insert(VolumeError::RemoveMountPoint {
                path: self.mount_point.clone(),
                source,
            });
        }

        let close = CommandSpec::new("cryptsetup")
            .arg("luksClose")
            .arg(self.mapper_device());
        if !self.runner.run(close).await?.success() {
            warn!(mapper = %self.mapper_name, "luksClose failed");
            first_error.get_or_insert(VolumeError::CloseFailed(self.mapper_name.clone()));
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(mount_point = %self.mount_point.display(), "Encrypted volume unmounted");
                Ok(())
            }
        }
    }

    async fn close_mapping_best_effort(&self) {
        let close = CommandSpec::new("cryptsetup")
            .arg("luksClose")
            .arg(self.mapper_device());
        match self.runner.run(close).await {
            Ok(status) if status.success() => {}
            _ => warn!(mapper = %self.mapper_name, "Could not close mapping while unwinding"),
        }
    }
}
