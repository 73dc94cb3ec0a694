//! Moving a staged archive off the staging area: local copy onto the
//! mounted volume, encrypted remote shipment, and decrypt-on-demand.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{BackupConfig, RemoteSettings};
use crate::core::archive::ArchiveArtifact;
use crate::core::passphrase::Passphrase;
use crate::core::prompt::{self, Prompter};
use crate::runner::{CommandSpec, ProcessRunner, RunnerError};

/// Suffix gpg leaves on symmetrically encrypted files. Decrypt input must
/// carry it; the decrypted output has it stripped.
pub const ENCRYPTED_SUFFIX: &str = ".gpg";

/// Buffer size for the streaming local copy.
const COPY_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("backup directory {0} does not exist and its creation was not confirmed")]
    DestinationMissing(PathBuf),
    #[error("local copy to {dest} failed: {source}")]
    LocalCopyFailed {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("staging directory {0} does not exist")]
    StagingMissing(PathBuf),
    #[error("encrypting {0} failed")]
    EncryptFailed(PathBuf),
    #[error("remote copy of {file} to {host} failed")]
    RemoteCopyFailed { file: PathBuf, host: String },
    #[error("{0} does not look like an encrypted archive (expected the .gpg suffix)")]
    NotAnEncryptedArchive(PathBuf),
    #[error("output directory {0} does not exist or is not a directory")]
    BadOutputDir(PathBuf),
    #[error("decrypting {0} failed")]
    DecryptFailed(PathBuf),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub struct TransferStage {
    config: Arc<BackupConfig>,
    runner: Arc<dyn ProcessRunner>,
    prompter: Arc<dyn Prompter>,
}

impl TransferStage {
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

    /// Copy the artifact into the volume's backup directory under its
    /// original name. On failure the source artifact is left in place so a
    /// retry can inspect or reuse it.
    pub async fn copy_local(&self, artifact: &ArchiveArtifact) -> Result<PathBuf, TransferError> {
        let backup_dir = self.config.backup_dir();
        if !prompt::ensure_directory(self.prompter.as_ref(), &backup_dir, "Backup directory")? {
            return Err(TransferError::DestinationMissing(backup_dir));
        }

        let Some(name) = artifact.path.file_name() else {
            return Err(TransferError::LocalCopyFailed {
                dest: backup_dir,
                source: std::io::Error::other("artifact path has no file name"),
            });
        };
        let dest = backup_dir.join(name);

        info!(
            source = %artifact.path.display(),
            dest = %dest.display(),
            "Copying archive onto backup volume"
        );
        let source = artifact.path.clone();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || copy_file(&source, &target))
            .await
            .map_err(|e| TransferError::LocalCopyFailed {
                dest: dest.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| {
                warn!(dest = %dest.display(), "Local copy failed; keeping source artifact");
                TransferError::LocalCopyFailed {
                    dest: dest.clone(),
                    source,
                }
            })?;
        Ok(dest)
    }

    /// Encrypt the artifact and ship it to the remote host. The encrypted
    /// transport copy never outlives this call, whatever the outcome of the
    /// remote copy.
    pub async fn transfer_remote(
        &self,
        artifact: &ArchiveArtifact,
        passphrase: &Passphrase,
        remote: &RemoteSettings,
    ) -> Result<(), TransferError> {
        let staging = &self.config.settings.tmp_path;
        if !staging.is_dir() {
            return Err(TransferError::StagingMissing(staging.clone()));
        }

        let encrypted = encrypted_path(&artifact.path);
        info!(artifact = %artifact.path.display(), "Encrypting archive for transport");
        let gpg = CommandSpec::new("gpg")
            .arg("--batch")
            .arg("--yes")
            .arg("--pinentry-mode")
            .arg("loopback")
            .arg("--passphrase-fd")
            .arg("0")
            .arg("--symmetric")
            .arg("--output")
            .arg(&encrypted)
            .arg(&artifact.path);
        if !self
            .runner
            .run_with_input(gpg, passphrase.as_bytes())
            .await?
            .success()
        {
            // A failed gpg run can still leave a partial output file.
            remove_quietly(&encrypted).await;
            return Err(TransferError::EncryptFailed(artifact.path.clone()));
        }

        let destination = format!("{}:{}", remote.host, remote.path);
        info!(destination = %destination, "Copying encrypted archive to remote host");
        let scp = CommandSpec::new("scp").arg(&encrypted).arg(&destination);
        let copy = self.runner.run(scp).await;

        // The transport copy is deleted no matter how the remote copy went.
        remove_quietly(&encrypted).await;

        if !copy?.success() {
            return Err(TransferError::RemoteCopyFailed {
                file: artifact.path.clone(),
                host: remote.host.clone(),
            });
        }
        info!("Remote transfer complete");
        Ok(())
    }

    /// Decrypt a previously shipped archive into `output_dir` (default: the
    /// current directory). Input validation happens before any passphrase
    /// prompt so an obviously wrong file fails fast.
    pub async fn decrypt(
        &self,
        input: &Path,
        output_dir: Option<&Path>,
    ) -> Result<PathBuf, TransferError> {
        let file_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stripped = match file_name.strip_suffix(ENCRYPTED_SUFFIX) {
            Some(stripped) if !stripped.is_empty() => stripped.to_string(),
            _ => return Err(TransferError::NotAnEncryptedArchive(input.to_path_buf())),
        };

        let out_dir = output_dir.unwrap_or(Path::new("."));
        if output_dir.is_some() && !out_dir.is_dir() {
            return Err(TransferError::BadOutputDir(out_dir.to_path_buf()));
        }
        let output = out_dir.join(stripped);

        let passphrase = prompt::decryption_passphrase(self.prompter.as_ref())?;
        let gpg = CommandSpec::new("gpg")
            .arg("--batch")
            .arg("--yes")
            .arg("--pinentry-mode")
            .arg("loopback")
            .arg("--passphrase-fd")
            .arg("0")
            .arg("--decrypt")
            .arg("--output")
            .arg(&output)
            .arg(input);
        if !self
            .runner
            .run_with_input(gpg, passphrase.as_bytes())
            .await?
            .success()
        {
            remove_quietly(&output).await;
            return Err(TransferError::DecryptFailed(input.to_path_buf()));
        }

        info!(output = %output.display(), "Archive decrypted");
        Ok(output)
    }
}

fn encrypted_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

/// Streaming buffered copy with a final fsync, so the artifact is durable
/// on the volume before the staged original gets deleted.
fn copy_file(source: &Path, dest: &Path) -> std::io::Result<()> {
    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, File::open(source)?);
    let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, File::create(dest)?);

    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n])?;
    }
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove file");
        }
    }
}
