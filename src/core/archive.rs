//! Archive construction: deterministic naming, size probing, and the
//! streaming `tar | pv | gzip` pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::config::BackupConfig;
use crate::core::ownership::{self, FileOwner};
use crate::runner::{CommandSpec, OutputSink, ProcessRunner, RunnerError};

/// Which directory list an archive covers: the user directories, or the
/// system configuration directories (archived separately so the latter can
/// be restored without dragging a home directory along).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Full,
    RootCfg,
}

impl ArchiveKind {
    fn label(self) -> &'static str {
        match self {
            ArchiveKind::Full => "full",
            ArchiveKind::RootCfg => "rootcfg",
        }
    }
}

/// A finished archive staged for transfer.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub expected_bytes: u64,
    pub owner: Option<FileOwner>,
}

#[derive(Debug)]
pub enum BuildOutcome {
    Created(ArchiveArtifact),
    /// An artifact with the deterministic name already exists, most likely
    /// from an earlier interrupted run. Nothing was probed or rebuilt.
    Skipped(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("size probe failed: du exited with {code:?}")]
    SizeProbeFailed { code: Option<i32> },
    #[error("size probe output not understood: {0:?}")]
    SizeProbeOutput(String),
    #[error("archive creation failed in {stage}")]
    CreationFailed { stage: String },
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

pub struct ArchiveBuilder {
    config: Arc<BackupConfig>,
    runner: Arc<dyn ProcessRunner>,
}

impl ArchiveBuilder {
    pub fn new(config: Arc<BackupConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    /// Kinds that have directories configured, in build order.
    pub fn configured_kinds(&self) -> Vec<ArchiveKind> {
        let mut kinds = Vec::new();
        if !self.config.dirs.directories.is_empty() {
            kinds.push(ArchiveKind::Full);
        }
        if !self.config.dirs.root_directories.is_empty() {
            kinds.push(ArchiveKind::RootCfg);
        }
        kinds
    }

    /// Deterministic staging path for `kind` on the current calendar date.
    /// A retried run lands on the same name and can skip the rebuild.
    pub fn target_path(&self, kind: ArchiveKind) -> PathBuf {
        let today = chrono::Local::now().date_naive();
        self.config
            .settings
            .tmp_path
            .join(archive_file_name(&self.config.settings.computer, kind, today))
    }

    /// Build the archive for `kind`, streaming `tar | pv | gzip` into the
    /// deterministic target path. An existing target short-circuits to
    /// `Skipped` before any probing happens.
    pub async fn build(&self, kind: ArchiveKind) -> Result<BuildOutcome, ArchiveError> {
        let target = self.target_path(kind);
        if target.exists() {
            info!(artifact = %target.display(), "Archive already staged, skipping build");
            return Ok(BuildOutcome::Skipped(target));
        }

        let sources = match kind {
            ArchiveKind::Full => &self.config.dirs.directories,
            ArchiveKind::RootCfg => &self.config.dirs.root_directories,
        };
        let excluded = &self.config.dirs.directories_excl;

        let expected_bytes = self.probe_size(sources, excluded).await?;
        info!(
            kind = kind.label(),
            bytes = expected_bytes,
            artifact = %target.display(),
            "Building archive"
        );

        let root = archive_root(&target);
        let stages = vec![
            tar_command(sources, excluded, &root),
            CommandSpec::new("pv").arg("-s").arg(expected_bytes.to_string()),
            CommandSpec::new("gzip"),
        ];
        let outcome = self
            .runner
            .pipeline(stages, OutputSink::File(target.clone()))
            .await?;
        if !outcome.success() {
            // Never leave a partial artifact at the deterministic name: a
            // retry would mistake it for a finished archive.
            if let Err(e) = std::fs::remove_file(&target) {
                warn!(artifact = %target.display(), error = %e, "Could not remove partial archive");
            }
            return Err(ArchiveError::CreationFailed {
                stage: outcome.failed_stage.unwrap_or_else(|| "pipeline".into()),
            });
        }

        let owner = ownership::resolve_owner(&self.config.settings.user);
        if let Some(owner) = &owner {
            if let Err(e) = ownership::chown_artifact(&target, owner) {
                warn!(artifact = %target.display(), user = %owner.user, error = %e, "Could not hand artifact over");
            }
        }

        info!(artifact = %target.display(), "Archive created");
        Ok(BuildOutcome::Created(ArchiveArtifact {
            path: target,
            expected_bytes,
            owner,
        }))
    }

    /// Total bytes of the included paths minus the excluded ones, two
    /// independent `du -sbc` measurements. Drives the pv meter, so an
    /// inaccurate figure only distorts the progress display.
    async fn probe_size(
        &self,
        sources: &[PathBuf],
        excluded: &[PathBuf],
    ) -> Result<u64, ArchiveError> {
        let included = self.du_total(sources).await?;
        let excluded_bytes = if excluded.is_empty() {
            0
        } else {
            self.du_total(excluded).await?
        };
        Ok(included.saturating_sub(excluded_bytes))
    }

    async fn du_total(&self, paths: &[PathBuf]) -> Result<u64, ArchiveError> {
        let cmd = CommandSpec::new("du").arg("-sbc").args(paths.iter().cloned());
        let captured = self.runner.capture(cmd).await?;
        if !captured.status.success() {
            return Err(ArchiveError::SizeProbeFailed {
                code: captured.status.code(),
            });
        }
        parse_du_total(&captured.stdout)
            .ok_or_else(|| ArchiveError::SizeProbeOutput(captured.stdout.clone()))
    }
}

/// The archive's contents are rooted under a directory named after the
/// archive itself (file name minus `.tar.gz`), so extraction stays
/// self-contained.
fn archive_root(target: &std::path::Path) -> String {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".tar.gz").unwrap_or(&name).to_string()
}

/// Last non-empty line of `du -sbc` output is `<bytes>\ttotal`.
fn parse_du_total(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn archive_file_name(computer: &str, kind: ArchiveKind, date: NaiveDate) -> String {
    format!("{computer}-{}-{}.tar.gz", kind.label(), date.format("%Y%b%d"))
}

fn tar_command(sources: &[PathBuf], excluded: &[PathBuf], root: &str) -> CommandSpec {
    let mut cmd = CommandSpec::new("tar").arg("-cf").arg("-");
    for path in excluded {
        cmd = cmd.arg(format!("--exclude={}", path.display()));
    }
    cmd = cmd.arg("--transform").arg(format!("s,^,{root}/,"));
    cmd.args(sources.iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn archive_name_is_deterministic_per_day() {
        let date = NaiveDate::from_ymd_opt(2012, 7, 3).unwrap();
        assert_eq!(
            archive_file_name("workstation", ArchiveKind::Full, date),
            "workstation-full-2012Jul03.tar.gz"
        );
        assert_eq!(
            archive_file_name("workstation", ArchiveKind::RootCfg, date),
            "workstation-rootcfg-2012Jul03.tar.gz"
        );
    }

    #[test]
    fn archive_root_strips_the_compound_extension() {
        assert_eq!(
            archive_root(Path::new("/tmp/host-full-2012Jul03.tar.gz")),
            "host-full-2012Jul03"
        );
    }

    #[test]
    fn parses_du_totals() {
        let stdout = "1024\t/home/user\n2048\t/etc\n3072\ttotal\n";
        assert_eq!(parse_du_total(stdout), Some(3072));
        assert_eq!(parse_du_total(""), None);
        assert_eq!(parse_du_total("garbage output"), None);
    }

    #[test]
    fn tar_command_excludes_then_transforms_then_lists_sources() {
        let cmd = tar_command(
            &[PathBuf::from("/home/user")],
            &[PathBuf::from("/home/user/.cache")],
            "host-full-2012Jul03",
        );
        assert_eq!(cmd.program, "tar");
        let args: Vec<String> = cmd
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-cf",
                "-",
                "--exclude=/home/user/.cache",
                "--transform",
                "s,^,host-full-2012Jul03/,",
                "/home/user",
            ]
        );
    }
}
