use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser};
use luksbak::config::BackupConfig;
use luksbak::context::AppContext;
use luksbak::core::orchestrator::{Orchestrator, RunLock, RunMode};
use luksbak::core::prompt::TerminalPrompter;
use luksbak::logging::{self, LogConfig};
use luksbak::runner::{self, SystemRunner};
use nix::unistd::Uid;
use tracing::warn;

#[derive(Parser)]
#[command(name = "luksbak")]
#[command(about = "Automated encrypted-volume backups", long_about = None)]
#[command(group(
    ArgGroup::new("mode").args([
        "mount",
        "unmount",
        "backup",
        "remote_backup",
        "rsync_backup",
        "decrypt_remote_backup",
    ])
))]
struct Cli {
    /// Only mount the encrypted volume, then exit
    #[arg(long)]
    mount: bool,

    /// Only unmount the encrypted volume, then exit
    #[arg(long)]
    unmount: bool,

    /// Archive and copy onto the volume, no remote transfer
    #[arg(long)]
    backup: bool,

    /// Archive, encrypt, and ship to the remote host (volume untouched)
    #[arg(long)]
    remote_backup: bool,

    /// Only mirror the rsync directories onto the volume
    #[arg(long)]
    rsync_backup: bool,

    /// Decrypt a previously shipped archive
    #[arg(long, num_args = 1..=2, value_names = ["FILE", "OUTPUT_DIR"])]
    decrypt_remote_backup: Option<Vec<PathBuf>>,

    /// Configuration file
    #[arg(long, default_value = "backup.json")]
    config: PathBuf,

    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// With no mode flag, a full run: mount, back up, mirror, unmount.
    fn mode(&self) -> RunMode {
        if self.mount {
            RunMode::MountOnly
        } else if self.unmount {
            RunMode::UnmountOnly
        } else if self.backup {
            RunMode::LocalBackup
        } else if self.remote_backup {
            RunMode::RemoteBackup
        } else if self.rsync_backup {
            RunMode::MirrorOnly
        } else if let Some(args) = &self.decrypt_remote_backup {
            RunMode::Decrypt {
                input: args[0].clone(),
                output_dir: args.get(1).cloned(),
            }
        } else {
            RunMode::FullDefault
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogConfig {
        json: cli.log_json,
        verbose: cli.verbose,
    });

    let config = BackupConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let mode = cli.mode();

    if matches!(mode, RunMode::RemoteBackup) {
        config
            .remote()
            .context("Remote backup requested without a remote endpoint")?;
    }

    if mode.requires_root() && !Uid::effective().is_root() {
        bail!("This mode needs elevated privileges; re-run it with sudo");
    }

    let runner = Arc::new(SystemRunner);
    runner::check_dependencies(runner.as_ref(), mode.required_tools())
        .await
        .context("Startup dependency check failed")?;

    let _lock = if mode.takes_run_lock() {
        Some(RunLock::acquire(&config.settings.tmp_path)?)
    } else {
        None
    };

    let ctx = AppContext::new(config, runner, Arc::new(TerminalPrompter));

    // Single interrupt listener: the first Ctrl-C requests cancellation and
    // the orchestrator unwinds at its next stage boundary. The handler stays
    // installed, so a second Ctrl-C during cleanup has no effect.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cleaning up");
            cancel.cancel();
        }
    });

    Orchestrator::new(ctx).run(mode).await
}
