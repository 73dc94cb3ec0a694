//! External process execution.
//!
//! Everything the tool does to the outside world goes through external
//! programs — cryptsetup, tar, gzip, pv, gpg, scp, rsync, du. This module
//! owns the capability to run them: structured argument lists (never a
//! shell), streaming pipelines, and captured output. A scripted
//! implementation stands in for the real one in tests.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

mod simulated;
mod system;

pub use simulated::{Invocation, ScriptedResult, SimulatedController, SimulatedRunner};
pub use system::SystemRunner;

/// A single external command: program plus structured arguments. Arguments
/// never pass through a shell, so no quoting or escaping applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Exit of a finished process. A non-zero exit is data the caller must
/// check, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    code: Option<i32>,
}

impl RunStatus {
    pub fn exit(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Terminated by a signal, so no exit code exists.
    pub fn signalled() -> Self {
        Self { code: None }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl From<std::process::ExitStatus> for RunStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Status plus everything the process wrote to stdout.
#[derive(Debug, Clone)]
pub struct Captured {
    pub status: RunStatus,
    pub stdout: String,
}

/// Where a pipeline's terminal stage writes its stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    Inherit,
    File(PathBuf),
}

/// Result of a pipeline run. `status` belongs to the first failing stage,
/// or to the terminal stage when every member exited cleanly.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub failed_stage: Option<String>,
}

impl PipelineOutcome {
    pub fn success(&self) -> bool {
        self.failed_stage.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not attach to {program} stdio")]
    Stdio { program: String },
    #[error("could not open {path} for pipeline output: {source}")]
    OutputFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    fn spawn(program: &str, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.to_string(),
            source,
        }
    }

    fn wait(program: &str, source: std::io::Error) -> Self {
        Self::Wait {
            program: program.to_string(),
            source,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command with inherited stdio and wait for it.
    async fn run(&self, cmd: CommandSpec) -> Result<RunStatus, RunnerError>;

    /// Run a command with `input` written to its stdin, which is then
    /// closed. Used to feed secrets over a pipe instead of argv.
    async fn run_with_input(&self, cmd: CommandSpec, input: &[u8])
    -> Result<RunStatus, RunnerError>;

    /// Run a command capturing its stdout.
    async fn capture(&self, cmd: CommandSpec) -> Result<Captured, RunnerError>;

    /// Run a chain of commands, stdout of each feeding stdin of the next,
    /// with the terminal stage's stdout directed at `sink`. All stages are
    /// waited on; any non-zero member fails the pipeline.
    async fn pipeline(
        &self,
        stages: Vec<CommandSpec>,
        sink: OutputSink,
    ) -> Result<PipelineOutcome, RunnerError>;

    /// Run a command, sending each stdout line (CR- or LF-terminated, so
    /// progress repaints arrive too) to `lines` as it is produced.
    async fn run_streaming(
        &self,
        cmd: CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<RunStatus, RunnerError>;
}

/// Fatal startup condition: required external tools are absent.
#[derive(Debug, thiserror::Error)]
#[error("required external tools not found: {}", missing.join(", "))]
pub struct DependencyMissing {
    pub missing: Vec<String>,
}

/// Probe each tool by spawning `<tool> --version`. Only a failed spawn with
/// NotFound counts as missing; a tool that runs and exits non-zero (scp has
/// no --version flag) is present.
pub async fn check_dependencies(
    runner: &dyn ProcessRunner,
    tools: &[&str],
) -> Result<(), DependencyMissing> {
    let mut missing = Vec::new();
    for tool in tools {
        let probe = CommandSpec::new(*tool).arg("--version");
        match runner.capture(probe).await {
            Ok(_) => {}
            Err(RunnerError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                missing.push((*tool).to_string());
            }
            Err(_) => {}
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(DependencyMissing { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spec_renders_for_logs() {
        let cmd = CommandSpec::new("tar").arg("-cf").arg("-").arg("/home/user");
        assert_eq!(cmd.to_string(), "tar -cf - /home/user");
    }

    #[test]
    fn run_status_success_only_for_zero() {
        assert!(RunStatus::exit(0).success());
        assert!(!RunStatus::exit(2).success());
        assert!(!RunStatus::signalled().success());
        assert_eq!(RunStatus::signalled().code(), None);
    }
}
