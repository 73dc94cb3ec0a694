use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Captured, CommandSpec, OutputSink, PipelineOutcome, ProcessRunner, RunStatus, RunnerError,
};

/// Runs commands as real OS processes. stderr is always inherited so
/// interactive tools (cryptsetup passphrase prompt, pv's meter) reach the
/// terminal.
pub struct SystemRunner;

impl SystemRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<RunStatus, RunnerError> {
        debug!(command = %spec, "Running command");
        let status = Self::command(&spec)
            .status()
            .await
            .map_err(|e| RunnerError::spawn(&spec.program, e))?;
        Ok(status.into())
    }

    async fn run_with_input(
        &self,
        spec: CommandSpec,
        input: &[u8],
    ) -> Result<RunStatus, RunnerError> {
        debug!(command = %spec, "Running command with piped stdin");
        let mut child = Self::command(&spec)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::spawn(&spec.program, e))?;

        let mut stdin = child.stdin.take().ok_or_else(|| RunnerError::Stdio {
            program: spec.program.clone(),
        })?;
        stdin
            .write_all(input)
            .await
            .map_err(|e| RunnerError::wait(&spec.program, e))?;
        // Closing stdin signals end of input to the child.
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::wait(&spec.program, e))?;
        Ok(status.into())
    }

    async fn capture(&self, spec: CommandSpec) -> Result<Captured, RunnerError> {
        debug!(command = %spec, "Running command, capturing stdout");
        let output = Self::command(&spec)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| RunnerError::spawn(&spec.program, e))?;
        Ok(Captured {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }

    async fn pipeline(
        &self,
        stages: Vec<CommandSpec>,
        sink: OutputSink,
    ) -> Result<PipelineOutcome, RunnerError> {
        let last = stages.len().saturating_sub(1);
        let mut children = Vec::with_capacity(stages.len());
        let mut upstream: Option<Stdio> = None;

        for (i, spec) in stages.iter().enumerate() {
            let mut cmd = Self::command(spec);
            match upstream.take() {
                Some(stdin) => {
                    cmd.stdin(stdin);
                }
                None => {
                    cmd.stdin(Stdio::inherit());
                }
            }
            if i == last {
                match &sink {
                    OutputSink::Inherit => {
                        cmd.stdout(Stdio::inherit());
                    }
                    OutputSink::File(path) => {
                        let file = std::fs::File::create(path).map_err(|source| {
                            RunnerError::OutputFile {
                                path: path.clone(),
                                source,
                            }
                        })?;
                        cmd.stdout(Stdio::from(file));
                    }
                }
            } else {
                cmd.stdout(Stdio::piped());
            }

            let mut child = cmd
                .spawn()
                .map_err(|e| RunnerError::spawn(&spec.program, e))?;
            if i != last {
                let stdout = child.stdout.take().ok_or_else(|| RunnerError::Stdio {
                    program: spec.program.clone(),
                })?;
                let stdio: Stdio = stdout
                    .try_into()
                    .map_err(|e| RunnerError::wait(&spec.program, e))?;
                upstream = Some(stdio);
            }
            children.push((spec.program.clone(), child));
        }

        let mut outcome = PipelineOutcome {
            status: RunStatus::exit(0),
            failed_stage: None,
        };
        // Every stage is waited on; the original shell pipelines only ever
        // surfaced the terminal stage's status.
        for (program, mut child) in children {
            let status: RunStatus = child
                .wait()
                .await
                .map_err(|e| RunnerError::wait(&program, e))?
                .into();
            if !status.success() && outcome.failed_stage.is_none() {
                warn!(stage = %program, code = ?status.code(), "Pipeline stage failed");
                outcome.status = status;
                outcome.failed_stage = Some(program);
            }
        }
        Ok(outcome)
    }

    async fn run_streaming(
        &self,
        spec: CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<RunStatus, RunnerError> {
        debug!(command = %spec, "Running command, streaming stdout");
        let mut child = Self::command(&spec)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| RunnerError::spawn(&spec.program, e))?;

        let stdout = child.stdout.take().ok_or_else(|| RunnerError::Stdio {
            program: spec.program.clone(),
        })?;
        let mut reader = BufReader::new(stdout);

        // Progress output repaints with carriage returns, so a line ends at
        // either CR or LF.
        let mut line_buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader
                .read(&mut byte)
                .await
                .map_err(|e| RunnerError::wait(&spec.program, e))?;
            if n == 0 {
                break;
            }
            let b = byte[0];
            if b == b'\r' || b == b'\n' {
                if line_buffer.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&line_buffer).into_owned();
                let _ = lines.send(line).await;
                line_buffer.clear();
            } else {
                line_buffer.push(b);
            }
        }
        if !line_buffer.is_empty() {
            let _ = lines
                .send(String::from_utf8_lossy(&line_buffer).into_owned())
                .await;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::wait(&spec.program, e))?;
        Ok(status.into())
    }
}
