//! Scripted process runner for tests.
//!
//! No processes are spawned: results are popped from a script queue and
//! every call is recorded for inspection, via a controller handle shared
//! with the test.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    Captured, CommandSpec, OutputSink, PipelineOutcome, ProcessRunner, RunStatus, RunnerError,
};

/// What one scripted invocation produces. With an empty script the runner
/// answers every call with a clean exit and no output.
#[derive(Debug, Clone)]
pub struct ScriptedResult {
    pub status: RunStatus,
    pub stdout: String,
    pub stream_lines: Vec<String>,
    /// Simulate a spawn failure of this kind instead of running.
    pub spawn_error: Option<io::ErrorKind>,
    /// Paths (files or whole trees) removed when this result is served,
    /// emulating filesystem side effects the real tool would have.
    pub removes: Vec<std::path::PathBuf>,
}

impl ScriptedResult {
    pub fn ok() -> Self {
        Self {
            status: RunStatus::exit(0),
            stdout: String::new(),
            stream_lines: Vec::new(),
            spawn_error: None,
            removes: Vec::new(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            status: RunStatus::exit(code),
            ..Self::ok()
        }
    }

    /// The program does not exist on this system.
    pub fn not_found() -> Self {
        Self {
            spawn_error: Some(io::ErrorKind::NotFound),
            ..Self::ok()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stream_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stream_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn removing(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.removes.push(path.into());
        self
    }
}

/// One recorded call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(CommandSpec),
    RunWithInput { spec: CommandSpec, input: Vec<u8> },
    Capture(CommandSpec),
    Pipeline { stages: Vec<CommandSpec>, sink: OutputSink },
    Streaming(CommandSpec),
}

impl Invocation {
    /// Program of the (first) command in this call.
    pub fn program(&self) -> &str {
        match self {
            Invocation::Run(spec)
            | Invocation::Capture(spec)
            | Invocation::Streaming(spec)
            | Invocation::RunWithInput { spec, .. } => &spec.program,
            Invocation::Pipeline { stages, .. } => {
                stages.first().map(|s| s.program.as_str()).unwrap_or("")
            }
        }
    }
}

#[derive(Default)]
struct State {
    script: VecDeque<ScriptedResult>,
    calls: Vec<Invocation>,
}

/// Controller handle: scripts results ahead of time and inspects the calls
/// the code under test made.
#[derive(Clone)]
pub struct SimulatedController {
    state: Arc<Mutex<State>>,
}

impl SimulatedController {
    pub fn push_result(&self, result: ScriptedResult) {
        self.state.lock().unwrap().script.push_back(result);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Programs invoked, in order, for quick sequence asserts.
    pub fn programs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.program().to_string())
            .collect()
    }
}

pub struct SimulatedRunner {
    state: Arc<Mutex<State>>,
}

impl SimulatedRunner {
    pub fn new() -> (Self, SimulatedController) {
        let state = Arc::new(Mutex::new(State::default()));
        (
            Self {
                state: state.clone(),
            },
            SimulatedController { state },
        )
    }

    fn next(&self, call: Invocation) -> ScriptedResult {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            state.script.pop_front().unwrap_or_else(ScriptedResult::ok)
        };
        for path in &result.removes {
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(path);
            } else {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }
}

fn spawn_check(program: &str, result: &ScriptedResult) -> Result<(), RunnerError> {
    match result.spawn_error {
        Some(kind) => Err(RunnerError::Spawn {
            program: program.to_string(),
            source: io::Error::from(kind),
        }),
        None => Ok(()),
    }
}

#[async_trait]
impl ProcessRunner for SimulatedRunner {
    async fn run(&self, cmd: CommandSpec) -> Result<RunStatus, RunnerError> {
        let program = cmd.program.clone();
        let result = self.next(Invocation::Run(cmd));
        spawn_check(&program, &result)?;
        Ok(result.status)
    }

    async fn run_with_input(
        &self,
        cmd: CommandSpec,
        input: &[u8],
    ) -> Result<RunStatus, RunnerError> {
        let program = cmd.program.clone();
        let result = self.next(Invocation::RunWithInput {
            spec: cmd,
            input: input.to_vec(),
        });
        spawn_check(&program, &result)?;
        Ok(result.status)
    }

    async fn capture(&self, cmd: CommandSpec) -> Result<Captured, RunnerError> {
        let program = cmd.program.clone();
        let result = self.next(Invocation::Capture(cmd));
        spawn_check(&program, &result)?;
        Ok(Captured {
            status: result.status,
            stdout: result.stdout,
        })
    }

    async fn pipeline(
        &self,
        stages: Vec<CommandSpec>,
        sink: OutputSink,
    ) -> Result<PipelineOutcome, RunnerError> {
        let terminal = stages.last().map(|s| s.program.clone()).unwrap_or_default();
        let result = self.next(Invocation::Pipeline {
            stages,
            sink: sink.clone(),
        });
        spawn_check(&terminal, &result)?;
        // Mimic the pipeline writing to its sink, even on failure: a real
        // failed pipeline leaves partial output behind.
        if let OutputSink::File(path) = &sink {
            std::fs::write(path, result.stdout.as_bytes()).map_err(|source| {
                RunnerError::OutputFile {
                    path: path.clone(),
                    source,
                }
            })?;
        }
        let failed_stage = (!result.status.success()).then_some(terminal);
        Ok(PipelineOutcome {
            status: result.status,
            failed_stage,
        })
    }

    async fn run_streaming(
        &self,
        cmd: CommandSpec,
        lines: mpsc::Sender<String>,
    ) -> Result<RunStatus, RunnerError> {
        let program = cmd.program.clone();
        let result = self.next(Invocation::Streaming(cmd));
        spawn_check(&program, &result)?;
        for line in &result.stream_lines {
            let _ = lines.send(line.clone()).await;
        }
        Ok(result.status)
    }
}
