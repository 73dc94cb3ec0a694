use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::BackupConfig;
use crate::core::prompt::Prompter;
use crate::runner::ProcessRunner;

/// Shared handles threaded through every component: the immutable run
/// configuration, the process-execution capability, the interactive
/// prompter, and the run-wide cancellation token.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<BackupConfig>,
    pub runner: Arc<dyn ProcessRunner>,
    pub prompter: Arc<dyn Prompter>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(
        config: BackupConfig,
        runner: Arc<dyn ProcessRunner>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            prompter,
            cancel: CancellationToken::new(),
        }
    }
}
