//! One submission in, one [`ExecutionResult`] out.

use crate::config::ExecutionPolicy;
use crate::demux::demultiplex;
use crate::sandbox::{self, RawExecutionOutcome, SandboxRuntime};
use crate::validator::validate;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

/// Exit code reported when the program never produced one.
pub const NO_EXIT_CODE: i64 = -1;

/// Outcome of one execution as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    fn rejected(stdout: String, message: String, started: Instant) -> Self {
        Self {
            success: false,
            stdout,
            stderr: message,
            exit_code: NO_EXIT_CODE,
            execution_time_ms: elapsed_ms(started),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Runs submissions under a fixed policy on a shared runtime handle.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn SandboxRuntime>,
    policy: Arc<ExecutionPolicy>,
}

impl Executor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, policy: ExecutionPolicy) -> Self {
        Self {
            runtime,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    /// Validate and run `code`. Every failure is folded into the result.
    #[instrument(skip(self, code), fields(session_id = session_id.unwrap_or("-"), code_len = code.len()))]
    pub async fn execute(&self, code: &str, session_id: Option<&str>) -> ExecutionResult {
        let started = Instant::now();

        if let Err(reason) = validate(&self.policy, code) {
            info!(%reason, "submission rejected");
            return ExecutionResult::rejected(String::new(), reason.to_string(), started);
        }

        let result = match sandbox::run(&self.runtime, &self.policy, code).await {
            RawExecutionOutcome::Completed { exit_code, output } => {
                let out = demultiplex(&output);
                ExecutionResult {
                    success: exit_code == 0,
                    stdout: out.stdout,
                    stderr: out.stderr,
                    exit_code,
                    execution_time_ms: elapsed_ms(started),
                }
            }
            RawExecutionOutcome::TimedOut { output } => {
                let message = format!(
                    "Execution timed out after {:?}",
                    self.policy.time_limit
                );
                ExecutionResult::rejected(demultiplex(&output).stdout, message, started)
            }
            RawExecutionOutcome::CreationFailed(message) => {
                warn!(%message, "execution unit could not be started");
                ExecutionResult::rejected(
                    String::new(),
                    format!("Failed to start execution: {message}"),
                    started,
                )
            }
            RawExecutionOutcome::Faulted(message) => {
                warn!(%message, "execution failed inside the runtime");
                ExecutionResult::rejected(
                    String::new(),
                    format!("Execution failed: {message}"),
                    started,
                )
            }
        };

        info!(
            success = result.success,
            exit_code = result.exit_code,
            elapsed_ms = result.execution_time_ms,
            "execution finished"
        );
        result
    }
}
