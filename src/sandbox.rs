//! Core sandbox execution logic.
//!
//! [`run`] drives one execution unit through its whole life: create, start,
//! wait against the time limit, collect logs, remove. The unit is removed on
//! every path, including when the calling future is dropped mid-flight.

use crate::config::ExecutionPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by a sandbox runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runtime returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("{0}")]
    Other(String),
}

/// Container runtime operations needed to run one program.
///
/// Implementations must apply every limit in the policy at creation time and
/// treat removal of an already-removed unit as success.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create a unit running `policy.argv(code)`; returns its identifier.
    async fn create(&self, policy: &ExecutionPolicy, code: &str) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Block until the unit exits and return its status code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Combined stdout/stderr in the multiplexed frame format.
    async fn logs(&self, id: &str) -> Result<Bytes, RuntimeError>;

    /// Forcibly remove the unit. Idempotent.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Whether `image` is present on the runtime host.
    async fn image_available(&self, image: &str) -> Result<bool, RuntimeError>;
}

/// What happened to a unit, before output is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RawExecutionOutcome {
    Completed { exit_code: i64, output: Bytes },
    /// Killed at the time limit; `output` holds whatever was logged before.
    TimedOut { output: Bytes },
    CreationFailed(String),
    /// The runtime failed after the unit was started.
    Faulted(String),
}

/// Owns a created unit and removes it exactly once.
struct UnitGuard {
    runtime: Arc<dyn SandboxRuntime>,
    id: String,
    grace: Duration,
    armed: bool,
}

impl UnitGuard {
    fn new(runtime: Arc<dyn SandboxRuntime>, id: String, grace: Duration) -> Self {
        Self {
            runtime,
            id,
            grace,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        remove_quietly(self.runtime.as_ref(), &self.id, self.grace).await;
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let runtime = self.runtime.clone();
        let id = std::mem::take(&mut self.id);
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(unit = %id, "execution abandoned, scheduling unit removal");
                handle.spawn(async move {
                    remove_quietly(runtime.as_ref(), &id, grace).await;
                });
            }
            Err(_) => warn!(unit = %id, "no async runtime left to remove unit"),
        }
    }
}

/// Bound a post-exit runtime call so a stalled daemon cannot hold the request.
async fn within<T>(
    grace: Duration,
    call: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    tokio::time::timeout(grace, call).await.unwrap_or_else(|_| {
        Err(RuntimeError::Other(format!(
            "runtime did not respond within {grace:?}"
        )))
    })
}

async fn remove_quietly(runtime: &dyn SandboxRuntime, id: &str, grace: Duration) {
    match within(grace, runtime.remove(id)).await {
        Ok(()) => debug!(unit = %id, "unit removed"),
        Err(e) => warn!(unit = %id, error = %e, "failed to remove unit"),
    }
}

/// Run `code` in a fresh unit under `policy`.
pub async fn run(
    runtime: &Arc<dyn SandboxRuntime>,
    policy: &ExecutionPolicy,
    code: &str,
) -> RawExecutionOutcome {
    let id = match runtime.create(policy, code).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to create unit");
            return RawExecutionOutcome::CreationFailed(e.to_string());
        }
    };
    info!(unit = %id, "unit created");

    let guard = UnitGuard::new(runtime.clone(), id, policy.cleanup_grace);
    let outcome = drive(runtime.as_ref(), &guard.id, policy).await;
    guard.release().await;
    outcome
}

async fn drive(
    runtime: &dyn SandboxRuntime,
    id: &str,
    policy: &ExecutionPolicy,
) -> RawExecutionOutcome {
    let limit = policy.time_limit;
    let grace = policy.cleanup_grace;
    if let Err(e) = runtime.start(id).await {
        warn!(unit = %id, error = %e, "failed to start unit");
        return RawExecutionOutcome::CreationFailed(e.to_string());
    }

    match tokio::time::timeout(limit, runtime.wait(id)).await {
        Ok(Ok(exit_code)) => {
            info!(unit = %id, exit_code, "unit exited");
            match within(grace, runtime.logs(id)).await {
                Ok(output) => RawExecutionOutcome::Completed { exit_code, output },
                Err(e) => RawExecutionOutcome::Faulted(e.to_string()),
            }
        }
        Ok(Err(e)) => {
            warn!(unit = %id, error = %e, "wait failed");
            RawExecutionOutcome::Faulted(e.to_string())
        }
        Err(_) => {
            warn!(unit = %id, ?limit, "time limit reached, killing unit");
            if let Err(e) = within(grace, runtime.kill(id)).await {
                warn!(unit = %id, error = %e, "failed to kill unit");
            }
            let output = within(grace, runtime.logs(id)).await.unwrap_or_else(|e| {
                debug!(unit = %id, error = %e, "no logs after timeout");
                Bytes::new()
            });
            RawExecutionOutcome::TimedOut { output }
        }
    }
}
