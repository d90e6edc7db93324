//! Shared application state.

use crate::config::{ExecutionPolicy, ServiceConfig};
use crate::docker::DockerRuntime;
use crate::executor::Executor;
use crate::rate_limit::RateLimiter;
use crate::sandbox::{RuntimeError, SandboxRuntime};
use std::sync::Arc;

/// Handles shared by every request. Holds no per-request mutable state
/// besides the boundary's rate-limit windows.
#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub limiter: Arc<RateLimiter>,
    /// Whether `X-Forwarded-For` identifies the client.
    pub trust_proxy: bool,
}

impl AppState {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, policy: ExecutionPolicy, rate_limit: u32) -> Self {
        Self {
            executor: Executor::new(runtime, policy),
            limiter: Arc::new(RateLimiter::per_minute(rate_limit)),
            trust_proxy: false,
        }
    }

    pub fn with_trusted_proxy(mut self, trust_proxy: bool) -> Self {
        self.trust_proxy = trust_proxy;
        self
    }

    /// State backed by the Docker daemon named in `config`.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, RuntimeError> {
        let runtime = Arc::new(DockerRuntime::new(&config.docker_url)?);
        Ok(Self::new(
            runtime,
            config.policy.clone(),
            config.rate_limit_per_minute,
        )
        .with_trusted_proxy(config.trust_proxy))
    }
}
