//! Sandboxed code execution service.
//!
//! Submissions are checked by [`validator`], run in a locked-down container
//! through a [`sandbox::SandboxRuntime`] (Docker in production), and their
//! multiplexed output is split by [`demux`]. [`executor::Executor`] ties the
//! steps together and [`http_server`] exposes it over HTTP.

pub mod config;
pub mod demux;
pub mod docker;
pub mod executor;
pub mod http_server;
pub mod rate_limit;
pub mod sandbox;
pub mod state;
pub mod testing;
pub mod validator;

pub use config::{ExecutionPolicy, ServiceConfig};
pub use executor::{ExecutionResult, Executor};
pub use sandbox::{RawExecutionOutcome, RuntimeError, SandboxRuntime};
pub use state::AppState;
