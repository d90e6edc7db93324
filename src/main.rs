//! exec-sandbox - run untrusted Python in locked-down containers over HTTP.
//!
//! Usage:
//!   exec-sandbox serve [--port 8080] [--docker-url URL]   # Start HTTP server
//!   exec-sandbox run [--file prog.py]                     # Execute once, code from file or stdin
//!
//! Logging: `RUST_LOG=exec_sandbox=debug` for per-unit lifecycle logs.

use anyhow::Context;
use clap::{Parser, Subcommand};
use exec_sandbox::config::DEFAULT_RATE_LIMIT_PER_MINUTE;
use exec_sandbox::docker::DockerRuntime;
use exec_sandbox::{http_server, AppState, ExecutionPolicy, Executor, ServiceConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "exec-sandbox")]
#[command(about = "Sandboxed code execution service with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(long, env = "EXEC_HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Execution requests allowed per client per minute
        #[arg(long, env = "EXEC_RATE_LIMIT", default_value_t = DEFAULT_RATE_LIMIT_PER_MINUTE)]
        rate_limit: u32,

        /// Rate-limit on the first X-Forwarded-For hop (only behind a proxy that sets it)
        #[arg(long, env = "EXEC_TRUST_PROXY")]
        trust_proxy: bool,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Execute one program and exit with its status code
    Run {
        /// Source file; reads stdin when omitted
        #[arg(long)]
        file: Option<PathBuf>,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[derive(clap::Args, Debug)]
struct RuntimeArgs {
    /// Docker Engine API endpoint
    #[arg(long, env = "DOCKER_URL", default_value = "http://127.0.0.1:2375")]
    docker_url: String,

    /// Runtime image for every execution
    #[arg(long, env = "EXEC_IMAGE", default_value = "python:3.11-alpine")]
    image: String,

    /// Wall-clock limit in milliseconds
    #[arg(long, default_value = "5000")]
    time: u64,

    /// Memory limit in MiB (swap disabled)
    #[arg(long, default_value = "128")]
    mem: u64,

    /// CPU quota in cores
    #[arg(long, default_value = "0.5")]
    cpus: f64,

    /// Maximum number of processes
    #[arg(long, default_value = "64")]
    pids: i64,
}

impl RuntimeArgs {
    fn policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            image: self.image.clone(),
            time_limit: Duration::from_millis(self.time),
            memory_limit_bytes: self.mem * 1024 * 1024,
            cpu_quota: self.cpus,
            pids_limit: self.pids,
            ..ExecutionPolicy::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("exec_sandbox=info,tower_http=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve {
            port,
            host,
            rate_limit,
            trust_proxy,
            runtime,
        } => {
            let config = ServiceConfig {
                addr: SocketAddr::new(host, port),
                docker_url: runtime.docker_url.clone(),
                rate_limit_per_minute: rate_limit,
                trust_proxy,
                policy: runtime.policy(),
            };
            let state = AppState::from_config(&config)?;
            http_server::run_server(config.addr, state).await
        }
        Commands::Run { file, runtime } => {
            let code = match file {
                Some(path) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut code = String::new();
                    tokio::io::stdin()
                        .read_to_string(&mut code)
                        .await
                        .context("failed to read stdin")?;
                    code
                }
            };

            let docker = DockerRuntime::new(&runtime.docker_url)?;
            let executor = Executor::new(Arc::new(docker), runtime.policy());
            let result = executor.execute(&code, None).await;

            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            exit(i32::try_from(result.exit_code).ok().filter(|c| *c >= 0).unwrap_or(1));
        }
    }
}
