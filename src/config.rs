//! Execution policy and service configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Maximum accepted source length, in characters.
pub const MAX_CODE_CHARS: usize = 10_000;

/// Maximum accepted request body, in bytes.
pub const MAX_BODY_BYTES: usize = 10 * 1024;

/// Default requests allowed per client per minute.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 3;

const MIB: u64 = 1024 * 1024;
const NOBODY_ID: u32 = 65534;

/// Substrings rejected (case-insensitively) before any container is created.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "import os",
    "from os",
    "import subprocess",
    "from subprocess",
    "import sys",
    "from sys",
    "import socket",
    "from socket",
    "import shutil",
    "import requests",
    "import urllib",
    "from urllib",
    "import http",
    "import ctypes",
    "import multiprocessing",
    "import pty",
    "__import__",
    "importlib",
    "eval(",
    "exec(",
    "compile(",
    "open(",
    "input(",
    "breakpoint(",
    "globals(",
    "getattr(",
];

/// Resource and security limits applied to every execution.
///
/// Built once at startup and shared read-only between requests.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    /// Runtime image every execution unit is created from.
    pub image: String,
    /// Argv prefix; the submitted code is appended as the final argument.
    pub command: Vec<String>,
    /// `uid:gid` the program runs as.
    pub user: String,
    pub time_limit: Duration,
    /// Deadline for each runtime call made after the program stops
    /// (kill, log retrieval, removal).
    pub cleanup_grace: Duration,
    pub memory_limit_bytes: u64,
    /// Fractional CPU allocation, 1.0 == one core.
    pub cpu_quota: f64,
    pub pids_limit: i64,
    /// Writable scratch mount inside the unit.
    pub scratch_path: String,
    pub scratch_size_bytes: u64,
    pub denylist: Vec<String>,
    pub max_code_chars: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            image: "python:3.11-alpine".to_string(),
            command: vec!["python3".to_string(), "-c".to_string()],
            user: format!("{NOBODY_ID}:{NOBODY_ID}"),
            time_limit: Duration::from_secs(5),
            cleanup_grace: Duration::from_secs(5),
            memory_limit_bytes: 128 * MIB,
            cpu_quota: 0.5,
            pids_limit: 64,
            scratch_path: "/tmp".to_string(),
            scratch_size_bytes: 10 * 1000 * 1000,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            max_code_chars: MAX_CODE_CHARS,
        }
    }
}

impl ExecutionPolicy {
    /// Full argv for one execution: the command prefix followed by `code`.
    pub fn argv(&self, code: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(code.to_string());
        argv
    }

    /// CPU quota in the runtime's billionths-of-a-CPU unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_quota * 1_000_000_000.0).round() as i64
    }

    /// Mount options for the scratch tmpfs.
    pub fn scratch_mount_options(&self) -> String {
        format!("rw,noexec,nosuid,nodev,size={}", self.scratch_size_bytes)
    }
}

/// Configuration for the HTTP service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub addr: SocketAddr,
    /// Base URL of the Docker Engine API, e.g. `http://127.0.0.1:2375`.
    pub docker_url: String,
    pub rate_limit_per_minute: u32,
    /// Key rate limits on `X-Forwarded-For` instead of the peer address.
    /// Only safe behind a proxy that overwrites the header.
    pub trust_proxy: bool,
    pub policy: ExecutionPolicy,
}
