//! Docker Engine API client implementing [`SandboxRuntime`].
//!
//! Talks plain HTTP to the daemon (a TCP listener or a socket proxy in front
//! of `/var/run/docker.sock`). Containers are created without a TTY, so the
//! logs endpoint returns the multiplexed frame stream parsed by
//! [`crate::demux`].

use crate::config::ExecutionPolicy;
use crate::sandbox::{RuntimeError, SandboxRuntime};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Applied to every call except `wait`, which lasts as long as the program.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerRequest<'a> {
    image: &'a str,
    cmd: Vec<String>,
    user: &'a str,
    working_dir: &'a str,
    attach_stdin: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    open_stdin: bool,
    tty: bool,
    network_disabled: bool,
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    memory: u64,
    memory_swap: u64,
    nano_cpus: i64,
    pids_limit: i64,
    network_mode: &'static str,
    readonly_rootfs: bool,
    tmpfs: HashMap<String, String>,
    cap_drop: Vec<&'static str>,
    security_opt: Vec<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

fn create_request<'a>(policy: &'a ExecutionPolicy, code: &str) -> CreateContainerRequest<'a> {
    let mut tmpfs = HashMap::new();
    tmpfs.insert(policy.scratch_path.clone(), policy.scratch_mount_options());

    CreateContainerRequest {
        image: &policy.image,
        cmd: policy.argv(code),
        user: &policy.user,
        working_dir: &policy.scratch_path,
        attach_stdin: false,
        attach_stdout: true,
        attach_stderr: true,
        open_stdin: false,
        tty: false,
        network_disabled: true,
        host_config: HostConfig {
            memory: policy.memory_limit_bytes,
            // Equal to `memory`: no swap on top of the memory ceiling.
            memory_swap: policy.memory_limit_bytes,
            nano_cpus: policy.nano_cpus(),
            pids_limit: policy.pids_limit,
            network_mode: "none",
            readonly_rootfs: true,
            tmpfs,
            cap_drop: vec!["ALL"],
            security_opt: vec!["no-new-privileges"],
        },
    }
}

/// Turn a non-success response into [`RuntimeError::Api`].
async fn check(resp: Response) -> Result<Response, RuntimeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    Err(api_error(resp).await)
}

async fn api_error(resp: Response) -> RuntimeError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiMessage>(&body)
        .map(|m| m.message)
        .unwrap_or(body);
    RuntimeError::Api { status, message }
}

/// Docker daemon handle, built once at startup and shared by all requests.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Client,
    base_url: String,
}

impl DockerRuntime {
    /// `base_url` may carry an API version prefix, e.g. `http://docker:2375/v1.43`.
    pub fn new(base_url: &str) -> Result<Self, RuntimeError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, policy: &ExecutionPolicy, code: &str) -> Result<String, RuntimeError> {
        let name = format!("exec-{}", uuid::Uuid::new_v4());
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name.as_str())])
            .json(&create_request(policy, code))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let created: CreateContainerResponse = check(resp).await?.json().await?;
        debug!(name = %name, id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id}/start")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id}/wait")))
            .send()
            .await?;
        let waited: WaitResponse = check(resp).await?.json().await?;
        if let Some(err) = waited.error.filter(|e| !e.message.is_empty()) {
            return Err(RuntimeError::Other(err.message));
        }
        Ok(waited.status_code)
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{id}/kill")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        // 409: the container already stopped on its own.
        if resp.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check(resp).await?;
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Bytes, RuntimeError> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{id}/logs")))
            .query(&[("stdout", "true"), ("stderr", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(check(resp).await?.bytes().await?)
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{id}")))
            .query(&[("force", "true"), ("v", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            _ => check(resp).await.map(|_| ()),
        }
    }

    async fn image_available(&self, image: &str) -> Result<bool, RuntimeError> {
        let resp = self
            .client
            .get(self.url(&format!("/images/{image}/json")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            _ => check(resp).await.map(|_| true),
        }
    }
}
