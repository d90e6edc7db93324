//! In-process sandbox runtime for tests.
//!
//! [`ScriptedRuntime`] behaves like a container runtime without running
//! anything: each unit exits (or hangs) as its [`Behavior`] says and logs the
//! configured frames. Every call is counted so tests can assert on cleanup.

use crate::config::ExecutionPolicy;
use crate::demux::encode_frame;
use crate::sandbox::{RuntimeError, SandboxRuntime};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How every unit created by a [`ScriptedRuntime`] behaves.
#[derive(Debug, Clone)]
pub struct Behavior {
    exit_code: Option<i64>,
    run_for: Duration,
    output: Vec<u8>,
    echo_code: bool,
    image_present: bool,
    create_error: Option<String>,
    start_error: Option<String>,
    wait_error: Option<String>,
    kill_error: Option<String>,
    kill_stalls: bool,
    logs_error: Option<String>,
    remove_error: Option<String>,
}

impl Behavior {
    /// Units exit immediately with `code`.
    pub fn exit(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            run_for: Duration::ZERO,
            output: Vec::new(),
            echo_code: false,
            image_present: true,
            create_error: None,
            start_error: None,
            wait_error: None,
            kill_error: None,
            kill_stalls: false,
            logs_error: None,
            remove_error: None,
        }
    }

    /// Units never exit on their own.
    pub fn hang() -> Self {
        Self {
            exit_code: None,
            ..Self::exit(0)
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.output.extend(encode_frame(1, text.as_bytes()));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.output.extend(encode_frame(2, text.as_bytes()));
        self
    }

    /// Log the submitted code back on stdout instead of the scripted frames.
    pub fn echo_code(mut self) -> Self {
        self.echo_code = true;
        self
    }

    /// Delay before the unit exits.
    pub fn run_for(mut self, duration: Duration) -> Self {
        self.run_for = duration;
        self
    }

    pub fn missing_image(mut self) -> Self {
        self.image_present = false;
        self
    }

    pub fn fail_create(mut self, message: &str) -> Self {
        self.create_error = Some(message.to_string());
        self
    }

    pub fn fail_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn fail_wait(mut self, message: &str) -> Self {
        self.wait_error = Some(message.to_string());
        self
    }

    pub fn fail_kill(mut self, message: &str) -> Self {
        self.kill_error = Some(message.to_string());
        self
    }

    /// Kill requests are accepted but never answered.
    pub fn stall_kill(mut self) -> Self {
        self.kill_stalls = true;
        self
    }

    pub fn fail_logs(mut self, message: &str) -> Self {
        self.logs_error = Some(message.to_string());
        self
    }

    pub fn fail_remove(mut self, message: &str) -> Self {
        self.remove_error = Some(message.to_string());
        self
    }
}

/// Snapshot of how often each runtime operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub create: usize,
    pub start: usize,
    pub wait: usize,
    pub kill: usize,
    pub logs: usize,
    pub remove: usize,
    pub image: usize,
}

#[derive(Default)]
struct Counters {
    create: AtomicUsize,
    start: AtomicUsize,
    wait: AtomicUsize,
    kill: AtomicUsize,
    logs: AtomicUsize,
    remove: AtomicUsize,
    image: AtomicUsize,
}

/// A [`SandboxRuntime`] that follows a script.
pub struct ScriptedRuntime {
    behavior: Behavior,
    counters: Counters,
    units: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            counters: Counters::default(),
            units: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn calls(&self) -> Calls {
        let c = &self.counters;
        Calls {
            create: c.create.load(Ordering::SeqCst),
            start: c.start.load(Ordering::SeqCst),
            wait: c.wait.load(Ordering::SeqCst),
            kill: c.kill.load(Ordering::SeqCst),
            logs: c.logs.load(Ordering::SeqCst),
            remove: c.remove.load(Ordering::SeqCst),
            image: c.image.load(Ordering::SeqCst),
        }
    }

    /// Identifiers of units created and not yet removed.
    pub fn live_units(&self) -> Vec<String> {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.keys().cloned().collect()
    }

    fn argv_of(&self, id: &str) -> Result<Vec<String>, RuntimeError> {
        let units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.get(id).cloned().ok_or_else(|| RuntimeError::Api {
            status: 404,
            message: format!("No such container: {id}"),
        })
    }
}

fn scripted_failure(message: &Option<String>) -> Result<(), RuntimeError> {
    match message {
        Some(m) => Err(RuntimeError::Other(m.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn create(&self, policy: &ExecutionPolicy, code: &str) -> Result<String, RuntimeError> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);
        scripted_failure(&self.behavior.create_error)?;
        let id = format!("unit-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.insert(id.clone(), policy.argv(code));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.counters.start.fetch_add(1, Ordering::SeqCst);
        self.argv_of(id)?;
        scripted_failure(&self.behavior.start_error)
    }

    async fn wait(&self, id: &str) -> Result<i64, RuntimeError> {
        self.counters.wait.fetch_add(1, Ordering::SeqCst);
        self.argv_of(id)?;
        scripted_failure(&self.behavior.wait_error)?;
        if !self.behavior.run_for.is_zero() {
            tokio::time::sleep(self.behavior.run_for).await;
        }
        match self.behavior.exit_code {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.counters.kill.fetch_add(1, Ordering::SeqCst);
        self.argv_of(id)?;
        if self.behavior.kill_stalls {
            std::future::pending::<()>().await;
        }
        scripted_failure(&self.behavior.kill_error)
    }

    async fn logs(&self, id: &str) -> Result<Bytes, RuntimeError> {
        self.counters.logs.fetch_add(1, Ordering::SeqCst);
        let argv = self.argv_of(id)?;
        scripted_failure(&self.behavior.logs_error)?;
        if self.behavior.echo_code {
            let code = argv.last().cloned().unwrap_or_default();
            return Ok(Bytes::from(encode_frame(1, code.as_bytes())));
        }
        Ok(Bytes::from(self.behavior.output.clone()))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);
        scripted_failure(&self.behavior.remove_error)?;
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        units.remove(id);
        Ok(())
    }

    async fn image_available(&self, _image: &str) -> Result<bool, RuntimeError> {
        self.counters.image.fetch_add(1, Ordering::SeqCst);
        Ok(self.behavior.image_present)
    }
}
