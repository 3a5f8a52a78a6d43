//! Worker process lifecycle.
//!
//! One [`ProcessSupervisor`] owns at most one worker process at a time. The
//! worker's stdout and stdin are bound to a [`WorkerChannel`]; stderr lines
//! reach the bus's raw handlers with a `[stderr] ` prefix. A monitor task
//! reaps the process and records how it ended.
//!
//! State machine: `Idle -> Starting -> Running -> Stopping -> Stopped`, with
//! `Running -> Crashed` when the process dies on its own with a failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hive_core::db::unix_timestamp;
use hive_core::protocol::{ChannelSender, EventBus, WorkerChannel};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tree::{self, Signal};

/// Upper bound on waiting for a killed tree to disappear.
pub const KILL_CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often liveness is re-checked while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lifecycle state of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl WorkerState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    /// States in which a live process may exist.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to run.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Returned by a successful [`ProcessSupervisor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub owner: String,
    pub pid: u32,
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub owner: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: Option<i64>,
    pub rss_kb: Option<u64>,
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Worker {owner} is already {state}")]
    AlreadyRunning { owner: String, state: WorkerState },

    #[error("Worker {owner} is not running")]
    NotRunning { owner: String },

    #[error("Working directory does not exist: {}", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to signal worker: {reason}")]
    Signal { reason: String },
}

struct Inner {
    state: WorkerState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    started_at: Option<i64>,
    channel: Option<WorkerChannel>,
    sender: Option<ChannelSender>,
    exited: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

/// Supervisor for one worker slot, identified by its owner id.
pub struct ProcessSupervisor {
    owner: String,
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl ProcessSupervisor {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: std::sync::Arc::new(Mutex::new(Inner {
                state: WorkerState::Idle,
                pid: None,
                exit_code: None,
                started_at: None,
                channel: None,
                sender: None,
                exited: CancellationToken::new(),
                monitor: None,
            })),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        self.lock().state = state;
    }

    /// Spawn the worker and bind its stdio to a channel dispatching into `bus`.
    pub fn start(
        &self,
        config: SpawnConfig,
        bus: EventBus,
    ) -> Result<WorkerHandle, SupervisorError> {
        {
            let mut inner = self.lock();
            if inner.state.is_active() {
                return Err(SupervisorError::AlreadyRunning {
                    owner: self.owner.clone(),
                    state: inner.state,
                });
            }
            inner.state = WorkerState::Starting;
            inner.pid = None;
            inner.exit_code = None;
            inner.started_at = None;
        }

        match self.spawn(config, bus) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(owner = %self.owner, error = %e, "Worker failed to start");
                self.set_state(WorkerState::Idle);
                Err(e)
            }
        }
    }

    fn spawn(&self, config: SpawnConfig, bus: EventBus) -> Result<WorkerHandle, SupervisorError> {
        if !config.working_dir.is_dir() {
            return Err(SupervisorError::MissingDirectory {
                path: config.working_dir,
            });
        }

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .current_dir(&config.working_dir)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            owner = %self.owner,
            program = %config.program.display(),
            working_dir = %config.working_dir.display(),
            "Spawning worker"
        );

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "process exited before its pid was read".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::SpawnFailed {
            reason: "Failed to capture stdout".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let bus = bus.clone();
            let owner = self.owner.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    bus.dispatch_raw(&format!("[stderr] {line}"));
                }
                debug!(owner = %owner, "stderr reader finished");
            });
        }

        let channel = WorkerChannel::spawn(stdout, stdin, bus, &self.owner);
        let exited = CancellationToken::new();

        let mut inner = self.lock();
        inner.state = WorkerState::Running;
        inner.pid = Some(pid);
        inner.started_at = Some(unix_timestamp());
        inner.sender = Some(channel.sender());
        inner.channel = Some(channel);
        inner.exited = exited.clone();

        let shared = std::sync::Arc::clone(&self.inner);
        let owner = self.owner.clone();
        inner.monitor = Some(tokio::spawn(async move {
            let status = child.wait().await;
            let code = match &status {
                Ok(s) => s.code(),
                Err(e) => {
                    warn!(owner = %owner, error = %e, "Failed to wait for worker");
                    None
                }
            };

            {
                let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
                inner.exit_code = code;
                inner.state = match inner.state {
                    WorkerState::Running if code == Some(0) => WorkerState::Stopped,
                    WorkerState::Running => WorkerState::Crashed,
                    _ => WorkerState::Stopped,
                };
                info!(owner = %owner, pid, exit_code = ?code, state = %inner.state, "Worker exited");
            }
            exited.cancel();
        }));
        drop(inner);

        info!(owner = %self.owner, pid, "Worker running");
        Ok(WorkerHandle {
            owner: self.owner.clone(),
            pid,
        })
    }

    /// Frame and send a message to the running worker.
    pub async fn send(&self, msg_type: &str, payload: Value) -> Result<(), SupervisorError> {
        let sender = {
            let inner = self.lock();
            match (&inner.state, &inner.sender) {
                (WorkerState::Running, Some(sender)) => sender.clone(),
                _ => {
                    return Err(SupervisorError::NotRunning {
                        owner: self.owner.clone(),
                    });
                }
            }
        };

        sender
            .send(msg_type, payload)
            .await
            .map_err(|_| SupervisorError::NotRunning {
                owner: self.owner.clone(),
            })
    }

    /// Stop the worker and every process it spawned.
    ///
    /// SIGTERM goes to the whole tree and the process group, then after
    /// `grace` anything still alive gets SIGKILL. Running out of grace is not
    /// an error. A worker that already exited keeps its state, but whatever
    /// it left behind in its process group is torn down the same way.
    pub async fn terminate(&self, grace: Duration) -> Result<(), SupervisorError> {
        let (pid, exited) = {
            let mut inner = self.lock();
            let Some(pid) = inner.pid else {
                return Ok(());
            };
            let state = inner.state;
            match state {
                WorkerState::Running | WorkerState::Starting => {
                    inner.state = WorkerState::Stopping;
                    (pid, Some(inner.exited.clone()))
                }
                WorkerState::Stopped | WorkerState::Crashed => (pid, None),
                WorkerState::Idle | WorkerState::Stopping => return Ok(()),
            }
        };
        let Some(exited) = exited else {
            self.reap_leftovers(pid, grace).await;
            return Ok(());
        };

        let mut members = tree::process_tree(pid);
        info!(owner = %self.owner, pid, members = members.len(), "Terminating worker");

        for &member in &members {
            tree::signal(member, Signal::Term);
        }
        tree::signal_group(pid, Signal::Term);

        let deadline = Instant::now() + grace;
        let _ = tokio::time::timeout_at(deadline, exited.cancelled()).await;
        while Instant::now() < deadline && any_alive(&members) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if any_alive(&members) {
            // Rediscover: survivors may have spawned more children meanwhile.
            for &member in &members.clone() {
                if tree::is_alive(member) {
                    members.extend(tree::descendants(member));
                }
            }
            members.sort_unstable();
            members.dedup();

            warn!(owner = %self.owner, pid, members = members.len(), "Grace period expired, killing process tree");
            for &member in &members {
                if member == pid && exited.is_cancelled() {
                    // Reaped already; the pid may belong to someone else now.
                    continue;
                }
                tree::signal(member, Signal::Kill);
            }
            tree::signal_group(pid, Signal::Kill);
        }

        let converge = Instant::now() + KILL_CONVERGE_TIMEOUT;
        if tokio::time::timeout_at(converge, exited.cancelled())
            .await
            .is_err()
        {
            return Err(SupervisorError::Signal {
                reason: format!("worker {pid} did not exit after SIGKILL"),
            });
        }
        while Instant::now() < converge && any_alive(&members) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if any_alive(&members) {
            warn!(owner = %self.owner, pid, "Some descendants outlived the kill timeout");
        }

        let mut inner = self.lock();
        inner.state = WorkerState::Stopped;
        if let Some(channel) = inner.channel.take() {
            channel.stop();
        }
        inner.sender = None;
        drop(inner);

        info!(owner = %self.owner, pid, "Worker stopped");
        Ok(())
    }

    /// Signal whatever is left in the process group of a worker that exited.
    async fn reap_leftovers(&self, pgid: u32, grace: Duration) {
        let members = tree::group_members(pgid);
        if members.is_empty() {
            return;
        }
        info!(
            owner = %self.owner,
            pgid,
            members = members.len(),
            "Terminating processes left by exited worker"
        );

        for &member in &members {
            tree::signal(member, Signal::Term);
        }
        tree::signal_group(pgid, Signal::Term);

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !tree::group_members(pgid).is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let survivors = tree::group_members(pgid);
        if survivors.is_empty() {
            return;
        }
        warn!(
            owner = %self.owner,
            pgid,
            members = survivors.len(),
            "Grace period expired, killing leftover processes"
        );
        for &member in &survivors {
            tree::signal(member, Signal::Kill);
        }
        tree::signal_group(pgid, Signal::Kill);

        let converge = Instant::now() + KILL_CONVERGE_TIMEOUT;
        while Instant::now() < converge && !tree::group_members(pgid).is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if !tree::group_members(pgid).is_empty() {
            warn!(owner = %self.owner, pgid, "Leftover processes outlived the kill timeout");
        }
    }

    /// Wait until the current process (if any) has exited.
    pub async fn wait(&self) {
        let exited = {
            let inner = self.lock();
            if inner.pid.is_none() {
                return;
            }
            inner.exited.clone()
        };
        exited.cancelled().await;
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn status(&self) -> WorkerStatus {
        let inner = self.lock();
        let live_pid = inner.pid.filter(|_| inner.state.is_active());
        WorkerStatus {
            owner: self.owner.clone(),
            state: inner.state,
            pid: inner.pid,
            exit_code: inner.exit_code,
            started_at: inner.started_at,
            rss_kb: live_pid.and_then(tree::rss_kb),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Dropping the monitor drops the Child, and kill_on_drop reaps it.
        if let Some(monitor) = self.lock().monitor.take() {
            monitor.abort();
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ProcessSupervisor")
            .field("owner", &self.owner)
            .field("state", &inner.state)
            .field("pid", &inner.pid)
            .finish_non_exhaustive()
    }
}

fn any_alive(pids: &[u32]) -> bool {
    pids.iter().any(|&pid| tree::is_alive(pid))
}
