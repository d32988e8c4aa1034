//! Process supervisor - owns the worker subprocess lifecycle.
//!
//! Flow:
//! 1. Spawn the worker with stdin/stdout piped
//! 2. Hand the pipes to the caller
//! 3. Watch the child on a background task, publishing [`ProcessState`]
//! 4. On terminate: SIGTERM (unix), then kill after the grace period

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::error::SpawnError;

/// Where the worker's stderr goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Share the host's stderr.
    #[default]
    Inherit,
    /// Capture and re-emit each line through tracing.
    Trace,
    Null,
}

impl StderrMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Trace => Stdio::piped(),
            Self::Null => Stdio::null(),
        }
    }
}

impl FromStr for StderrMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inherit" => Ok(Self::Inherit),
            "trace" | "log" => Ok(Self::Trace),
            "null" | "none" => Ok(Self::Null),
            other => Err(format!(
                "unknown stderr mode `{other}`, expected `inherit`, `trace` or `null`"
            )),
        }
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal (unix only).
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

/// Lifecycle as observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(WorkerExit),
    /// Waiting on the child failed; the process is considered gone.
    Failed(String),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Exit details, when the child exited normally or by signal.
    pub fn exit(&self) -> Option<WorkerExit> {
        match self {
            Self::Exited(exit) => Some(*exit),
            _ => None,
        }
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    /// Start the worker. stdin and stdout must be piped.
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns an executable with no shell in between.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
    pub current_dir: Option<PathBuf>,
    pub stderr: StderrMode,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stderr: StderrMode::default(),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr.stdio())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        Ok(command.spawn()?)
    }
}

/// Platform-specific executable name for `base_name`.
pub fn worker_file_name(base_name: &str) -> String {
    if cfg!(windows) && !base_name.ends_with(".exe") {
        format!("{base_name}.exe")
    } else {
        base_name.to_string()
    }
}

/// Find the worker executable under an installation directory.
///
/// Searches `install_dir`, then `install_dir/bin`, then
/// `install_dir/resources`.
pub fn resolve_worker_path(install_dir: &Path, base_name: &str) -> Result<PathBuf, SpawnError> {
    let name = worker_file_name(base_name);
    let searched: Vec<PathBuf> = [
        install_dir.to_path_buf(),
        install_dir.join("bin"),
        install_dir.join("resources"),
    ]
    .into_iter()
    .map(|dir| dir.join(&name))
    .collect();

    match searched.iter().find(|path| path.is_file()) {
        Some(found) => Ok(found.clone()),
        None => Err(SpawnError::NotFound { name, searched }),
    }
}

/// Pipes of a freshly started worker. The supervisor keeps the child itself.
pub struct WorkerPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub struct ProcessSupervisor {
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    terminate: CancellationToken,
}

impl ProcessSupervisor {
    /// Spawn the worker and start watching it.
    ///
    /// Spawn failures are returned as-is; there is no retry.
    pub fn start(
        spawner: &dyn WorkerSpawner,
        shutdown_grace: Duration,
    ) -> Result<(Arc<Self>, WorkerPipes), SpawnError> {
        let mut child = spawner.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, pid));
        }

        tracing::info!(pid = ?pid, "Worker spawned");

        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let terminate = CancellationToken::new();
        tokio::spawn(watch_child(
            child,
            state_tx,
            terminate.clone(),
            shutdown_grace,
        ));

        let supervisor = Arc::new(Self {
            pid,
            state: state_rx,
            terminate,
        });
        Ok((supervisor, WorkerPipes { stdin, stdout }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.borrow().clone()
    }

    /// Watch channel that changes once, when the worker goes away.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Wait until the worker is gone.
    pub async fn wait(&self) -> ProcessState {
        wait_stopped(self.subscribe()).await
    }

    /// Ask the worker to stop; does not wait.
    pub fn request_terminate(&self) {
        self.terminate.cancel();
    }

    /// Stop the worker (gracefully first) and wait for it to be gone.
    pub async fn terminate(&self) -> ProcessState {
        self.request_terminate();
        self.wait().await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate.cancel();
    }
}

/// Resolve once `state` leaves [`ProcessState::Running`].
pub(crate) async fn wait_stopped(mut state: watch::Receiver<ProcessState>) -> ProcessState {
    let stopped = match state.wait_for(|s| !s.is_running()).await {
        Ok(s) => s.clone(),
        // Watcher task gone without publishing; treat as failed.
        Err(_) => ProcessState::Failed("supervisor stopped".to_string()),
    };
    stopped
}

async fn watch_child(
    mut child: Child,
    state_tx: watch::Sender<ProcessState>,
    terminate: CancellationToken,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = terminate.cancelled() => stop_child(&mut child, grace).await,
    };

    let state = match status {
        Ok(status) => {
            let exit = WorkerExit::from(status);
            if exit.success() {
                tracing::info!(%exit, "Worker exited");
            } else {
                tracing::warn!(%exit, "Worker exited");
            }
            ProcessState::Exited(exit)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to wait for worker");
            ProcessState::Failed(e.to_string())
        }
    };
    let _ = state_tx.send(state);
}

async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if send_sigterm(child) {
        tracing::debug!(grace_ms = grace.as_millis() as u64, "Sent SIGTERM to worker");
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::warn!("Worker ignored SIGTERM, killing");
    }

    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to send SIGTERM");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// Longest stderr line re-emitted as-is; the rest of a longer line is dropped.
const STDERR_MAX_LINE: usize = 64 * 1024;

/// Newline framing for worker stderr that never fails on content.
///
/// Invalid UTF-8 is replaced rather than rejected. The stderr pipe must keep
/// draining for as long as the worker lives, or its next write gets SIGPIPE.
struct StderrLines {
    max: usize,
    next_index: usize,
    discarding: bool,
}

impl StderrLines {
    fn new(max: usize) -> Self {
        Self {
            max,
            next_index: 0,
            discarding: false,
        }
    }
}

fn truncated(head: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(head).into_owned();
    line.push('…');
    line
}

impl Decoder for StderrLines {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if self.discarding {
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max {
                    let head = src.split_to(self.max);
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(truncated(&head)));
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(end + 1);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if end > self.max {
                return Ok(Some(truncated(&line[..self.max])));
            }
            return Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        let rest = src.split();
        self.next_index = 0;
        if std::mem::take(&mut self.discarding) || rest.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = FramedRead::new(stderr, StderrLines::new(STDERR_MAX_LINE));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!(target: "sidecar_rpc::stderr", pid = ?pid, "{}", line);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Worker stderr read failed");
                break;
            }
        }
    }
}
