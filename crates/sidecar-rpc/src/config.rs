//! Sidecar configuration.
//!
//! Built either in code:
//!
//! ```no_run
//! # use sidecar_rpc::{ProgressRouting, SidecarConfig};
//! let config = SidecarConfig::new("/opt/app/bin/transcriber")
//!     .with_args(["--quiet"])
//!     .with_progress_routing(ProgressRouting::PerRequest);
//! ```
//!
//! or from the environment:
//!
//! | Variable                    | Meaning                                   |
//! |-----------------------------|-------------------------------------------|
//! | `SIDECAR_WORKER`            | worker executable (required)              |
//! | `SIDECAR_PROGRESS_ROUTING`  | `per-request` (default) or `latest`       |
//! | `SIDECAR_STDERR`            | `inherit` (default), `trace` or `null`    |
//! | `SIDECAR_SHUTDOWN_GRACE_MS` | SIGTERM-to-kill grace, default 5000       |

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, SpawnError};
use crate::progress::ProgressRouting;
use crate::supervisor::{CommandSpawner, StderrMode, WorkerSpawner, resolve_worker_path};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const WORKER_VAR: &str = "SIDECAR_WORKER";
pub const PROGRESS_ROUTING_VAR: &str = "SIDECAR_PROGRESS_ROUTING";
pub const STDERR_VAR: &str = "SIDECAR_STDERR";
pub const SHUTDOWN_GRACE_VAR: &str = "SIDECAR_SHUTDOWN_GRACE_MS";

#[derive(Clone)]
pub struct SidecarConfig {
    command: CommandSpawner,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    progress_routing: ProgressRouting,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for SidecarConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarConfig")
            .field("command", &self.command)
            .field("custom_spawner", &self.spawner.is_some())
            .field("progress_routing", &self.progress_routing)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl SidecarConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            command: CommandSpawner::new(program),
            spawner: None,
            progress_routing: ProgressRouting::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Configure the worker found under an installation directory.
    ///
    /// See [`resolve_worker_path`] for the search order.
    pub fn locate(install_dir: impl AsRef<Path>, base_name: &str) -> Result<Self, SpawnError> {
        let program = resolve_worker_path(install_dir.as_ref(), base_name)?;
        Ok(Self::new(program))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let program = lookup(WORKER_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(WORKER_VAR))?;
        let mut config = Self::new(program);

        if let Some(value) = lookup(PROGRESS_ROUTING_VAR) {
            config.progress_routing = value.parse().map_err(|reason| ConfigError::Invalid {
                var: PROGRESS_ROUTING_VAR,
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup(STDERR_VAR) {
            config.command.stderr = value.parse().map_err(|reason| ConfigError::Invalid {
                var: STDERR_VAR,
                value: value.clone(),
                reason,
            })?;
        }

        if let Some(value) = lookup(SHUTDOWN_GRACE_VAR) {
            let millis: u64 = value.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    var: SHUTDOWN_GRACE_VAR,
                    value: value.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.shutdown_grace = Duration::from_millis(millis);
        }

        Ok(config)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.command.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.command.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.command.current_dir = Some(dir.into());
        self
    }

    pub fn with_stderr(mut self, mode: StderrMode) -> Self {
        self.command.stderr = mode;
        self
    }

    pub fn with_progress_routing(mut self, routing: ProgressRouting) -> Self {
        self.progress_routing = routing;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Replace the default command spawner. Program, args, env, working
    /// directory and stderr settings are then ignored.
    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn program(&self) -> &Path {
        &self.command.program
    }

    pub fn progress_routing(&self) -> ProgressRouting {
        self.progress_routing
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn stderr(&self) -> StderrMode {
        self.command.stderr
    }

    pub(crate) fn spawner(&self) -> Arc<dyn WorkerSpawner> {
        match &self.spawner {
            Some(spawner) => Arc::clone(spawner),
            None => Arc::new(self.command.clone()),
        }
    }
}
