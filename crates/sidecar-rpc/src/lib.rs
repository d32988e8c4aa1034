//! sidecar-rpc: drive a long-running worker process over line-delimited JSON.
//!
//! The host spawns a worker, writes one JSON request per line to its stdin and
//! reads responses and notifications from its stdout. Many calls may be in
//! flight at once; responses are matched to callers by request id.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use sidecar_rpc::{Sidecar, SidecarConfig};
//!
//! let sidecar = Sidecar::spawn(SidecarConfig::new("/opt/app/bin/transcriber"))?;
//! let text = sidecar
//!     .call("transcribe", serde_json::json!({"path": "a.wav"}), None)
//!     .await?;
//! sidecar.shutdown().await;
//! # let _ = text;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod correlation;
pub mod error;
pub mod logging;
pub mod progress;
pub mod router;
pub mod sequencer;
pub mod sidecar;
pub mod supervisor;
pub mod worker;

pub use bridge::protocol::{
    LogLine, Notification, Outcome, Progress, Request, RequestId, Response, WorkerMessage,
};
pub use config::SidecarConfig;
pub use error::{
    CallError, ConfigError, DecodeError, SidecarError, SpawnError, Termination, WriteError,
};
pub use logging::init_tracing;
pub use progress::{ProgressHandler, ProgressRouting, progress_handler};
pub use sidecar::{PendingCall, Sidecar};
pub use supervisor::{
    CommandSpawner, ProcessState, StderrMode, WorkerExit, WorkerSpawner, resolve_worker_path,
};
pub use worker::{RequestContext, RequestHandler, serve, serve_stdio};
