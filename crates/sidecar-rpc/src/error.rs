//! Error taxonomy for the sidecar bridge.
//!
//! - Transport: spawn or write failures ([`SpawnError`], [`WriteError`])
//! - Decode: unreadable worker output ([`DecodeError`]), logged and dropped
//! - Application: the worker answered with `error` ([`CallError::Application`])
//! - Orphaned: the worker went away with calls pending
//!   ([`CallError::WorkerTerminated`])

use std::path::PathBuf;

use crate::bridge::protocol::RequestId;
use crate::supervisor::WorkerExit;

/// Why the worker stopped serving requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exited (or was killed by a signal).
    Exited(WorkerExit),
    /// The worker's output reached EOF; exit status unknown.
    StreamClosed,
    /// Reading the worker's output failed.
    StreamError(String),
    /// The supervisor lost track of the process.
    Lost(String),
    /// The host shut the sidecar down.
    ShutDown,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(exit) => write!(f, "{exit}"),
            Self::StreamClosed => f.write_str("output stream closed"),
            Self::StreamError(e) => write!(f, "output stream failed: {e}"),
            Self::Lost(e) => write!(f, "process lost: {e}"),
            Self::ShutDown => f.write_str("shut down by host"),
        }
    }
}

/// Failure of a single [`call`](crate::Sidecar::call).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// The request never reached the worker.
    #[error("failed to send request to worker: {0}")]
    Transport(String),

    /// The worker replied with an `error` field. Displays the message verbatim.
    #[error("{0}")]
    Application(String),

    #[error("worker terminated ({0})")]
    WorkerTerminated(Termination),

    #[error("request id {0} is already in flight")]
    DuplicateId(RequestId),

    #[error("call cancelled")]
    Cancelled,

    #[error("failed to encode params: {0}")]
    Encode(String),

    #[error("failed to decode result: {0}")]
    Decode(String),
}

impl CallError {
    /// Message the worker sent, for application errors.
    pub fn application_message(&self) -> Option<&str> {
        match self {
            Self::Application(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::WorkerTerminated(_))
    }
}

/// A worker output line that could not be decoded. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("undecodable line `{snippet}`: {source}")]
    Invalid {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A record could not be handed to the worker's input.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("writer closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker executable `{name}` not found (searched: {})", display_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },

    #[error("worker {0} not captured")]
    MissingPipe(&'static str),

    #[error("spawn failed: {0}")]
    Other(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to shut down worker: {0}")]
    Shutdown(String),
}
