//! Progress broker - delivers worker progress notifications to callers.
//!
//! Two routing policies:
//! - [`ProgressRouting::PerRequest`]: a handler only sees notifications that
//!   carry its own request id.
//! - [`ProgressRouting::Latest`]: one active handler, replaced by every call
//!   that supplies one, receives all notifications regardless of id.
//!   Concurrent calls observe each other's progress under this policy.
//!
//! Handlers run on the router task and should return quickly.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::bridge::protocol::{Progress, RequestId};

pub type ProgressHandler = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Wrap a closure as a [`ProgressHandler`].
pub fn progress_handler<F>(f: F) -> ProgressHandler
where
    F: Fn(&Progress) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressRouting {
    #[default]
    PerRequest,
    Latest,
}

impl FromStr for ProgressRouting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-request" | "per_request" | "request" => Ok(Self::PerRequest),
            "latest" | "global" => Ok(Self::Latest),
            other => Err(format!(
                "unknown progress routing `{other}`, expected `per-request` or `latest`"
            )),
        }
    }
}

pub struct ProgressBroker {
    routing: ProgressRouting,
    subscriptions: DashMap<RequestId, ProgressHandler>,
    active: Mutex<Option<ProgressHandler>>,
}

impl ProgressBroker {
    pub fn new(routing: ProgressRouting) -> Self {
        Self {
            routing,
            subscriptions: DashMap::new(),
            active: Mutex::new(None),
        }
    }

    pub fn routing(&self) -> ProgressRouting {
        self.routing
    }

    /// Install `handler` for the call identified by `id`.
    pub fn subscribe(&self, id: RequestId, handler: ProgressHandler) {
        match self.routing {
            ProgressRouting::PerRequest => {
                self.subscriptions.insert(id, handler);
            }
            ProgressRouting::Latest => {
                *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
            }
        }
    }

    /// Drop the subscription for a finished call.
    ///
    /// Under `Latest` the active handler stays until another call replaces it.
    pub fn unsubscribe(&self, id: &RequestId) {
        if self.routing == ProgressRouting::PerRequest {
            self.subscriptions.remove(id);
        }
    }

    /// Hand `progress` to the handler it routes to. Returns whether one ran.
    pub fn deliver(&self, progress: &Progress) -> bool {
        let handler = match self.routing {
            ProgressRouting::PerRequest => self
                .subscriptions
                .get(&progress.id)
                .map(|entry| Arc::clone(entry.value())),
            ProgressRouting::Latest => self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };

        match handler {
            // Called outside any lock so a handler may subscribe or deliver.
            Some(handler) => {
                handler(progress);
                true
            }
            None => {
                tracing::trace!(request_id = %progress.id, "No progress handler for notification");
                false
            }
        }
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.subscriptions.clear();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn subscriber_count(&self) -> usize {
        match self.routing {
            ProgressRouting::PerRequest => self.subscriptions.len(),
            ProgressRouting::Latest => self
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some() as usize,
        }
    }
}
