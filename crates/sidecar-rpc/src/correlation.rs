//! Correlation table - pending calls keyed by request id.
//!
//! Each entry owns the one-shot sender its caller is waiting on. Removal from
//! the map and delivery of the outcome happen together, so an id settles at
//! most once; later settles for the same id find nothing and do nothing.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{Outcome, RequestId};
use crate::error::CallError;

pub type CallResult = Result<Value, CallError>;

struct PendingEntry {
    method: String,
    registered_at: Instant,
    tx: oneshot::Sender<CallResult>,
}

impl PendingEntry {
    fn complete(self, id: &RequestId, result: CallResult) {
        let elapsed = self.registered_at.elapsed();
        tracing::debug!(
            request_id = %id,
            method = %self.method,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "Request settled"
        );
        if self.tx.send(result).is_err() {
            tracing::trace!(request_id = %id, "Caller stopped waiting before settlement");
        }
    }
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: DashMap<RequestId, PendingEntry>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new in-flight request and hand back the receiver its caller
    /// awaits.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> Result<oneshot::Receiver<CallResult>, CallError> {
        match self.entries.entry(id) {
            Entry::Occupied(occupied) => Err(CallError::DuplicateId(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingEntry {
                    method: method.into(),
                    registered_at: Instant::now(),
                    tx,
                });
                Ok(rx)
            }
        }
    }

    /// Deliver a worker response. Unknown or already-settled ids are ignored.
    ///
    /// Returns whether a pending entry was found.
    pub fn settle(&self, id: &RequestId, outcome: Outcome) -> bool {
        let result = match outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(message) => Err(CallError::Application(message)),
        };
        self.complete(id, result)
    }

    /// Fail one pending entry with a host-side error.
    pub fn fail(&self, id: &RequestId, error: CallError) -> bool {
        self.complete(id, Err(error))
    }

    /// Forget an entry without notifying its caller (cancellation).
    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every pending entry; returns how many were failed.
    pub fn fail_all(&self, error: &CallError) -> usize {
        let ids: Vec<RequestId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter(|id| self.complete(id, Err(error.clone())))
            .count()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the oldest pending entry, if any.
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.entries
            .iter()
            .map(|e| e.registered_at.elapsed())
            .max()
    }

    fn complete(&self, id: &RequestId, result: CallResult) -> bool {
        match self.entries.remove(id) {
            Some((id, entry)) => {
                entry.complete(&id, result);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::error::Termination;

    #[tokio::test]
    async fn settle_delivers_result_once() {
        let table = CorrelationTable::new();
        let id = RequestId::from("X");
        let rx = table.register(id.clone(), "transcribe").unwrap();
        assert!(table.contains(&id));

        assert!(table.settle(&id, Outcome::Result(json!({"text": "hello"}))));
        assert!(!table.contains(&id));
        assert_eq!(rx.await.unwrap().unwrap(), json!({"text": "hello"}));

        // Duplicate response for the same id.
        assert!(!table.settle(&id, Outcome::Result(json!(null))));
    }

    #[tokio::test]
    async fn settle_error_becomes_application_error() {
        let table = CorrelationTable::new();
        let id = RequestId::from("Y");
        let rx = table.register(id.clone(), "transcribe").unwrap();

        table.settle(&id, Outcome::Error("model not found".to_string()));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.application_message(), Some("model not found"));
    }

    #[test]
    fn settle_unknown_id_is_a_noop() {
        let table = CorrelationTable::new();
        assert!(!table.settle(&RequestId::from("ghost"), Outcome::Error("x".into())));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = CorrelationTable::new();
        let id = RequestId::from("dup");
        let _rx = table.register(id.clone(), "a").unwrap();

        let err = table.register(id.clone(), "b").unwrap_err();
        assert!(matches!(err, CallError::DuplicateId(ref d) if d == &id));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn settle_after_caller_left_does_not_panic() {
        let table = CorrelationTable::new();
        let id = RequestId::from("gone");
        drop(table.register(id.clone(), "a").unwrap());

        assert!(table.settle(&id, Outcome::Result(json!(1))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn fail_all_sweeps_every_entry() {
        let table = CorrelationTable::new();
        let receivers: Vec<_> = (0..3)
            .map(|n| table.register(RequestId::from(format!("p{n}")), "m").unwrap())
            .collect();

        let error = CallError::WorkerTerminated(Termination::StreamClosed);
        assert_eq!(table.fail_all(&error), 3);
        assert!(table.is_empty());

        for rx in receivers {
            assert!(rx.await.unwrap().unwrap_err().is_terminated());
        }
    }

    #[test]
    fn remove_drops_entry_without_settling() {
        let table = CorrelationTable::new();
        let id = RequestId::from("c");
        let mut rx = table.register(id.clone(), "m").unwrap();

        assert!(table.remove(&id));
        assert!(!table.remove(&id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_register_and_settle_do_not_race() {
        let table = Arc::new(CorrelationTable::new());
        let mut handles = Vec::new();

        for n in 0..64 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                let id = RequestId::from(format!("r{n}"));
                let rx = table.register(id.clone(), "m").unwrap();
                let settler = Arc::clone(&table);
                let settle_id = id.clone();
                tokio::spawn(async move {
                    settler.settle(&settle_id, Outcome::Result(json!(n)));
                });
                rx.await.unwrap().unwrap()
            }));
        }

        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), json!(n));
        }
        assert!(table.is_empty());
    }
}
