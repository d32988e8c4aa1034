//! Sidecar facade - the host-side handle to one worker.
//!
//! ```text
//!   call() ──► CorrelationTable.register ──► WriteSequencer ──► worker stdin
//!                      ▲
//!   worker stdout ──► router ──► settle / ProgressBroker / tracing
//!                      │
//!   termination watcher: router ended or process exited
//!                      └──► fail every pending call with WorkerTerminated
//! ```
//!
//! A [`PendingCall`] is issued synchronously: its request is queued for the
//! worker before `call` returns, so calls made one after another from a single
//! task reach the worker in that order even if the futures are awaited later or
//! concurrently.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::bridge::protocol::{Request, RequestId};
use crate::config::SidecarConfig;
use crate::correlation::{CallResult, CorrelationTable};
use crate::error::{CallError, SidecarError, Termination, WriteError};
use crate::progress::{ProgressBroker, ProgressHandler, ProgressRouting};
use crate::router::{RouterSummary, run_router};
use crate::sequencer::WriteSequencer;
use crate::supervisor::{ProcessState, ProcessSupervisor, WorkerExit, wait_stopped};

/// How long the router may keep draining output after the process exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for an exit status once the output stream has closed.
const REAP_GRACE: Duration = Duration::from_millis(500);
/// How long a worker may take to exit on its own after stdin closes.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// State shared between the facade, its calls and the termination watcher.
struct Shared {
    table: CorrelationTable,
    broker: ProgressBroker,
    termination: Mutex<Option<Termination>>,
}

impl Shared {
    fn new(routing: ProgressRouting) -> Self {
        Self {
            table: CorrelationTable::new(),
            broker: ProgressBroker::new(routing),
            termination: Mutex::new(None),
        }
    }

    fn termination(&self) -> Option<Termination> {
        self.termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record why the worker stopped. The first reason sticks.
    fn record(&self, reason: Termination) -> Termination {
        self.termination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason)
            .clone()
    }

    /// Settle a call whose request never reached the worker.
    ///
    /// Once the worker has stopped, the termination reason is reported instead
    /// of the write error.
    fn undelivered(&self, id: &RequestId, error: WriteError) {
        let failure = match self.termination() {
            Some(reason) => CallError::WorkerTerminated(reason),
            None => CallError::Transport(error.to_string()),
        };
        if self.table.fail(id, failure) {
            tracing::warn!(request_id = %id, error = %error, "Request not delivered");
            self.broker.unsubscribe(id);
        }
    }

    /// Record `reason` and fail everything still pending.
    fn terminate(&self, reason: Termination) -> usize {
        let reason = self.record(reason);
        let failed = self
            .table
            .fail_all(&CallError::WorkerTerminated(reason.clone()));
        self.broker.clear();
        if failed > 0 {
            tracing::warn!(failed, %reason, "Failing pending calls: worker terminated");
        } else {
            tracing::debug!(%reason, "Worker terminated with no calls pending");
        }
        failed
    }
}

/// Host-side handle to a running worker.
///
/// Dropping the sidecar closes the worker's stdin and terminates the process.
/// Use [`shutdown`](Self::shutdown) to wait for it to be gone.
pub struct Sidecar {
    shared: Arc<Shared>,
    writer: WriteSequencer<Request>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    router: AbortHandle,
    watcher: Option<JoinHandle<()>>,
}

impl Sidecar {
    /// Spawn the configured worker and start routing its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: SidecarConfig) -> Result<Self, SidecarError> {
        let spawner = config.spawner();
        tracing::info!(
            program = %config.program().display(),
            routing = ?config.progress_routing(),
            "Starting sidecar worker"
        );
        let (supervisor, pipes) =
            ProcessSupervisor::start(spawner.as_ref(), config.shutdown_grace())?;
        Ok(Self::assemble(
            pipes.stdout,
            pipes.stdin,
            Some(supervisor),
            config.progress_routing(),
        ))
    }

    /// Drive a worker reachable over an arbitrary stream pair.
    ///
    /// `reader` carries worker output, `writer` carries requests. No process
    /// is supervised; the worker counts as terminated when `reader` ends.
    pub fn from_streams<R, W>(reader: R, writer: W, routing: ProgressRouting) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::assemble(reader, writer, None, routing)
    }

    fn assemble<R, W>(
        reader: R,
        writer: W,
        supervisor: Option<Arc<ProcessSupervisor>>,
        routing: ProgressRouting,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::new(routing));
        let writer = WriteSequencer::spawn(writer);

        let router_shared = Arc::clone(&shared);
        let router = tokio::spawn(async move {
            run_router(reader, &router_shared.table, &router_shared.broker).await
        });

        let router_abort = router.abort_handle();
        let exit = supervisor.as_ref().map(|s| s.subscribe());
        let watcher = tokio::spawn(watch_termination(Arc::clone(&shared), router, exit));

        Self {
            shared,
            writer,
            supervisor,
            router: router_abort,
            watcher: Some(watcher),
        }
    }

    /// Issue a call and return the future of its outcome.
    ///
    /// The request is assigned a fresh id and queued before this returns.
    /// `progress` receives this call's progress notifications (see
    /// [`ProgressRouting`] for how handlers are chosen).
    pub fn call(
        &self,
        method: impl Into<String>,
        params: Value,
        progress: Option<ProgressHandler>,
    ) -> PendingCall {
        self.call_with_id(RequestId::new(), method, params, progress)
    }

    /// Like [`call`](Self::call) with a caller-chosen id.
    ///
    /// Fails with [`CallError::DuplicateId`] while another call with the same
    /// id is in flight.
    pub fn call_with_id(
        &self,
        id: RequestId,
        method: impl Into<String>,
        params: Value,
        progress: Option<ProgressHandler>,
    ) -> PendingCall {
        let method = method.into();

        if let Some(reason) = self.shared.termination() {
            return PendingCall::failed(id, CallError::WorkerTerminated(reason));
        }

        let response = match self.shared.table.register(id.clone(), method.as_str()) {
            Ok(rx) => rx,
            Err(e) => return PendingCall::failed(id, e),
        };
        if let Some(handler) = progress {
            self.shared.broker.subscribe(id.clone(), handler);
        }
        let guard = EntryGuard {
            id: id.clone(),
            shared: Arc::clone(&self.shared),
            armed: true,
        };

        // Lost a race with the termination sweep: the entry may have been
        // registered after it ran.
        if let Some(reason) = self.shared.termination() {
            drop(guard);
            return PendingCall::failed(id, CallError::WorkerTerminated(reason));
        }

        tracing::debug!(request_id = %id, %method, "Issuing call");
        let shared = Arc::clone(&self.shared);
        let request_id = id.clone();
        self.writer
            .submit_then(Request::new(id.clone(), method, params), move |result| {
                if let Err(e) = result {
                    shared.undelivered(&request_id, e);
                }
            });

        PendingCall {
            id,
            state: CallState::Waiting(response),
            guard: Some(guard),
        }
    }

    /// Call with typed params and result.
    pub async fn invoke<P, R>(
        &self,
        method: impl Into<String>,
        params: &P,
        progress: Option<ProgressHandler>,
    ) -> Result<R, CallError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|e| CallError::Encode(e.to_string()))?;
        let value = self.call(method, params, progress).await?;
        serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
    }

    /// Worker process id, if a process is supervised.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.as_ref().and_then(|s| s.pid())
    }

    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Whether new calls can still be issued.
    pub fn is_running(&self) -> bool {
        self.shared.termination().is_none()
    }

    /// Why the worker stopped, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination()
    }

    pub fn process_state(&self) -> Option<ProcessState> {
        self.supervisor.as_ref().map(|s| s.state())
    }

    /// Close the worker's stdin, stop the process and fail whatever is still
    /// pending with [`Termination::ShutDown`].
    ///
    /// A worker still running shortly after its stdin closes is sent SIGTERM,
    /// then killed once the configured shutdown grace runs out.
    ///
    /// Returns the worker's exit status when a process was supervised.
    pub async fn shutdown(mut self) -> Option<WorkerExit> {
        tracing::info!(pending = self.shared.table.len(), "Shutting down sidecar");
        self.shared.record(Termination::ShutDown);
        self.writer.close();

        let exit = match &self.supervisor {
            Some(supervisor) => {
                // A worker that exits on EOF gets the chance to do so cleanly.
                let state = match tokio::time::timeout(CLOSE_GRACE, supervisor.wait()).await {
                    Ok(state) => state,
                    Err(_) => supervisor.terminate().await,
                };
                state.exit()
            }
            None => None,
        };

        if let Some(mut watcher) = self.watcher.take()
            && tokio::time::timeout(DRAIN_GRACE, &mut watcher).await.is_err()
        {
            tracing::debug!("Worker output still open at shutdown");
            self.router.abort();
            let _ = watcher.await;
        }
        self.shared.terminate(Termination::ShutDown);

        if let Some(exit) = &exit {
            tracing::info!(%exit, "Sidecar shut down");
        }
        exit
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        self.writer.close();
        if let Some(supervisor) = &self.supervisor {
            supervisor.request_terminate();
        }
    }
}

async fn watch_termination(
    shared: Arc<Shared>,
    mut router: JoinHandle<RouterSummary>,
    exit: Option<watch::Receiver<ProcessState>>,
) {
    let reason = match exit {
        None => router_termination(router.await),
        Some(exit) => {
            tokio::select! {
                summary = &mut router => {
                    let closed = router_termination(summary);
                    // The exit status usually lands right behind EOF.
                    match tokio::time::timeout(REAP_GRACE, wait_stopped(exit)).await {
                        Ok(state) => process_termination(state).unwrap_or(closed),
                        Err(_) => closed,
                    }
                }
                state = wait_stopped(exit.clone()) => {
                    // Let the router deliver whatever the worker wrote before exiting.
                    if tokio::time::timeout(DRAIN_GRACE, &mut router).await.is_err() {
                        tracing::debug!("Worker output still open after exit");
                        router.abort();
                    }
                    process_termination(state).unwrap_or(Termination::StreamClosed)
                }
            }
        }
    };
    shared.terminate(reason);
}

fn router_termination(summary: Result<RouterSummary, JoinError>) -> Termination {
    match summary {
        Ok(RouterSummary { error: Some(e), .. }) => Termination::StreamError(e.to_string()),
        Ok(_) => Termination::StreamClosed,
        Err(e) => Termination::StreamError(e.to_string()),
    }
}

fn process_termination(state: ProcessState) -> Option<Termination> {
    match state {
        ProcessState::Exited(exit) => Some(Termination::Exited(exit)),
        ProcessState::Failed(e) => Some(Termination::Lost(e)),
        ProcessState::Running => None,
    }
}

/// Removes a call's bookkeeping when the call ends or is abandoned.
struct EntryGuard {
    id: RequestId,
    shared: Arc<Shared>,
    /// Still owns a table entry that nobody has settled.
    armed: bool,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.shared.broker.unsubscribe(&self.id);
        if self.armed && self.shared.table.remove(&self.id) {
            tracing::debug!(request_id = %self.id, "Call dropped before completion");
        }
    }
}

enum CallState {
    Failed(CallError),
    Waiting(oneshot::Receiver<CallResult>),
    Done,
}

/// Outcome of one [`Sidecar::call`].
///
/// Resolves to the worker's `result`, or an error. Dropping it before it
/// resolves withdraws the call: a late response for it is ignored.
#[must_use = "a call is withdrawn when its PendingCall is dropped"]
pub struct PendingCall {
    id: RequestId,
    state: CallState,
    guard: Option<EntryGuard>,
}

impl PendingCall {
    fn failed(id: RequestId, error: CallError) -> Self {
        Self {
            id,
            state: CallState::Failed(error),
            guard: None,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Withdraw the call. Returns whether it was still pending.
    ///
    /// The request may already have reached the worker; its response is
    /// dropped when it arrives.
    pub fn cancel(mut self) -> bool {
        match self.guard.take() {
            Some(mut guard) => {
                guard.armed = false;
                guard.shared.table.remove(&guard.id)
            }
            None => false,
        }
    }

    fn finish(&mut self, result: CallResult) -> Poll<CallResult> {
        if let Some(mut guard) = self.guard.take() {
            guard.armed = false;
        }
        self.state = CallState::Done;
        Poll::Ready(result)
    }
}

impl Future for PendingCall {
    type Output = Result<Value, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, CallState::Done) {
            CallState::Failed(error) => this.finish(Err(error)),
            CallState::Waiting(mut response) => match Pin::new(&mut response).poll(cx) {
                Poll::Ready(result) => this.finish(result.unwrap_or(Err(CallError::Cancelled))),
                Poll::Pending => {
                    this.state = CallState::Waiting(response);
                    Poll::Pending
                }
            },
            CallState::Done => Poll::Ready(Err(CallError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::{FramedRead, LinesCodec};

    use crate::bridge::protocol::Progress;
    use crate::progress::progress_handler;

    /// Worker end of an in-process sidecar.
    struct FakeWorker {
        requests: FramedRead<DuplexStream, LinesCodec>,
        output: DuplexStream,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> Request {
            let line = self.requests.next().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.output.write_all(line.as_bytes()).await.unwrap();
            self.output.write_all(b"\n").await.unwrap();
        }

        async fn reply(&mut self, id: &RequestId, result: Value) {
            let line = json!({"id": id, "result": result}).to_string();
            self.send(&line).await;
        }
    }

    fn pair(routing: ProgressRouting) -> (Sidecar, FakeWorker) {
        let (host_out, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, host_in) = tokio::io::duplex(64 * 1024);
        let sidecar = Sidecar::from_streams(host_in, host_out, routing);
        let worker = FakeWorker {
            requests: FramedRead::new(worker_in, LinesCodec::new()),
            output: worker_out,
        };
        (sidecar, worker)
    }

    fn recording() -> (ProgressHandler, Arc<StdMutex<Vec<(String, String)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = progress_handler(move |p: &Progress| {
            sink.lock().unwrap().push((p.id.to_string(), p.status.clone()));
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn calls_reach_the_worker_in_issue_order() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);

        let calls: Vec<PendingCall> = (0..20)
            .map(|n| sidecar.call("work", json!({ "n": n }), None))
            .collect();

        for n in 0..20 {
            let request = worker.next_request().await;
            assert_eq!(request.params, json!({ "n": n }));
            worker.reply(&request.id, json!(n)).await;
        }

        let results = futures::future::join_all(calls).await;
        for (n, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), json!(n));
        }
        assert_eq!(sidecar.pending_count(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);

        let x = sidecar.call_with_id("X".into(), "transcribe", json!({}), None);
        let y = sidecar.call_with_id("Y".into(), "transcribe", json!({}), None);
        worker.next_request().await;
        worker.next_request().await;

        worker.send(r#"{"id":"Y","error":"model not found"}"#).await;
        worker.send("not json").await;
        worker.send(r#"{"id":"X","result":{"text":"hello"}}"#).await;

        assert_eq!(x.await.unwrap(), json!({"text": "hello"}));
        let err = y.await.unwrap_err();
        assert_eq!(err.application_message(), Some("model not found"));
        assert_eq!(err.to_string(), "model not found");
    }

    #[tokio::test]
    async fn unknown_response_ids_are_ignored() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let call = sidecar.call_with_id("real".into(), "m", Value::Null, None);
        worker.next_request().await;

        worker.send(r#"{"id":"ghost","result":1}"#).await;
        worker.send(r#"{"id":"real","result":2}"#).await;

        assert_eq!(call.await.unwrap(), json!(2));
        assert!(sidecar.is_running());
    }

    #[tokio::test]
    async fn duplicate_in_flight_id_is_rejected() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let first = sidecar.call_with_id("same".into(), "m", Value::Null, None);
        let second = sidecar.call_with_id("same".into(), "m", Value::Null, None);

        assert!(matches!(second.await, Err(CallError::DuplicateId(_))));

        worker.next_request().await;
        worker.send(r#"{"id":"same","result":"first"}"#).await;
        assert_eq!(first.await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn per_request_progress_is_isolated() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let (a_handler, a_seen) = recording();
        let (b_handler, b_seen) = recording();

        let a = sidecar.call_with_id("A".into(), "m", Value::Null, Some(a_handler));
        let b = sidecar.call_with_id("B".into(), "m", Value::Null, Some(b_handler));
        worker.next_request().await;
        worker.next_request().await;

        worker
            .send(r#"{"event":"Progress","id":"A","status":"a1","progress":0.5}"#)
            .await;
        worker
            .send(r#"{"event":"Progress","id":"B","status":"b1","progress":0.5}"#)
            .await;
        worker.send(r#"{"id":"A","result":null}"#).await;
        worker.send(r#"{"id":"B","result":null}"#).await;

        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(*a_seen.lock().unwrap(), vec![("A".into(), "a1".into())]);
        assert_eq!(*b_seen.lock().unwrap(), vec![("B".into(), "b1".into())]);
    }

    #[tokio::test]
    async fn latest_routing_delivers_everything_to_newest_handler() {
        let (sidecar, mut worker) = pair(ProgressRouting::Latest);
        let (a_handler, a_seen) = recording();
        let (b_handler, b_seen) = recording();

        let a = sidecar.call_with_id("A".into(), "m", Value::Null, Some(a_handler));
        let b = sidecar.call_with_id("B".into(), "m", Value::Null, Some(b_handler));
        worker.next_request().await;
        worker.next_request().await;

        worker
            .send(r#"{"event":"Progress","id":"A","status":"a1","progress":0.5}"#)
            .await;
        worker.send(r#"{"id":"A","result":null}"#).await;
        worker.send(r#"{"id":"B","result":null}"#).await;

        a.await.unwrap();
        b.await.unwrap();
        assert!(a_seen.lock().unwrap().is_empty());
        assert_eq!(*b_seen.lock().unwrap(), vec![("A".into(), "a1".into())]);
    }

    #[tokio::test]
    async fn stream_close_fails_pending_calls_and_later_calls() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let pending = sidecar.call("slow", Value::Null, None);
        worker.next_request().await;

        drop(worker);

        let err = pending.await.unwrap_err();
        assert!(matches!(
            err,
            CallError::WorkerTerminated(Termination::StreamClosed)
        ));
        assert!(!sidecar.is_running());
        assert_eq!(sidecar.termination(), Some(Termination::StreamClosed));

        let later = sidecar.call("again", Value::Null, None).await.unwrap_err();
        assert!(later.is_terminated());
        assert_eq!(sidecar.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_call_releases_its_entry() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let (handler, seen) = recording();

        let call = sidecar.call_with_id("gone".into(), "m", Value::Null, Some(handler));
        assert_eq!(sidecar.pending_count(), 1);
        drop(call);
        assert_eq!(sidecar.pending_count(), 0);

        worker.next_request().await;
        worker
            .send(r#"{"event":"Progress","id":"gone","status":"late","progress":1}"#)
            .await;
        worker.send(r#"{"id":"gone","result":1}"#).await;

        // Output is routed in order, so once this settles the stray lines
        // above have been discarded.
        let sync = sidecar.call("sync", Value::Null, None);
        let request = worker.next_request().await;
        worker.reply(&request.id, Value::Null).await;
        sync.await.unwrap();

        let again = sidecar.call_with_id("gone".into(), "m", Value::Null, None);
        worker.next_request().await;
        worker.send(r#"{"id":"gone","result":2}"#).await;
        assert_eq!(again.await.unwrap(), json!(2));
        assert!(seen.lock().unwrap().is_empty());
    }

    /// A sidecar whose worker has stopped reading requests but still holds its
    /// output open.
    fn deaf_pair() -> (Sidecar, DuplexStream) {
        let (host_out, worker_in) = tokio::io::duplex(1024);
        drop(worker_in);
        let (worker_out, host_in) = tokio::io::duplex(1024);
        let sidecar = Sidecar::from_streams(host_in, host_out, ProgressRouting::PerRequest);
        (sidecar, worker_out)
    }

    #[tokio::test]
    async fn undeliverable_request_is_a_transport_error() {
        let (sidecar, _output) = deaf_pair();
        let (handler, seen) = recording();

        let err = sidecar
            .call("transcribe", json!({"path": "a.wav"}), Some(handler))
            .await
            .unwrap_err();
        match &err {
            CallError::Transport(message) => assert!(message.contains("write failed"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sidecar.pending_count(), 0);
        assert!(sidecar.is_running());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_settles_a_call_nobody_awaits() {
        let (sidecar, _output) = deaf_pair();

        let call = sidecar.call("transcribe", Value::Null, None);
        assert_eq!(sidecar.pending_count(), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while sidecar.pending_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("entry released after the write failed");

        assert!(matches!(call.await, Err(CallError::Transport(_))));
    }

    #[tokio::test]
    async fn cancel_reports_whether_call_was_pending() {
        let (sidecar, _worker) = pair(ProgressRouting::PerRequest);
        let call = sidecar.call("m", Value::Null, None);
        assert!(call.cancel());
        assert_eq!(sidecar.pending_count(), 0);

        let failed = PendingCall::failed("x".into(), CallError::Cancelled);
        assert!(!failed.cancel());
    }

    #[tokio::test]
    async fn invoke_round_trips_typed_values() {
        #[derive(Serialize)]
        struct Params<'a> {
            path: &'a str,
        }
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Transcript {
            text: String,
        }

        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let replier = tokio::spawn(async move {
            let request = worker.next_request().await;
            assert_eq!(request.method, "transcribe");
            assert_eq!(request.params, json!({"path": "a.wav"}));
            worker.reply(&request.id, json!({"text": "hello"})).await;
            let request = worker.next_request().await;
            worker.reply(&request.id, json!(42)).await;
            worker
        });

        let transcript: Transcript = sidecar
            .invoke("transcribe", &Params { path: "a.wav" }, None)
            .await
            .unwrap();
        assert_eq!(transcript, Transcript { text: "hello".into() });

        let err = sidecar
            .invoke::<_, Transcript>("transcribe", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Decode(_)));
        let _worker = replier.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_pending_with_shut_down() {
        let (sidecar, mut worker) = pair(ProgressRouting::PerRequest);
        let pending = sidecar.call("slow", Value::Null, None);
        worker.next_request().await;

        let closer = tokio::spawn(async move {
            // Worker sees EOF on its input once the host closes it.
            assert!(worker.requests.next().await.is_none());
            drop(worker.output);
        });

        assert_eq!(sidecar.shutdown().await, None);
        let err = pending.await.unwrap_err();
        assert!(matches!(
            err,
            CallError::WorkerTerminated(Termination::ShutDown)
        ));
        closer.await.unwrap();
    }
}
