//! Worker side of the bridge - runs inside the sidecar process.
//!
//! Reads requests from stdin, runs each one on its own task through a
//! [`RequestHandler`], and writes responses and notifications to stdout in
//! whatever order they complete. Logging must go to stderr (see
//! [`init_tracing`](crate::logging::init_tracing)); stdout carries only the
//! protocol.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{
    LogLine, Notification, Progress, Request, RequestId, Response, WorkerMessage,
};
use crate::sequencer::WriteSequencer;

/// Handles one request. Errors become the response's `error` string.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        method: &str,
        params: Value,
        ctx: RequestContext,
    ) -> anyhow::Result<Value>;
}

/// Per-request handle for emitting notifications.
#[derive(Clone)]
pub struct RequestContext {
    id: RequestId,
    out: Arc<WriteSequencer<WorkerMessage>>,
}

impl RequestContext {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Report progress for this request. `progress` is a fraction in `[0, 1]`.
    ///
    /// Best-effort, like [`log`](Self::log): the notification is queued
    /// without waiting, and a failed write is only traced.
    pub fn progress(&self, status: impl Into<String>, progress: f64) {
        self.notify(Notification::Progress(Progress {
            id: self.id.clone(),
            status: status.into(),
            progress,
        }));
    }

    /// Forward a log line to the host's tracing output.
    pub fn log(&self, message: impl Into<String>) {
        self.notify(Notification::Log(LogLine {
            id: self.id.clone(),
            message: message.into(),
        }));
    }

    fn notify(&self, notification: Notification) {
        let request_id = self.id.clone();
        self.out.submit_then(notification.into(), move |result| {
            if let Err(e) = result {
                tracing::trace!(request_id = %request_id, error = %e, "Notification not written");
            }
        });
    }
}

/// Serve requests from `reader` until it closes, then wait for in-flight
/// requests to finish.
pub async fn serve<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> io::Result<()>
where
    H: RequestHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let out = Arc::new(WriteSequencer::<WorkerMessage>::spawn(writer));
    let mut requests = FramedRead::new(reader, JsonLinesCodec::<Request>::new());
    let mut tasks = JoinSet::new();
    let mut result = Ok(());

    loop {
        tokio::select! {
            line = requests.next() => match line {
                Some(Ok(Ok(request))) => {
                    tracing::debug!(request_id = %request.id, method = %request.method, "Request received");
                    tasks.spawn(run_request(Arc::clone(&handler), request, Arc::clone(&out)));
                }
                Some(Ok(Err(e))) => {
                    tracing::warn!(error = %e, "Ignoring undecodable request");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Request stream failed");
                    result = Err(e);
                    break;
                }
                None => {
                    tracing::debug!(in_flight = tasks.len(), "Request stream closed");
                    break;
                }
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Request task failed");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Request task failed");
        }
    }
    out.close();
    result
}

/// [`serve`] over the process's own stdin and stdout.
pub async fn serve_stdio<H: RequestHandler>(handler: Arc<H>) -> io::Result<()> {
    serve(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

async fn run_request<H: RequestHandler>(
    handler: Arc<H>,
    request: Request,
    out: Arc<WriteSequencer<WorkerMessage>>,
) {
    let Request { id, method, params } = request;
    let ctx = RequestContext {
        id: id.clone(),
        out: Arc::clone(&out),
    };

    let outcome = AssertUnwindSafe(handler.handle(&method, params, ctx))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(value)) => Response::success(id, value),
        Ok(Err(e)) => {
            tracing::debug!(request_id = %id, %method, error = %e, "Request failed");
            Response::failure(id, format!("{e:#}"))
        }
        Err(_) => {
            tracing::error!(request_id = %id, %method, "Handler panicked");
            Response::failure(id, format!("handler for `{method}` panicked"))
        }
    };

    let request_id = response.id.clone();
    if let Err(e) = out.submit(response.into()).await {
        tracing::warn!(request_id = %request_id, error = %e, "Failed to write response");
    }
}
