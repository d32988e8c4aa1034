//! Response router - the host's single reader of worker output.
//!
//! Runs until the worker's output stream ends or fails. A line that cannot be
//! decoded is logged and skipped; it never settles a call and never stops the
//! loop.

use std::io;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{LogLine, Notification, WorkerMessage};
use crate::correlation::CorrelationTable;
use crate::progress::ProgressBroker;

/// What the router saw before its stream ended.
#[derive(Debug, Default)]
pub struct RouterSummary {
    pub responses: u64,
    /// Responses whose id matched no pending call.
    pub unmatched: u64,
    pub notifications: u64,
    /// Lines that failed to decode.
    pub discarded: u64,
    /// Set when the stream ended with a read error rather than EOF.
    pub error: Option<io::Error>,
}

pub async fn run_router<R>(
    reader: R,
    table: &CorrelationTable,
    broker: &ProgressBroker,
) -> RouterSummary
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, JsonLinesCodec::<WorkerMessage>::new());
    let mut summary = RouterSummary::default();

    loop {
        match lines.next().await {
            Some(Ok(Ok(WorkerMessage::Response(response)))) => {
                summary.responses += 1;
                let id = response.id.clone();
                if table.settle(&id, response.outcome) {
                    broker.unsubscribe(&id);
                } else {
                    summary.unmatched += 1;
                    tracing::warn!(request_id = %id, "Response for unknown or settled request");
                }
            }
            Some(Ok(Ok(WorkerMessage::Notification(Notification::Progress(progress))))) => {
                summary.notifications += 1;
                tracing::trace!(
                    request_id = %progress.id,
                    status = %progress.status,
                    progress = progress.progress,
                    "Progress"
                );
                broker.deliver(&progress);
            }
            Some(Ok(Ok(WorkerMessage::Notification(Notification::Log(line))))) => {
                summary.notifications += 1;
                emit_worker_log(&line);
            }
            Some(Ok(Err(e))) => {
                summary.discarded += 1;
                tracing::warn!(error = %e, "Discarding undecodable line from worker");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Worker output stream failed");
                summary.error = Some(e);
                break;
            }
            None => {
                tracing::debug!("Worker output stream closed");
                break;
            }
        }
    }

    tracing::debug!(
        responses = summary.responses,
        unmatched = summary.unmatched,
        notifications = summary.notifications,
        discarded = summary.discarded,
        "Router exiting"
    );
    summary
}

fn emit_worker_log(line: &LogLine) {
    let message = line.message.trim_end();
    if !message.is_empty() {
        tracing::info!(target: "sidecar_rpc::worker", request_id = %line.id, "{}", message);
    }
}
