//! Write sequencer - sole owner of a worker-facing output stream.
//!
//! Concurrent producers submit records into an unbounded channel; a single
//! writer task encodes and flushes them one at a time, so records land on the
//! stream whole and in submission order. A failed write is reported to the
//! record's submitter only, and the task moves on to the next record.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::error::WriteError;

type Completion = Box<dyn FnOnce(Result<(), WriteError>) + Send>;

/// Runs a record's completion exactly once. A record dropped before it was
/// written reports [`WriteError::Closed`].
struct OnWritten(Option<Completion>);

impl OnWritten {
    fn complete(mut self, result: Result<(), WriteError>) {
        if let Some(done) = self.0.take() {
            done(result);
        }
    }
}

impl Drop for OnWritten {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            done(Err(WriteError::Closed));
        }
    }
}

struct WriteJob<T> {
    item: T,
    done: OnWritten,
}

/// Completion of one submitted record.
///
/// Resolves once the record has been flushed to the stream, or with the
/// error that prevented it. Dropping the ticket does not withdraw the record.
pub struct WriteTicket {
    rx: oneshot::Receiver<Result<(), WriteError>>,
}

impl Future for WriteTicket {
    type Output = Result<(), WriteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WriteError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct WriteSequencer<T> {
    tx: mpsc::UnboundedSender<WriteJob<T>>,
    shutdown: CancellationToken,
}

impl<T> WriteSequencer<T>
where
    T: Serialize + Send + 'static,
{
    /// Take ownership of `writer` and start the writer task.
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let sink = FramedWrite::new(writer, JsonLinesCodec::<T>::new());
        tokio::spawn(run_writer(sink, rx, shutdown.clone()));
        Self { tx, shutdown }
    }

    /// Queue `item` behind every previously submitted record.
    ///
    /// Synchronous, so the queue position is fixed at the moment of the call.
    pub fn submit(&self, item: T) -> WriteTicket {
        let (tx, rx) = oneshot::channel();
        self.submit_then(item, move |result| {
            if tx.send(result).is_err() {
                tracing::trace!("Write completion receiver dropped");
            }
        });
        WriteTicket { rx }
    }

    /// Queue `item` and run `on_written` with the outcome of its write.
    ///
    /// `on_written` runs on the writer task, or right here when the sequencer
    /// is already closed. It must not block.
    pub fn submit_then<F>(&self, item: T, on_written: F)
    where
        F: FnOnce(Result<(), WriteError>) + Send + 'static,
    {
        let job = WriteJob {
            item,
            done: OnWritten(Some(Box::new(on_written))),
        };
        // A rejected job is dropped here and reports `Closed`.
        let _ = self.tx.send(job);
    }

    /// Submit and wait until the record has been written.
    pub async fn enqueue(&self, item: T) -> Result<(), WriteError> {
        self.submit(item).await
    }

    /// Stop the writer task and close the underlying stream.
    ///
    /// Records still queued fail with [`WriteError::Closed`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

impl<T> Drop for WriteSequencer<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_writer<W, T>(
    mut sink: FramedWrite<W, JsonLinesCodec<T>>,
    mut rx: mpsc::UnboundedReceiver<WriteJob<T>>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = sink.send(job.item).await.map_err(WriteError::from);
        if let Err(ref e) = result {
            tracing::warn!(error = %e, "Write to worker failed");
            // Drop whatever part of the failed record is still buffered so it
            // cannot prefix the next one.
            sink.write_buffer_mut().clear();
        }
        job.done.complete(result);
    }

    rx.close();
    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Error closing worker input");
    }
    tracing::debug!("Writer task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use tokio::io::AsyncReadExt;

    use crate::bridge::protocol::{Request, RequestId};

    /// Writer that records everything and can be told to fail the next write.
    #[derive(Clone, Default)]
    struct Recorder {
        data: Arc<Mutex<Vec<u8>>>,
        fail_next: Arc<Mutex<bool>>,
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom")));
            }
            self.data.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn request(n: usize) -> Request {
        Request::new(
            RequestId::from(format!("req-{n}")),
            "work",
            serde_json::json!({ "n": n }),
        )
    }

    #[tokio::test]
    async fn records_arrive_whole_and_in_submission_order() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let sequencer = Arc::new(WriteSequencer::<Request>::spawn(writer));

        let tickets: Vec<_> = (0..50).map(|n| sequencer.submit(request(n))).collect();

        let read_task = tokio::spawn(async move {
            let mut out = String::new();
            reader.read_to_string(&mut out).await.unwrap();
            out
        });

        for ticket in tickets {
            ticket.await.unwrap();
        }
        sequencer.close();

        let out = read_task.await.unwrap();
        let ids: Vec<String> = out
            .lines()
            .map(|line| serde_json::from_str::<Request>(line).unwrap().id.to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|n| format!("req-{n}")).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn failed_write_only_affects_its_submitter() {
        let recorder = Recorder::default();
        let sequencer = WriteSequencer::<Request>::spawn(recorder.clone());

        sequencer.enqueue(request(0)).await.unwrap();

        *recorder.fail_next.lock().unwrap() = true;
        let err = sequencer.enqueue(request(1)).await.unwrap_err();
        assert!(matches!(err, WriteError::Io(_)));

        sequencer.enqueue(request(2)).await.unwrap();

        let data = String::from_utf8(recorder.data.lock().unwrap().clone()).unwrap();
        let ids: Vec<String> = data
            .lines()
            .map(|line| serde_json::from_str::<Request>(line).unwrap().id.to_string())
            .collect();
        assert_eq!(ids, vec!["req-0", "req-2"]);
    }

    #[tokio::test]
    async fn submit_then_reports_a_failed_write_without_a_waiter() {
        let recorder = Recorder::default();
        let sequencer = WriteSequencer::<Request>::spawn(recorder.clone());
        *recorder.fail_next.lock().unwrap() = true;

        let (tx, rx) = oneshot::channel();
        sequencer.submit_then(request(0), move |result| {
            let _ = tx.send(result.map_err(|e| e.to_string()));
        });
        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Err("write failed: boom".to_string()));
    }

    #[tokio::test]
    async fn submit_then_on_a_closed_sequencer_completes_immediately() {
        let sequencer = WriteSequencer::<Request>::spawn(Recorder::default());
        sequencer.close();
        // Let the writer task observe the close and drop its receiver.
        while !sequencer.tx.is_closed() {
            tokio::task::yield_now().await;
        }

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        sequencer.submit_then(request(0), move |result| {
            *slot.lock().unwrap() = Some(matches!(result, Err(WriteError::Closed)));
        });
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let sequencer = WriteSequencer::<Request>::spawn(Recorder::default());
        sequencer.close();
        assert!(sequencer.is_closed());

        let err = sequencer.enqueue(request(0)).await.unwrap_err();
        assert!(matches!(err, WriteError::Closed));
    }
}
