//! Reader adapters used by the pipeline orchestrator.

use pgkeep_storage::BoxedReader;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::oneshot;

/// Verdict sent once every stage of the pipeline has been waited on.
pub(crate) type Verdict = Result<(), String>;

/// Creates a gate around `inner` and the sender that opens it.
pub(crate) fn gate(inner: BoxedReader) -> (oneshot::Sender<Verdict>, GatedReader) {
    let (tx, rx) = oneshot::channel();
    (
        tx,
        GatedReader {
            inner,
            verdict: rx,
            inner_done: false,
            outcome: None,
        },
    )
}

/// Passes bytes through but withholds end of stream until the verdict.
///
/// Storage and file sinks publish their object when their input reaches a
/// clean EOF. Holding EOF back until every stage has exited successfully,
/// and turning a failed verdict into a read error, means a failed pipeline
/// never publishes a truncated object.
pub(crate) struct GatedReader {
    inner: BoxedReader,
    verdict: oneshot::Receiver<Verdict>,
    inner_done: bool,
    /// The resolved verdict; the receiver must not be polled again.
    outcome: Option<Verdict>,
}

impl AsyncRead for GatedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if !this.inner_done {
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            if buf.filled().len() > before {
                return Poll::Ready(Ok(()));
            }
            this.inner_done = true;
        }

        if this.outcome.is_none() {
            let outcome = match ready!(Pin::new(&mut this.verdict).poll(cx)) {
                Ok(verdict) => verdict,
                Err(_) => Err("pipeline abandoned before completion".to_string()),
            };
            this.outcome = Some(outcome);
        }
        match &this.outcome {
            Some(Err(reason)) => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, reason.clone())))
            }
            _ => Poll::Ready(Ok(())),
        }
    }
}

/// Counts the bytes read through it.
pub(crate) struct CountingReader {
    inner: BoxedReader,
    count: Arc<AtomicU64>,
}

impl CountingReader {
    pub(crate) fn new(inner: BoxedReader) -> (Self, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        (
            Self {
                inner,
                count: Arc::clone(&count),
            },
            count,
        )
    }
}

impl AsyncRead for CountingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        let read = (buf.filled().len() - before) as u64;
        self.count.fetch_add(read, Ordering::Relaxed);
        Poll::Ready(Ok(()))
    }
}
