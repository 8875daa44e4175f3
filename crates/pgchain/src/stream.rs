//! Lazily consumed select results.

use crate::connection::{Connection, RowStream};
use crate::error::{OrmError, OrmResult};
use crate::lease::Lease;
use crate::row::Row;
use futures_core::Stream;
use futures_core::stream::FusedStream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A single-pass stream of rows that owns its connection.
///
/// The connection is released when the rows run out, when the stream fails,
/// on [`QueryStream::close`], or on drop. Closing or dropping a stream that
/// still has rows pending cancels the statement on the server first.
#[must_use = "streams do nothing unless polled"]
pub struct QueryStream<C: Connection + 'static> {
    lease: Option<Lease<C>>,
    rows: Option<RowStream>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    done: bool,
}

// The connection is never pinned; only `rows` is polled through a pin.
impl<C: Connection + 'static> Unpin for QueryStream<C> {}

impl<C: Connection + 'static> QueryStream<C> {
    pub(crate) fn new(lease: Lease<C>, rows: RowStream, cancel: Option<CancellationToken>) -> Self {
        Self {
            lease: Some(lease),
            rows: Some(rows),
            cancelled: cancel.map(|token| Box::pin(token.cancelled_owned())),
            done: false,
        }
    }

    /// Whether the stream has finished (exhausted, failed, or closed).
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Stop iterating and release the connection.
    ///
    /// Mid-iteration this cancels the running statement. A stream that already
    /// finished closes as a no-op.
    pub async fn close(mut self) -> OrmResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        self.rows = None;
        self.cancelled = None;
        if let Some(lease) = self.lease.take() {
            lease.abandon().await;
        }
        tracing::debug!(target: "pgchain", "stream closed");
        Ok(())
    }

    /// Release the connection; `interrupted` also cancels the statement.
    fn finish(&mut self, interrupted: bool) {
        self.done = true;
        self.rows = None;
        self.cancelled = None;
        if let Some(lease) = self.lease.take() {
            lease.spawn_release(interrupted);
        }
    }
}

impl<C: Connection + 'static> Stream for QueryStream<C> {
    type Item = OrmResult<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Some(cancelled) = this.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                this.finish(true);
                return Poll::Ready(Some(Err(OrmError::aborted("stream aborted by caller"))));
            }
        }
        let Some(rows) = this.rows.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };
        match Pin::new(rows).poll_next(cx) {
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Err(err))) => {
                this.finish(false);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: Connection + 'static> FusedStream for QueryStream<C> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<C: Connection + 'static> Drop for QueryStream<C> {
    fn drop(&mut self) {
        if !self.done {
            self.finish(true);
        }
    }
}

impl<C: Connection + 'static> std::fmt::Debug for QueryStream<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
