//! A borrowed connection that restores its session before release.
//!
//! Outside a transaction the engine sets `statement_timeout` for the whole
//! session, so the connection must run `RESET statement_timeout` before it goes
//! back to its source. [`Lease`] does that on the normal path and, when the
//! owning future is dropped mid-call, from a spawned task on drop.

use crate::connection::Connection;
use std::sync::Arc;

pub(crate) struct Lease<C: Connection + 'static> {
    conn: Arc<C>,
    reset_timeout: bool,
    /// Cancel the running statement if the lease is dropped unreleased.
    cancel_on_drop: bool,
    released: bool,
}

impl<C: Connection + 'static> Lease<C> {
    pub(crate) fn new(conn: C, reset_timeout: bool, cancel_on_drop: bool) -> Self {
        Self {
            conn: Arc::new(conn),
            reset_timeout,
            cancel_on_drop,
            released: false,
        }
    }

    pub(crate) fn conn(&self) -> &C {
        &self.conn
    }

    /// Reset the session if needed, then drop the connection.
    pub(crate) async fn release(mut self) {
        cleanup(self.conn.as_ref(), false, self.reset_timeout).await;
        self.released = true;
    }

    /// Cancel the running statement, reset the session, drop the connection.
    pub(crate) async fn abandon(mut self) {
        cleanup(self.conn.as_ref(), true, self.reset_timeout).await;
        self.released = true;
    }

    /// Release from a spawned task, for callers that cannot `.await`.
    pub(crate) fn spawn_release(mut self, cancel: bool) {
        self.cancel_on_drop = cancel;
    }
}

impl<C: Connection + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.released || !(self.cancel_on_drop || self.reset_timeout) {
            return;
        }
        let (cancel, reset_timeout) = (self.cancel_on_drop, self.reset_timeout);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let conn = Arc::clone(&self.conn);
                handle.spawn(async move {
                    cleanup(conn.as_ref(), cancel, reset_timeout).await;
                });
            }
            Err(_) => {
                tracing::debug!(target: "pgchain", "no tokio runtime; connection dropped without cleanup");
            }
        }
    }
}

async fn cleanup<C: Connection>(conn: &C, cancel: bool, reset_timeout: bool) {
    if cancel {
        match conn.cancel().await {
            Ok(()) => tracing::debug!(target: "pgchain", "backend statement cancelled"),
            Err(err) => tracing::debug!(target: "pgchain", error = %err, "backend cancel failed"),
        }
    }
    if reset_timeout {
        if let Err(err) = conn.reset_statement_timeout().await {
            tracing::debug!(target: "pgchain", error = %err, "failed to reset statement_timeout");
        }
    }
}
