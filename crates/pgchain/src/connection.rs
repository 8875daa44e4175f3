//! Connection traits the execution engine speaks to.
//!
//! The engine never touches driver internals. It borrows a [`Connection`] from a
//! [`ConnectionSource`], runs statements on it, and drops it to release it.
//! Implementations for `tokio-postgres` and `deadpool-postgres` live in
//! [`crate::pg`].

use crate::error::OrmResult;
use crate::row::Row;
use crate::value::Value;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// A single database connection.
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<Vec<Row>>> + Send;

    /// Execute a statement and return the number of affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = OrmResult<u64>> + Send;

    /// Start a query and return its rows incrementally.
    fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<RowStream>> + Send;

    /// Run one or more statements without parameters.
    fn batch_execute(&self, sql: &str) -> impl Future<Output = OrmResult<()>> + Send;

    /// Ask the server to cancel whatever this connection is running.
    fn cancel(&self) -> impl Future<Output = OrmResult<()>> + Send;

    fn begin(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("BEGIN")
    }

    fn commit(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("COMMIT")
    }

    fn rollback(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("ROLLBACK")
    }

    /// Set `statement_timeout`; `local` scopes it to the current transaction.
    fn set_statement_timeout(
        &self,
        timeout: Duration,
        local: bool,
    ) -> impl Future<Output = OrmResult<()>> + Send {
        async move {
            let params = [
                Value::Text(format!("{}ms", timeout.as_millis())),
                Value::Bool(local),
            ];
            self.query("SELECT set_config('statement_timeout', $1, $2)", &params)
                .await
                .map(|_| ())
        }
    }

    fn reset_statement_timeout(&self) -> impl Future<Output = OrmResult<()>> + Send {
        self.batch_execute("RESET statement_timeout")
    }
}

/// Where the engine borrows connections from.
///
/// Releasing a connection is dropping it.
pub trait ConnectionSource: Send + Sync {
    type Conn: Connection + 'static;

    fn acquire(&self) -> impl Future<Output = OrmResult<Self::Conn>> + Send;

    /// Stop handing out connections. Sources that own nothing do nothing.
    fn close(&self) {}
}

/// A source that always hands out the same connection.
///
/// Transactions use this to funnel every statement through the one connection
/// that issued `BEGIN`. It can also wrap a single standalone connection.
pub struct Scoped<C> {
    conn: Arc<C>,
}

impl<C> Scoped<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    pub fn from_arc(conn: Arc<C>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }
}

impl<C> Clone for Scoped<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<C: Connection + 'static> ConnectionSource for Scoped<C> {
    type Conn = Arc<C>;

    async fn acquire(&self) -> OrmResult<Arc<C>> {
        Ok(Arc::clone(&self.conn))
    }
}

impl<C: Connection> Connection for Arc<C> {
    fn query(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<Vec<Row>>> + Send {
        C::query(self, sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = OrmResult<u64>> + Send {
        C::execute(self, sql, params)
    }

    fn query_stream(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = OrmResult<RowStream>> + Send {
        C::query_stream(self, sql, params)
    }

    fn batch_execute(&self, sql: &str) -> impl Future<Output = OrmResult<()>> + Send {
        C::batch_execute(self, sql)
    }

    fn cancel(&self) -> impl Future<Output = OrmResult<()>> + Send {
        C::cancel(self)
    }

    fn begin(&self) -> impl Future<Output = OrmResult<()>> + Send {
        C::begin(self)
    }

    fn commit(&self) -> impl Future<Output = OrmResult<()>> + Send {
        C::commit(self)
    }

    fn rollback(&self) -> impl Future<Output = OrmResult<()>> + Send {
        C::rollback(self)
    }

    fn set_statement_timeout(
        &self,
        timeout: Duration,
        local: bool,
    ) -> impl Future<Output = OrmResult<()>> + Send {
        C::set_statement_timeout(self, timeout, local)
    }

    fn reset_statement_timeout(&self) -> impl Future<Output = OrmResult<()>> + Send {
        C::reset_statement_timeout(self)
    }
}

/// A stream of database rows.
///
/// Type-erased so every connection implementation returns the same type.
#[must_use]
pub struct RowStream {
    inner: Pin<Box<dyn Stream<Item = OrmResult<Row>> + Send>>,
}

impl RowStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = OrmResult<Row>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for RowStream {
    type Item = OrmResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").finish_non_exhaustive()
    }
}
