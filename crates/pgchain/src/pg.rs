//! [`Connection`] / [`ConnectionSource`] for `tokio-postgres` and `deadpool-postgres`.

use crate::connection::{Connection, RowStream};
#[cfg(feature = "pool")]
use crate::connection::ConnectionSource;
use crate::error::{OrmError, OrmResult};
use crate::row::{Row, row_to_json, rows_to_json};
use crate::value::Value;
use futures_core::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;

fn params_ref(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Adapts the driver's row stream to JSON rows and `OrmError`.
struct MapDbRowStream<S> {
    inner: Pin<Box<S>>,
}

impl<S> MapDbRowStream<S> {
    fn new(stream: S) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl<S> Stream for MapDbRowStream<S>
where
    S: Stream<Item = Result<tokio_postgres::Row, tokio_postgres::Error>> + Send + 'static,
{
    type Item = OrmResult<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(row_to_json(&row))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(OrmError::from_db_error(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Connection for tokio_postgres::Client {
    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        let rows = tokio_postgres::Client::query(self, sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)?;
        rows_to_json(&rows)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        tokio_postgres::Client::execute(self, sql, &params_ref(params))
            .await
            .map_err(OrmError::from_db_error)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> OrmResult<RowStream> {
        let stream = tokio_postgres::Client::query_raw(self, sql, params.iter())
            .await
            .map_err(OrmError::from_db_error)?;
        Ok(RowStream::new(MapDbRowStream::new(stream)))
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        tokio_postgres::Client::batch_execute(self, sql)
            .await
            .map_err(OrmError::from_db_error)
    }

    /// Cancel over a plaintext side connection; TLS-only servers refuse it.
    async fn cancel(&self) -> OrmResult<()> {
        self.cancel_token()
            .cancel_query(NoTls)
            .await
            .map_err(OrmError::from_db_error)
    }
}

// ===== deadpool-postgres support =====

#[cfg(feature = "pool")]
impl Connection for deadpool_postgres::Client {
    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        // Delegate to the deref target (ClientWrapper -> tokio_postgres::Client).
        let client: &tokio_postgres::Client = self;
        Connection::query(client, sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        let client: &tokio_postgres::Client = self;
        Connection::execute(client, sql, params).await
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> OrmResult<RowStream> {
        let client: &tokio_postgres::Client = self;
        Connection::query_stream(client, sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        let client: &tokio_postgres::Client = self;
        Connection::batch_execute(client, sql).await
    }

    async fn cancel(&self) -> OrmResult<()> {
        let client: &tokio_postgres::Client = self;
        Connection::cancel(client).await
    }
}

#[cfg(feature = "pool")]
impl ConnectionSource for deadpool_postgres::Pool {
    type Conn = deadpool_postgres::Client;

    async fn acquire(&self) -> OrmResult<deadpool_postgres::Client> {
        self.get().await.map_err(OrmError::from)
    }

    fn close(&self) {
        deadpool_postgres::Pool::close(self);
    }
}
