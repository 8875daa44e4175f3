//! Runs compiled statements against a [`ConnectionSource`].
//!
//! One call acquires one connection (or reuses the scoped one inside a
//! transaction), applies the statement timeout, runs the primary statement,
//! shapes the rows, optionally runs the count query on the same connection,
//! and releases the connection through a [`Lease`]. Transient failures are retried
//! with exponential backoff outside transactions.

use crate::compile::{CompiledStatement, compile, compile_count, parse_plan_rows};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionSource};
use crate::error::{OrmError, OrmResult};
use crate::hooks::Hooks;
use crate::lease::Lease;
use crate::response::Response;
use crate::row::Row;
use crate::state::{BuilderState, CountMode, Operation, RowShape};
use crate::stream::QueryStream;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

/// Rows (or nothing) and the optional count of one successful attempt.
type Outcome = (Option<JsonValue>, Option<i64>);

/// Borrowed view of a client's execution settings.
pub(crate) struct Executor<'a, S> {
    pub source: &'a S,
    pub config: &'a ClientConfig,
    pub hooks: &'a Hooks,
    /// Scoped clients run inside a transaction: no retry, local timeouts.
    pub in_transaction: bool,
}

impl<S: ConnectionSource> Executor<'_, S> {
    pub(crate) async fn execute(&self, state: BuilderState) -> Response<JsonValue> {
        let op = state.operation.name();
        if is_cancelled(state.cancel.as_ref()) {
            return self.fail(op, None, OrmError::aborted("query aborted before execution"));
        }
        let stmt = match compile(&state, &self.config.safety) {
            Ok(stmt) => stmt,
            Err(err) => return self.fail(op, None, err),
        };

        let max_attempts = if self.in_transaction {
            1
        } else {
            self.config.retry.attempts.max(1)
        };
        let mut attempt = 1;
        loop {
            match self.attempt(&state, &stmt).await {
                Ok((data, count)) => return Response::ok(data, count),
                Err(err) if attempt < max_attempts && err.is_retriable() => {
                    let delay = self.config.retry.delay_for(attempt);
                    tracing::warn!(
                        target: "pgchain",
                        operation = op,
                        attempt,
                        max_attempts,
                        backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, retrying"
                    );
                    if let Err(err) = sleep_or_cancel(delay, state.cancel.as_ref()).await {
                        return self.fail(op, Some(stmt.text()), err);
                    }
                    attempt += 1;
                }
                Err(err) => return self.fail(op, Some(stmt.text()), err),
            }
        }
    }

    /// Start a row stream. Only `select` can be streamed.
    pub(crate) async fn stream(&self, state: BuilderState) -> OrmResult<QueryStream<S::Conn>> {
        let op = state.operation.name();
        if !matches!(state.operation, Operation::Select { .. }) {
            let err = OrmError::validation(format!("{op} cannot be streamed; use select"));
            self.hooks.on_error(op, None, &err);
            return Err(err);
        }
        let cancel = state.cancel.as_ref();
        if is_cancelled(cancel) {
            let err = OrmError::aborted("stream aborted before execution");
            self.hooks.on_error(op, None, &err);
            return Err(err);
        }
        let stmt = compile(&state, &self.config.safety).inspect_err(|err| {
            self.hooks.on_error(op, None, err);
        })?;

        let conn = acquire(self.source, cancel).await.inspect_err(|err| {
            self.hooks.on_error(op, Some(stmt.text()), err);
        })?;
        let lease = Lease::new(conn, self.resets_timeout(), true);
        self.apply_timeout(lease.conn()).await;

        self.hooks.before_query(op, stmt.text(), stmt.values());
        let conn = lease.conn();
        let opened = cancellable(conn, cancel, conn.query_stream(stmt.text(), stmt.values())).await;
        match opened {
            Ok(rows) => {
                tracing::debug!(target: "pgchain", sql = stmt.text(), "stream opened");
                Ok(QueryStream::new(lease, rows, cancel.cloned()))
            }
            Err(err) => {
                lease.release().await;
                self.hooks.on_error(op, Some(stmt.text()), &err);
                Err(err)
            }
        }
    }

    async fn attempt(&self, state: &BuilderState, stmt: &CompiledStatement) -> OrmResult<Outcome> {
        let conn = acquire(self.source, state.cancel.as_ref()).await?;
        // Inside a transaction the statement runs on the shared connection;
        // cancelling it there would hit whatever the callback runs next.
        let lease = Lease::new(conn, self.resets_timeout(), !self.in_transaction);
        self.apply_timeout(lease.conn()).await;
        let result = self.run_on(lease.conn(), state, stmt).await;
        lease.release().await;
        result
    }

    /// A session-level timeout is set outside transactions and must be reset.
    fn resets_timeout(&self) -> bool {
        self.config.safety.statement_timeout.is_some() && !self.in_transaction
    }

    async fn apply_timeout(&self, conn: &S::Conn) {
        let Some(timeout) = self.config.safety.statement_timeout else {
            return;
        };
        if let Err(err) = conn.set_statement_timeout(timeout, self.in_transaction).await {
            tracing::debug!(target: "pgchain", error = %err, "failed to apply statement_timeout");
        }
    }

    async fn run_on(
        &self,
        conn: &S::Conn,
        state: &BuilderState,
        stmt: &CompiledStatement,
    ) -> OrmResult<Outcome> {
        let cancel = state.cancel.as_ref();
        self.hooks
            .before_query(state.operation.name(), stmt.text(), stmt.values());

        if !state.operation.is_query() && state.returning.is_none() {
            let affected = cancellable(conn, cancel, conn.execute(stmt.text(), stmt.values())).await?;
            let count = state.count.map(|_| saturating_i64(affected));
            return Ok((None, count));
        }

        let rows = cancellable(conn, cancel, conn.query(stmt.text(), stmt.values())).await?;
        let returned = rows.len();
        let data = shape_rows(rows, state.shape)?;
        let count = match state.count {
            None => None,
            Some(_) if state.operation.is_mutation() => Some(saturating_i64(returned as u64)),
            Some(mode) => self.count(conn, state, mode).await,
        };
        Ok((data, count))
    }

    /// Run the count query. Any failure yields `None`.
    async fn count(&self, conn: &S::Conn, state: &BuilderState, mode: CountMode) -> Option<i64> {
        let stmt = match compile_count(state, &self.config.safety, mode) {
            Ok(stmt) => stmt,
            Err(err) => {
                tracing::debug!(target: "pgchain", error = %err, "count query not compiled");
                return None;
            }
        };
        self.hooks.before_query("count", stmt.text(), stmt.values());
        let rows = match cancellable(conn, state.cancel.as_ref(), conn.query(stmt.text(), stmt.values())).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!(target: "pgchain", error = %err, "count query failed");
                return None;
            }
        };
        let first = rows.into_iter().next()?;
        let count = match mode {
            CountMode::Exact => first.get("count").and_then(JsonValue::as_i64),
            CountMode::Planned | CountMode::Estimated => {
                first.values().next().and_then(parse_plan_rows)
            }
        };
        if count.is_none() {
            tracing::debug!(target: "pgchain", mode = ?mode, "count result not understood");
        }
        count
    }

    fn fail<T>(&self, op: &'static str, sql: Option<&str>, err: OrmError) -> Response<T> {
        self.hooks.on_error(op, sql, &err);
        Response::err(err)
    }
}

/// Apply the requested row shape to a result set.
pub(crate) fn shape_rows(mut rows: Vec<Row>, shape: RowShape) -> OrmResult<Option<JsonValue>> {
    match (shape, rows.len()) {
        (RowShape::Many, _) => Ok(Some(JsonValue::Array(
            rows.into_iter().map(JsonValue::Object).collect(),
        ))),
        (RowShape::Single, 0) => Err(OrmError::not_found("expected exactly one row, got none")),
        (RowShape::MaybeSingle, 0) => Ok(None),
        (_, 1) => Ok(rows.pop().map(JsonValue::Object)),
        (_, got) => Err(OrmError::too_many_rows(1, got)),
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn is_cancelled(cancel: Option<&CancellationToken>) -> bool {
    cancel.is_some_and(CancellationToken::is_cancelled)
}

async fn acquire<S: ConnectionSource>(
    source: &S,
    cancel: Option<&CancellationToken>,
) -> OrmResult<S::Conn> {
    let Some(token) = cancel else {
        return source.acquire().await;
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(OrmError::aborted("aborted while acquiring a connection")),
        conn = source.acquire() => conn,
    }
}

/// Race `fut` against the abort signal; on abort, cancel the backend statement.
async fn cancellable<C, T, F>(conn: &C, cancel: Option<&CancellationToken>, fut: F) -> OrmResult<T>
where
    C: Connection,
    F: Future<Output = OrmResult<T>>,
{
    let Some(token) = cancel else {
        return fut.await;
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            match conn.cancel().await {
                Ok(()) => tracing::debug!(target: "pgchain", "backend statement cancelled"),
                Err(err) => tracing::debug!(target: "pgchain", error = %err, "backend cancel failed"),
            }
            Err(OrmError::aborted("query aborted by caller"))
        }
        res = fut => res,
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> OrmResult<()> {
    let Some(token) = cancel else {
        tokio::time::sleep(delay).await;
        return Ok(());
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(OrmError::aborted("aborted during retry backoff")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
