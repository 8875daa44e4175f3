//! `BEGIN` / `COMMIT` / `ROLLBACK` around a callback.

use crate::client::Client;
use crate::connection::{Connection, ConnectionSource, Scoped};
use crate::error::{OrmError, OrmResult};
use crate::response::Response;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

impl<S: ConnectionSource> Client<S> {
    /// Run `callback` inside one database transaction.
    ///
    /// The callback gets a scoped client whose statements all run on the
    /// transaction's connection. `Ok` commits and becomes the response data;
    /// `Err` rolls back and becomes a TRANSACTION error wrapping the cause.
    ///
    /// ```ignore
    /// let resp = client
    ///     .transaction(|tx| async move {
    ///         tx.from("accounts").set("balance", 90).eq("id", 1).execute().await.into_result()?;
    ///         tx.from("accounts").set("balance", 110).eq("id", 2).execute().await.into_result()?;
    ///         Ok(())
    ///     })
    ///     .await;
    /// ```
    ///
    /// Savepoints are not supported: calling `transaction` on the scoped client
    /// fails with a validation error.
    pub async fn transaction<T, F, Fut>(&self, callback: F) -> Response<T>
    where
        F: FnOnce(Client<Scoped<S::Conn>>) -> Fut,
        Fut: Future<Output = OrmResult<T>>,
    {
        if self.in_transaction {
            return self.fail_transaction(OrmError::validation(
                "nested transactions are not supported",
            ));
        }

        let conn = match self.source.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                return self.fail_transaction(OrmError::transaction(
                    "failed to acquire a connection",
                    err,
                ));
            }
        };
        if let Err(err) = conn.begin().await {
            return self.fail_transaction(OrmError::transaction("BEGIN failed", err));
        }
        tracing::debug!(target: "pgchain", "transaction started");

        let conn = Arc::new(conn);
        let scoped = Client {
            source: Arc::new(Scoped::from_arc(Arc::clone(&conn))),
            config: Arc::clone(&self.config),
            hooks: self.hooks.clone(),
            in_transaction: true,
        };

        let outcome = match AssertUnwindSafe(callback(scoped)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                rollback_quietly(conn.as_ref()).await;
                std::panic::resume_unwind(panic);
            }
        };

        match outcome {
            Ok(value) => match conn.commit().await {
                Ok(()) => {
                    tracing::debug!(target: "pgchain", "transaction committed");
                    Response::ok(Some(value), None)
                }
                Err(err) => {
                    rollback_quietly(conn.as_ref()).await;
                    self.fail_transaction(OrmError::transaction("COMMIT failed", err))
                }
            },
            Err(err) => {
                rollback_quietly(conn.as_ref()).await;
                self.fail_transaction(OrmError::transaction("Transaction failed", err))
            }
        }
    }

    fn fail_transaction<T>(&self, err: OrmError) -> Response<T> {
        self.hooks.on_error("transaction", None, &err);
        Response::err(err)
    }
}

async fn rollback_quietly<C: Connection>(conn: &C) {
    match conn.rollback().await {
        Ok(()) => tracing::debug!(target: "pgchain", "transaction rolled back"),
        Err(err) => tracing::warn!(target: "pgchain", error = %err, "rollback failed"),
    }
}
