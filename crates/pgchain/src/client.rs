//! Entry point: a connection source plus client-wide settings.

use crate::builder::QueryBuilder;
use crate::config::ClientConfig;
use crate::connection::ConnectionSource;
use crate::engine::Executor;
use crate::error::OrmResult;
use crate::hooks::{Hooks, QueryHook};
use crate::state::BuilderState;
use crate::value::Value;
use std::sync::Arc;

/// Query client over a [`ConnectionSource`].
///
/// ```ignore
/// let pool = pgchain::create_pool(&std::env::var("DATABASE_URL")?)?;
/// let client = pgchain::Client::new(pool).with_hook(pgchain::TracingHook::new());
///
/// let resp = client.from("users").eq("id", 1).single().execute().await;
/// let user = resp.into_result()?;
/// ```
///
/// Cloning is cheap; clones share the source, settings, and hooks.
pub struct Client<S> {
    pub(crate) source: Arc<S>,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) hooks: Hooks,
    /// Set on the scoped client handed to a transaction callback.
    pub(crate) in_transaction: bool,
}

impl<S> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: Arc::clone(&self.config),
            hooks: self.hooks.clone(),
            in_transaction: self.in_transaction,
        }
    }
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> Client<S> {
    /// Client with default settings.
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            config: Arc::new(ClientConfig::default()),
            hooks: Hooks::new(),
            in_transaction: false,
        }
    }

    /// Client with validated settings.
    pub fn with_config(source: S, config: ClientConfig) -> OrmResult<Self> {
        config.validate()?;
        Ok(Self {
            source: Arc::new(source),
            config: Arc::new(config),
            hooks: Hooks::new(),
            in_transaction: false,
        })
    }

    /// Register an observer.
    pub fn with_hook(mut self, hook: impl QueryHook) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Whether this is the scoped client of a running transaction.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Start a builder on `table` in the default schema.
    pub fn from(&self, table: &str) -> QueryBuilder<'_, S> {
        QueryBuilder::new(self, BuilderState::new(&self.config.schema, table))
    }

    /// Start a call to `function` with positional `args`.
    pub fn rpc(&self, function: &str, args: Vec<Value>) -> QueryBuilder<'_, S> {
        QueryBuilder::new(self, BuilderState::rpc(&self.config.schema, function, args))
    }

    /// Release the source's connections.
    ///
    /// No-op on a transaction's scoped client; the coordinator owns that
    /// connection.
    pub fn close(&self) {
        if self.in_transaction {
            return;
        }
        self.source.close();
    }

    pub(crate) fn executor(&self) -> Executor<'_, S> {
        Executor {
            source: &self.source,
            config: &self.config,
            hooks: &self.hooks,
            in_transaction: self.in_transaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::testing::FakeSource;

    #[test]
    fn with_config_validates() {
        let bad = ClientConfig::default().with_schema("my schema");
        assert!(Client::with_config(FakeSource::new(), bad).is_err());

        let bad = ClientConfig::default().with_retry(RetryPolicy::new(0, Default::default()));
        assert!(Client::with_config(FakeSource::new(), bad).is_err());

        let ok = ClientConfig::default().with_schema("app");
        let client = Client::with_config(FakeSource::new(), ok).unwrap();
        assert_eq!(client.config().schema, "app");
    }

    #[test]
    fn builders_use_default_schema() {
        let config = ClientConfig::default().with_schema("app");
        let client = Client::with_config(FakeSource::new(), config).unwrap();
        let stmt = client.from("users").to_statement().unwrap();
        assert_eq!(stmt.text(), r#"SELECT * FROM "app"."users""#);

        let stmt = client
            .rpc("search", vec![Value::from("x")])
            .to_statement()
            .unwrap();
        assert_eq!(stmt.text(), r#"SELECT * FROM "app"."search"($1)"#);
    }

    #[test]
    fn clones_share_the_source() {
        let client = Client::new(FakeSource::new());
        let clone = client.clone();
        assert!(Arc::ptr_eq(&client.source, &clone.source));
    }
}
