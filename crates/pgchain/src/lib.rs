//! # pgchain
//!
//! A fluent, injection-safe PostgreSQL query builder with retrying,
//! cancellable execution.
//!
//! ## Features
//!
//! - **Chainable builder**: `from(table)` then filters, ordering, paging and
//!   one of select / insert / upsert / update / delete, or `rpc(function)`
//! - **Injection-safe**: every identifier is validated and quoted, every value
//!   is a bound `$n` parameter
//! - **Uniform responses**: every call resolves to `Response { data, error, count }`
//! - **Transient-failure retry**: serialization failures, deadlocks and dropped
//!   connections back off and retry
//! - **Cancellation**: attach a `CancellationToken` with `abort_signal()`
//! - **Transactions**: `client.transaction(|tx| async move { .. })`
//! - **Streaming**: `stream()` yields rows as they arrive
//! - **Hooks**: observe statements and failures; secrets are redacted
//!
//! ## Example
//!
//! ```ignore
//! use pgchain::{Client, CountMode, Order, create_pool};
//!
//! let client = Client::new(create_pool(&std::env::var("DATABASE_URL")?)?);
//!
//! // SELECT
//! let resp = client
//!     .from("users")
//!     .select("id, name")
//!     .eq("status", "active")
//!     .order("created_at", Order::desc())
//!     .range(0, 9)
//!     .count(CountMode::Exact)
//!     .execute()
//!     .await;
//!
//! // INSERT ... RETURNING
//! let created = client
//!     .from("users")
//!     .insert(serde_json::json!({ "name": "alice" }))
//!     .select("id")
//!     .single()
//!     .execute()
//!     .await
//!     .into_result()?;
//!
//! // UPDATE
//! client.from("users").set("status", "inactive").eq("id", 7).execute().await;
//!
//! // DELETE
//! client.from("sessions").lt("expires_at", chrono::Utc::now()).delete().execute().await;
//! ```

pub mod builder;
pub mod client;
pub mod compile;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod hooks;
pub mod ident;
pub mod pg;
pub mod response;
pub mod row;
pub mod state;
pub mod stream;
pub mod transaction;
pub mod validate;
pub mod value;

#[cfg(feature = "pool")]
pub mod pool;

mod engine;
mod lease;

#[cfg(test)]
mod testing;

pub use builder::QueryBuilder;
pub use client::Client;
pub use compile::{CompiledStatement, compile, compile_count, parse_plan_rows};
pub use config::{ClientConfig, RetryPolicy, SafetyOptions};
pub use connection::{Connection, ConnectionSource, RowStream, Scoped};
pub use error::{ErrorCode, OrmError, OrmResult, is_retriable_error};
pub use filter::{AnyOf, CompareOp, TextSearchMode};
pub use hooks::{ErrorEvent, QueryEvent, QueryHook, TracingHook};
pub use ident::{Ident, IdentKind, validate_identifier};
pub use response::Response;
pub use row::{Row, row_to_json};
pub use state::{BuilderState, CountMode, Operation, Order, RowShape};
pub use stream::QueryStream;
pub use value::Value;

#[cfg(feature = "pool")]
pub use pool::{
    PoolSettings, create_pool, create_pool_from_parts, create_pool_with_config,
    create_pool_with_manager_config, create_pool_with_tls,
};

pub use tokio_util::sync::CancellationToken;
