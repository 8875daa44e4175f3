//! Fire-and-forget query observers.
//!
//! Hooks see each statement before it is sent and each failure after it
//! happens. They run on a spawned task: the query path never waits for them,
//! and a hook that errors or panics is logged and otherwise ignored.
//!
//! Text values that look like credentials are replaced with [`REDACTED`]
//! before any hook sees them.

use crate::error::{OrmError, OrmResult};
use crate::value::Value;
use regex::Regex;
use std::borrow::Cow;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use tracing::Level;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// A statement about to be sent.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    /// Operation name (`select`, `insert`, `count`, ...).
    pub operation: &'static str,
    pub sql: String,
    /// Bound values, rendered as JSON, secrets redacted.
    pub params: Vec<serde_json::Value>,
}

/// A failed call.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub operation: &'static str,
    pub sql: Option<String>,
    pub error: OrmError,
}

/// Observer of statements and failures.
pub trait QueryHook: Send + Sync + 'static {
    fn before_query(&self, event: &QueryEvent) -> OrmResult<()> {
        let _ = event;
        Ok(())
    }

    fn on_error(&self, event: &ErrorEvent) -> OrmResult<()> {
        let _ = event;
        Ok(())
    }
}

/// The hooks registered on a client.
#[derive(Clone, Default)]
pub struct Hooks {
    hooks: Vec<Arc<dyn QueryHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("len", &self.hooks.len()).finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn QueryHook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub(crate) fn before_query(&self, operation: &'static str, sql: &str, params: &[Value]) {
        if self.hooks.is_empty() {
            return;
        }
        let event = QueryEvent {
            operation,
            sql: sql.to_string(),
            params: params.iter().map(|v| redact_json(v.to_json())).collect(),
        };
        self.dispatch(move |hook| hook.before_query(&event));
    }

    pub(crate) fn on_error(&self, operation: &'static str, sql: Option<&str>, error: &OrmError) {
        if self.hooks.is_empty() {
            return;
        }
        let event = ErrorEvent {
            operation,
            sql: sql.map(str::to_string),
            error: error.clone(),
        };
        self.dispatch(move |hook| hook.on_error(&event));
    }

    fn dispatch<F>(&self, call: F)
    where
        F: Fn(&dyn QueryHook) -> OrmResult<()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(target: "pgchain", "no tokio runtime; hook event dropped");
            return;
        };
        let hooks = self.hooks.clone();
        handle.spawn(async move {
            for hook in hooks {
                match catch_unwind(AssertUnwindSafe(|| call(hook.as_ref()))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let err = OrmError::hook(err.to_string());
                        tracing::warn!(target: "pgchain", error = %err, "query hook failed");
                    }
                    Err(_) => {
                        let err = OrmError::hook("hook panicked");
                        tracing::warn!(target: "pgchain", error = %err, "query hook failed");
                    }
                }
            }
        });
    }
}

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // JWT: three base64url segments, header starts with `{"`
            r"\beyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*",
            r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]{8,}",
            r"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|private[_-]?key)\s*[=:]",
            // Long opaque tokens: hex or base64 with no spaces
            r"^[A-Fa-f0-9]{32,}$",
            r"^[A-Za-z0-9+/_-]{40,}={0,2}$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid built-in redaction regex"))
        .collect()
    })
}

/// Whether `text` looks like a credential.
pub fn looks_secret(text: &str) -> bool {
    secret_patterns().iter().any(|re| re.is_match(text))
}

/// Redact secret-looking strings anywhere inside a JSON value.
pub fn redact_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if looks_secret(&s) => {
            serde_json::Value::String(REDACTED.to_string())
        }
        serde_json::Value::Array(items) => items.into_iter().map(redact_json).collect(),
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, redact_json(v)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
        other => other,
    }
}

/// Cut `sql` to at most `budget` bytes on a char boundary, noting the full size.
fn clip_sql(sql: &str, budget: Option<usize>) -> Cow<'_, str> {
    let Some(budget) = budget.filter(|b| sql.len() > *b) else {
        return Cow::Borrowed(sql);
    };
    let mut end = budget;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}... [{} bytes]", &sql[..end], sql.len()))
}

/// Logs statements and failures through `tracing` under target `pgchain.sql`.
///
/// Statements go out at the configured level; failures always at `warn`.
/// Parameters are already redacted when they reach a hook, and are only
/// logged when [`TracingHook::with_params`] is set.
#[derive(Debug, Clone)]
pub struct TracingHook {
    level: Level,
    sql_budget: Option<usize>,
    log_params: bool,
    skip_counts: bool,
}

impl Default for TracingHook {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
            sql_budget: Some(512),
            log_params: false,
            skip_counts: false,
        }
    }
}

impl TracingHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level for statement events.
    pub fn at(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Byte budget for logged SQL; `None` logs every statement whole.
    pub fn sql_budget(mut self, budget: Option<usize>) -> Self {
        self.sql_budget = budget;
        self
    }

    pub fn with_params(mut self, log_params: bool) -> Self {
        self.log_params = log_params;
        self
    }

    /// Don't log the follow-up `count` statement of counted calls.
    pub fn skip_counts(mut self) -> Self {
        self.skip_counts = true;
        self
    }
}

impl QueryHook for TracingHook {
    fn before_query(&self, event: &QueryEvent) -> OrmResult<()> {
        macro_rules! emit_at_level {
            ($level:expr, $($field:tt)*) => {
                match $level {
                    Level::ERROR => tracing::error!($($field)*),
                    Level::WARN  => tracing::warn!($($field)*),
                    Level::INFO  => tracing::info!($($field)*),
                    Level::DEBUG => tracing::debug!($($field)*),
                    Level::TRACE => tracing::trace!($($field)*),
                }
            };
        }

        if self.skip_counts && event.operation == "count" {
            return Ok(());
        }
        let sql = clip_sql(&event.sql, self.sql_budget);
        if self.log_params {
            emit_at_level!(
                self.level,
                target: "pgchain.sql",
                operation = event.operation,
                sql = %sql,
                params = ?event.params,
            );
        } else {
            emit_at_level!(
                self.level,
                target: "pgchain.sql",
                operation = event.operation,
                sql = %sql,
                param_count = event.params.len(),
            );
        }
        Ok(())
    }

    fn on_error(&self, event: &ErrorEvent) -> OrmResult<()> {
        let sql = event.sql.as_deref().map(|s| clip_sql(s, self.sql_budget));
        tracing::warn!(
            target: "pgchain.sql",
            operation = event.operation,
            code = event.error.code().as_str(),
            status = event.error.status().unwrap_or("-"),
            sql = sql.as_deref().unwrap_or("-"),
            error = %event.error,
            "call failed"
        );
        Ok(())
    }
}
