//! Client configuration: resource ceilings, retry policy and default schema.
//!
//! Every type here has `with_*` builders and deserializes with defaults, so a
//! config section can omit any field. Durations are written in milliseconds.

use crate::error::{OrmError, OrmResult};
use crate::ident::{Ident, IdentKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on IN-list length.
pub const DEFAULT_MAX_IN_ELEMENTS: usize = 1000;
/// PostgreSQL's bind-parameter ceiling per statement.
pub const DEFAULT_MAX_TOTAL_PARAMS: usize = 65535;
/// Default base delay between retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Resource ceilings applied when compiling and running statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyOptions {
    /// Maximum number of elements in one IN / NOT IN list.
    pub max_in_elements: usize,
    /// Maximum rows x columns for one bulk insert or upsert.
    pub max_total_params: usize,
    /// Per-statement timeout. `None` leaves the server default in place.
    #[serde(rename = "statement_timeout_ms", with = "opt_millis")]
    pub statement_timeout: Option<Duration>,
}

impl Default for SafetyOptions {
    fn default() -> Self {
        Self {
            max_in_elements: DEFAULT_MAX_IN_ELEMENTS,
            max_total_params: DEFAULT_MAX_TOTAL_PARAMS,
            statement_timeout: None,
        }
    }
}

impl SafetyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_in_elements(mut self, max: usize) -> Self {
        self.max_in_elements = max;
        self
    }

    pub fn with_max_total_params(mut self, max: usize) -> Self {
        self.max_total_params = max;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Retry behaviour for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retry.
    pub attempts: u32,
    /// Delay before the first retry; doubles for each later retry.
    #[serde(rename = "backoff_ms", with = "millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// No retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Delay before retry number `retry` (1-based): `backoff * 2^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor)
    }
}

/// Client-wide settings.
///
/// Can be deserialized from application config; durations are given in
/// milliseconds:
///
/// ```ignore
/// let config: ClientConfig = serde_json::from_str(r#"{
///     "schema": "app",
///     "safety": { "max_in_elements": 500, "statement_timeout_ms": 5000 },
///     "retry": { "attempts": 3, "backoff_ms": 50 }
/// }"#)?;
/// config.validate()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Schema used when a query names none.
    pub schema: String,
    pub safety: SafetyOptions,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            safety: SafetyOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_safety(mut self, safety: SafetyOptions) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.safety.statement_timeout = Some(timeout);
        self
    }

    /// Reject settings that would make every call fail.
    pub fn validate(&self) -> OrmResult<()> {
        Ident::new(&self.schema, IdentKind::Schema)?;
        if self.safety.max_in_elements == 0 {
            return Err(OrmError::validation("max_in_elements must be at least 1"));
        }
        if self.safety.max_total_params == 0 {
            return Err(OrmError::validation("max_total_params must be at least 1"));
        }
        if self.retry.attempts == 0 {
            return Err(OrmError::validation("retry attempts must be at least 1"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|ms| ms.map(Duration::from_millis))
    }
}
