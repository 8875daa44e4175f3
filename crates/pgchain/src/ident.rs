//! Safe SQL identifier handling.
//!
//! [`Ident`] is the only way a table, schema, column, or function name can reach
//! statement text. It can only be built through validation:
//!
//! - first character: ASCII letter or `_`
//! - remaining characters: ASCII letters, digits, or `_`
//! - at most 63 bytes (PostgreSQL's `NAMEDATALEN - 1`)
//!
//! Identifiers always render double-quoted.
//!
//! # Example
//! ```ignore
//! use pgchain::{Ident, IdentKind};
//!
//! let t = Ident::new("users", IdentKind::Table)?;
//! assert_eq!(t.to_sql(), r#""users""#);
//! # Ok::<(), pgchain::OrmError>(())
//! ```

use crate::error::{OrmError, OrmResult};
use std::fmt;

/// Maximum identifier length accepted by PostgreSQL without truncation.
pub const MAX_IDENT_LEN: usize = 63;

/// What an identifier names, used in validation messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Table,
    Schema,
    Column,
    Function,
    /// Text search configuration (e.g. `english`).
    Config,
}

impl fmt::Display for IdentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentKind::Table => "table",
            IdentKind::Schema => "schema",
            IdentKind::Column => "column",
            IdentKind::Function => "function",
            IdentKind::Config => "text search config",
        })
    }
}

/// A validated SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    /// Validate `name` as an identifier of the given kind.
    pub fn new(name: &str, kind: IdentKind) -> OrmResult<Self> {
        validate_identifier(name, kind)?;
        Ok(Self(name.to_string()))
    }

    /// The raw (unquoted) name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Render the identifier as SQL.
    pub fn to_sql(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 2);
        self.write_sql(&mut out);
        out
    }

    pub(crate) fn write_sql(&self, out: &mut String) {
        // Validation rules out `"`, so no escaping is needed.
        out.push('"');
        out.push_str(&self.0);
        out.push('"');
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check `name` against the identifier grammar.
pub fn validate_identifier(name: &str, kind: IdentKind) -> OrmResult<()> {
    if name.is_empty() {
        return Err(OrmError::validation(format!("Invalid {kind} name: empty identifier")));
    }
    if name.len() > MAX_IDENT_LEN {
        return Err(OrmError::validation(format!(
            "Invalid {kind} name: identifier longer than {MAX_IDENT_LEN} characters"
        )));
    }

    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        if !(first == '_' || first.is_ascii_alphabetic()) {
            return Err(OrmError::validation(format!(
                "Invalid {kind} name '{name}': must start with a letter or underscore"
            )));
        }
    }
    if let Some(bad) = chars.find(|c| !(*c == '_' || c.is_ascii_alphanumeric())) {
        return Err(OrmError::validation(format!(
            "Invalid {kind} name '{name}': unexpected character '{bad}'"
        )));
    }
    Ok(())
}

/// A validated select/returning list: `*` or explicit columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnList {
    All,
    Columns(Vec<Ident>),
}

impl ColumnList {
    /// Parse `"*"` or a comma-separated list of column identifiers.
    pub fn parse(list: &str) -> OrmResult<Self> {
        let list = list.trim();
        if list == "*" {
            return Ok(Self::All);
        }
        if list.is_empty() {
            return Err(OrmError::validation("Column list cannot be empty"));
        }

        let columns = list
            .split(',')
            .map(|part| Ident::new(part.trim(), IdentKind::Column))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(Self::Columns(columns))
    }

    pub(crate) fn write_sql(&self, out: &mut String) {
        match self {
            ColumnList::All => out.push('*'),
            ColumnList::Columns(cols) => {
                for (i, col) in cols.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    col.write_sql(out);
                }
            }
        }
    }
}

impl Default for ColumnList {
    fn default() -> Self {
        Self::All
    }
}
