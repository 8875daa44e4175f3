//! WHERE predicates.
//!
//! Every [`FilterClause`] carries validated column names; constructors fail with
//! a validation error before the clause can be recorded.

use crate::error::{OrmError, OrmResult};
use crate::ident::{Ident, IdentKind};
use crate::value::Value;

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOp {
    Like,
    ILike,
}

impl PatternOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            PatternOp::Like => "LIKE",
            PatternOp::ILike => "ILIKE",
        }
    }
}

/// Array/range/JSON containment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainOp {
    /// `@>`
    Contains,
    /// `<@`
    ContainedBy,
    /// `&&`
    Overlaps,
}

impl ContainOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ContainOp::Contains => "@>",
            ContainOp::ContainedBy => "<@",
            ContainOp::Overlaps => "&&",
        }
    }
}

/// How a full-text query string is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextSearchMode {
    /// `to_tsquery`: the query uses tsquery syntax (`a & b`).
    #[default]
    Default,
    /// `plainto_tsquery`
    Plain,
    /// `phraseto_tsquery`
    Phrase,
    /// `websearch_to_tsquery`
    Websearch,
}

impl TextSearchMode {
    pub fn function(&self) -> &'static str {
        match self {
            TextSearchMode::Default => "to_tsquery",
            TextSearchMode::Plain => "plainto_tsquery",
            TextSearchMode::Phrase => "phraseto_tsquery",
            TextSearchMode::Websearch => "websearch_to_tsquery",
        }
    }
}

/// `"column" OP value`
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: Ident,
    pub op: CompareOp,
    pub value: Value,
}

impl Comparison {
    pub fn new(column: &str, op: CompareOp, value: impl Into<Value>) -> OrmResult<Self> {
        Ok(Self {
            column: Ident::new(column, IdentKind::Column)?,
            op,
            value: value.into(),
        })
    }
}

/// One WHERE-contributing predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Compare(Comparison),
    Pattern {
        column: Ident,
        op: PatternOp,
        pattern: Value,
    },
    /// `IS NULL` / `IS TRUE` / `IS FALSE`; the value is null or a bool.
    Is { column: Ident, value: Value },
    In {
        column: Ident,
        values: Vec<Value>,
        negated: bool,
    },
    IsDistinct { column: Ident, value: Value },
    Contain {
        column: Ident,
        op: ContainOp,
        value: Value,
    },
    Not(Comparison),
    TextSearch {
        column: Ident,
        query: Value,
        config: Option<Ident>,
        mode: TextSearchMode,
    },
    /// AND of equalities, one per key.
    Match(Vec<(Ident, Value)>),
    /// OR of comparisons, one per entry.
    Or(Vec<Comparison>),
}

impl FilterClause {
    pub fn compare(column: &str, op: CompareOp, value: impl Into<Value>) -> OrmResult<Self> {
        Comparison::new(column, op, value).map(Self::Compare)
    }

    pub fn pattern(column: &str, op: PatternOp, pattern: impl Into<String>) -> OrmResult<Self> {
        Ok(Self::Pattern {
            column: Ident::new(column, IdentKind::Column)?,
            op,
            pattern: Value::Text(pattern.into()),
        })
    }

    pub fn is(column: &str, value: impl Into<Value>) -> OrmResult<Self> {
        let value = value.into();
        if !matches!(value, Value::Null | Value::Bool(_)) {
            return Err(OrmError::validation(format!(
                "is() on column '{column}' accepts only null, true, or false"
            )));
        }
        Ok(Self::Is {
            column: Ident::new(column, IdentKind::Column)?,
            value,
        })
    }

    pub fn in_list<V: Into<Value>>(
        column: &str,
        values: impl IntoIterator<Item = V>,
        negated: bool,
    ) -> OrmResult<Self> {
        Ok(Self::In {
            column: Ident::new(column, IdentKind::Column)?,
            values: values.into_iter().map(Into::into).collect(),
            negated,
        })
    }

    pub fn is_distinct(column: &str, value: impl Into<Value>) -> OrmResult<Self> {
        Ok(Self::IsDistinct {
            column: Ident::new(column, IdentKind::Column)?,
            value: value.into(),
        })
    }

    pub fn contain(column: &str, op: ContainOp, value: impl Into<Value>) -> OrmResult<Self> {
        Ok(Self::Contain {
            column: Ident::new(column, IdentKind::Column)?,
            op,
            value: value.into(),
        })
    }

    pub fn not(column: &str, op: CompareOp, value: impl Into<Value>) -> OrmResult<Self> {
        Comparison::new(column, op, value).map(Self::Not)
    }

    pub fn text_search(
        column: &str,
        query: impl Into<String>,
        config: Option<&str>,
        mode: TextSearchMode,
    ) -> OrmResult<Self> {
        Ok(Self::TextSearch {
            column: Ident::new(column, IdentKind::Column)?,
            query: Value::Text(query.into()),
            config: config.map(|c| Ident::new(c, IdentKind::Config)).transpose()?,
            mode,
        })
    }

    pub fn match_record<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> OrmResult<Self>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        let pairs = pairs
            .into_iter()
            .map(|(k, v)| Ok((Ident::new(k.as_ref(), IdentKind::Column)?, v.into())))
            .collect::<OrmResult<Vec<_>>>()?;
        if pairs.is_empty() {
            return Err(OrmError::validation("match() requires at least one column"));
        }
        Ok(Self::Match(pairs))
    }

    pub fn or(entries: Vec<Comparison>) -> OrmResult<Self> {
        if entries.is_empty() {
            return Err(OrmError::validation("or() requires at least one condition"));
        }
        Ok(Self::Or(entries))
    }

    /// Number of values this clause binds.
    pub fn value_count(&self) -> usize {
        match self {
            FilterClause::In { values, .. } => values.len(),
            FilterClause::Match(pairs) => pairs.len(),
            FilterClause::Or(entries) => entries.len(),
            _ => 1,
        }
    }
}

/// Collects the branches of an `or(..)` filter.
///
/// ```ignore
/// builder.or(|any| any.eq("status", "active").gt("score", 90))
/// ```
#[derive(Debug, Default)]
pub struct AnyOf {
    entries: Vec<Comparison>,
    error: Option<OrmError>,
}

impl AnyOf {
    fn push(mut self, column: &str, op: CompareOp, value: Value) -> Self {
        if self.error.is_none() {
            match Comparison::new(column, op, value) {
                Ok(entry) => self.entries.push(entry),
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Eq, value.into())
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Neq, value.into())
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Gt, value.into())
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Gte, value.into())
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Lt, value.into())
    }

    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, CompareOp::Lte, value.into())
    }

    pub(crate) fn finish(self) -> OrmResult<FilterClause> {
        match self.error {
            Some(e) => Err(e),
            None => FilterClause::or(self.entries),
        }
    }
}
