//! Accumulated description of one logical query.

use crate::error::OrmError;
use crate::filter::FilterClause;
use crate::ident::Ident;
use crate::value::Value;
use tokio_util::sync::CancellationToken;

/// The single statement kind a builder produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Select {
        columns: String,
    },
    /// `payload` is a JSON object (one row) or an array of objects.
    Insert {
        payload: serde_json::Value,
    },
    Upsert {
        payload: serde_json::Value,
        on_conflict: Vec<String>,
        ignore_duplicates: bool,
    },
    Update {
        set: Vec<(String, Value)>,
    },
    Delete,
    Rpc {
        function: String,
        args: Vec<Value>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Select { .. } => "select",
            Operation::Insert { .. } => "insert",
            Operation::Upsert { .. } => "upsert",
            Operation::Update { .. } => "update",
            Operation::Delete => "delete",
            Operation::Rpc { .. } => "rpc",
        }
    }

    /// Whether the statement changes rows.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Insert { .. }
                | Operation::Upsert { .. }
                | Operation::Update { .. }
                | Operation::Delete
        )
    }

    /// Whether the statement produces a result set the way a query does.
    pub fn is_query(&self) -> bool {
        matches!(self, Operation::Select { .. } | Operation::Rpc { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullsOrder {
    /// Server default (`NULLS LAST` for ASC, `NULLS FIRST` for DESC).
    #[default]
    Default,
    First,
    Last,
}

/// Options for one ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Order {
    pub direction: Direction,
    pub nulls: NullsOrder,
}

impl Order {
    pub fn asc() -> Self {
        Self::default()
    }

    pub fn desc() -> Self {
        Self {
            direction: Direction::Desc,
            nulls: NullsOrder::Default,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = NullsOrder::First;
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = NullsOrder::Last;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSpec {
    pub column: Ident,
    pub order: Order,
}

/// How many rows the caller expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowShape {
    #[default]
    Many,
    /// Exactly one row.
    Single,
    /// Zero or one row.
    MaybeSingle,
}

/// Row-count strategy for `count(..)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMode {
    /// `COUNT(*)` over the filtered relation.
    Exact,
    /// The planner's row estimate (`EXPLAIN`).
    Planned,
    /// Same source as `Planned`; kept distinct for callers that name it.
    Estimated,
}

/// Everything a builder has recorded for one statement.
#[derive(Debug, Clone)]
pub struct BuilderState {
    pub table: String,
    pub schema: String,
    pub operation: Operation,
    pub filters: Vec<FilterClause>,
    pub order: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub shape: RowShape,
    /// Column list for `RETURNING`; `None` returns nothing.
    pub returning: Option<String>,
    pub count: Option<CountMode>,
    pub cancel: Option<CancellationToken>,
    /// First validation failure seen while recording calls.
    pub error: Option<OrmError>,
}

impl BuilderState {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: schema.into(),
            operation: Operation::Select {
                columns: "*".to_string(),
            },
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            shape: RowShape::Many,
            returning: None,
            count: None,
            cancel: None,
            error: None,
        }
    }

    /// A state for calling a set-returning or scalar function.
    pub fn rpc(schema: impl Into<String>, function: impl Into<String>, args: Vec<Value>) -> Self {
        let function = function.into();
        let mut state = Self::new(schema, function.clone());
        state.operation = Operation::Rpc { function, args };
        state
    }

    /// Keep the first error only.
    pub(crate) fn record_error(&mut self, err: OrmError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}
