//! Statement compiler: [`BuilderState`] to parameterized SQL.
//!
//! Compilation is pure. The same state always produces the same text and
//! values, and every failure is a validation error raised before any I/O.
//!
//! Placeholders come from a single counter shared by every part of the
//! statement (SET, VALUES, WHERE, the implicit LIMIT), so `$1..$n` is always
//! contiguous and `values.len() == n`.

use crate::config::SafetyOptions;
use crate::error::{OrmError, OrmResult};
use crate::filter::{Comparison, FilterClause};
use crate::ident::{ColumnList, Ident, IdentKind};
use crate::state::{BuilderState, CountMode, Direction, NullsOrder, Operation, RowShape};
use crate::value::Value;
use std::fmt::Write;
use tokio_postgres::types::ToSql;


/// Parameterized SQL text plus its ordered bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    text: String,
    values: Vec<Value>,
}

impl CompiledStatement {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Parameters as references compatible with tokio-postgres.
    pub fn params_ref(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.text, self.values)
    }
}

/// SQL text under construction with its bound values.
#[derive(Debug, Default)]
struct SqlWriter {
    sql: String,
    values: Vec<Value>,
}

impl SqlWriter {
    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn push_ident(&mut self, ident: &Ident) -> &mut Self {
        ident.write_sql(&mut self.sql);
        self
    }

    /// Append the next placeholder and bind `value` to it.
    fn push_bind(&mut self, value: Value) -> &mut Self {
        self.values.push(value);
        let _ = write!(self.sql, "${}", self.values.len());
        self
    }

    fn push_table(&mut self, schema: &Ident, table: &Ident) -> &mut Self {
        self.push_ident(schema).push(".").push_ident(table)
    }

    fn finish(self) -> CompiledStatement {
        CompiledStatement {
            text: self.sql,
            values: self.values,
        }
    }
}

/// Compile the primary statement for `state`.
pub fn compile(state: &BuilderState, safety: &SafetyOptions) -> OrmResult<CompiledStatement> {
    if let Some(err) = &state.error {
        return Err(err.clone());
    }
    check_clauses(state)?;

    let schema = Ident::new(&state.schema, IdentKind::Schema)?;
    let mut w = SqlWriter::default();

    match &state.operation {
        Operation::Select { columns } => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            let columns = ColumnList::parse(columns)?;
            w.push("SELECT ");
            columns.write_sql(&mut w.sql);
            w.push(" FROM ").push_table(&schema, &table);
            write_where(&mut w, &state.filters, safety)?;
            write_tail(&mut w, state);
        }
        Operation::Rpc { function, args } => {
            write_rpc_source(&mut w, &schema, function, args)?;
            write_tail(&mut w, state);
        }
        Operation::Insert { payload } => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            write_insert(&mut w, &schema, &table, payload, safety, "Insert")?;
            write_returning(&mut w, state)?;
        }
        Operation::Upsert {
            payload,
            on_conflict,
            ignore_duplicates,
        } => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            let columns = write_insert(&mut w, &schema, &table, payload, safety, "Upsert")?;
            write_on_conflict(&mut w, &columns, on_conflict, *ignore_duplicates)?;
            write_returning(&mut w, state)?;
        }
        Operation::Update { set } => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            if set.is_empty() {
                return Err(OrmError::validation("Update requires at least one column to set"));
            }
            w.push("UPDATE ").push_table(&schema, &table).push(" SET ");
            for (i, (column, value)) in set.iter().enumerate() {
                let column = Ident::new(column, IdentKind::Column)?;
                if i > 0 {
                    w.push(", ");
                }
                w.push_ident(&column).push(" = ").push_bind(value.clone());
            }
            write_where(&mut w, &state.filters, safety)?;
            write_returning(&mut w, state)?;
        }
        Operation::Delete => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            w.push("DELETE FROM ").push_table(&schema, &table);
            write_where(&mut w, &state.filters, safety)?;
            write_returning(&mut w, state)?;
        }
    }

    Ok(w.finish())
}

/// Compile the row-count query that accompanies a select or rpc.
///
/// Exact mode counts the filtered relation. Planned and estimated modes ask the
/// planner instead; parse the single result value with [`parse_plan_rows`].
/// Mutations report affected rows directly and have no count query.
pub fn compile_count(
    state: &BuilderState,
    safety: &SafetyOptions,
    mode: CountMode,
) -> OrmResult<CompiledStatement> {
    if let Some(err) = &state.error {
        return Err(err.clone());
    }

    let schema = Ident::new(&state.schema, IdentKind::Schema)?;
    let mut w = SqlWriter::default();
    let exact = matches!(mode, CountMode::Exact);

    if exact {
        w.push(r#"SELECT COUNT(*) AS "count" FROM "#);
    } else {
        w.push("EXPLAIN (FORMAT JSON) SELECT * FROM ");
    }

    match &state.operation {
        Operation::Select { .. } => {
            let table = Ident::new(&state.table, IdentKind::Table)?;
            w.push_table(&schema, &table);
        }
        Operation::Rpc { function, args } => {
            let function = Ident::new(function, IdentKind::Function)?;
            w.push_table(&schema, &function).push("(");
            write_args(&mut w, args);
            w.push(")");
        }
        other => {
            return Err(OrmError::validation(format!(
                "Count queries apply to select and rpc, not {}",
                other.name()
            )));
        }
    }

    write_where(&mut w, &state.filters, safety)?;
    Ok(w.finish())
}

/// Extract the planner's row estimate from `EXPLAIN (FORMAT JSON)` output.
///
/// Accepts the plan either as JSON or as its text form. Returns `None` when the
/// output does not have the expected shape.
pub fn parse_plan_rows(plan: &serde_json::Value) -> Option<i64> {
    if let serde_json::Value::String(text) = plan {
        let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
        return parse_plan_rows(&parsed);
    }
    let rows = plan.get(0)?.get("Plan")?.get("Plan Rows")?.as_f64()?;
    rows.is_finite().then(|| rows.round() as i64)
}

fn check_clauses(state: &BuilderState) -> OrmResult<()> {
    let op = state.operation.name();
    let is_write = state.operation.is_mutation();

    if matches!(state.operation, Operation::Insert { .. } | Operation::Upsert { .. })
        && !state.filters.is_empty()
    {
        return Err(OrmError::validation(format!("Filters are not supported on {op}")));
    }
    if is_write && (!state.order.is_empty() || state.limit.is_some() || state.offset.is_some()) {
        return Err(OrmError::validation(format!(
            "order, limit, and range apply to select and rpc, not {op}"
        )));
    }
    if !is_write && state.returning.is_some() {
        return Err(OrmError::validation(format!(
            "returning() applies to insert, upsert, update, and delete, not {op}"
        )));
    }
    Ok(())
}

fn write_rpc_source(
    w: &mut SqlWriter,
    schema: &Ident,
    function: &str,
    args: &[Value],
) -> OrmResult<()> {
    let function = Ident::new(function, IdentKind::Function)?;
    w.push("SELECT * FROM ").push_table(schema, &function).push("(");
    write_args(w, args);
    w.push(")");
    Ok(())
}

fn write_args(w: &mut SqlWriter, args: &[Value]) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push_bind(arg.clone());
    }
}

/// ORDER BY, then LIMIT/OFFSET.
fn write_tail(w: &mut SqlWriter, state: &BuilderState) {
    if !state.order.is_empty() {
        w.push(" ORDER BY ");
        for (i, spec) in state.order.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push_ident(&spec.column);
            w.push(match spec.order.direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
            match spec.order.nulls {
                NullsOrder::Default => {}
                NullsOrder::First => {
                    w.push(" NULLS FIRST");
                }
                NullsOrder::Last => {
                    w.push(" NULLS LAST");
                }
            }
        }
    }

    match state.limit {
        Some(limit) => {
            let _ = write!(w.sql, " LIMIT {limit}");
        }
        None if state.shape != RowShape::Many => {
            w.push(" LIMIT ").push_bind(Value::Int(1));
        }
        None => {}
    }
    if let Some(offset) = state.offset {
        let _ = write!(w.sql, " OFFSET {offset}");
    }
}

fn write_returning(w: &mut SqlWriter, state: &BuilderState) -> OrmResult<()> {
    if let Some(spec) = &state.returning {
        let columns = ColumnList::parse(spec)?;
        w.push(" RETURNING ");
        columns.write_sql(&mut w.sql);
    }
    Ok(())
}

/// Normalize an object-or-array payload into rows sharing the first row's columns.
fn normalize_rows(
    payload: &serde_json::Value,
    what: &str,
) -> OrmResult<(Vec<String>, Vec<Vec<Value>>)> {
    let objects: Vec<&serde_json::Map<String, serde_json::Value>> = match payload {
        serde_json::Value::Object(map) => vec![map],
        serde_json::Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                item.as_object().ok_or_else(|| {
                    OrmError::validation(format!("{what} row {i} is not an object"))
                })
            })
            .collect::<OrmResult<_>>()?,
        _ => {
            return Err(OrmError::validation(format!(
                "{what} payload must be an object or an array of objects"
            )));
        }
    };

    let Some(first) = objects.first() else {
        return Err(OrmError::validation(format!("{what} requires at least one row")));
    };
    let columns: Vec<String> = first.keys().cloned().collect();
    if columns.is_empty() {
        return Err(OrmError::validation(format!("{what} row has no columns")));
    }

    let mut rows = Vec::with_capacity(objects.len());
    for (i, object) in objects.iter().enumerate() {
        if let Some(extra) = object.keys().find(|k| !first.contains_key(*k)) {
            return Err(OrmError::validation(format!(
                "{what} row {i} has column '{extra}' not present in the first row"
            )));
        }
        let row = columns
            .iter()
            .map(|c| object.get(c).cloned().map(Value::from_json).unwrap_or(Value::Null))
            .collect();
        rows.push(row);
    }
    Ok((columns, rows))
}

/// `INSERT INTO .. (cols) VALUES (..), (..)`; returns the validated columns.
fn write_insert(
    w: &mut SqlWriter,
    schema: &Ident,
    table: &Ident,
    payload: &serde_json::Value,
    safety: &SafetyOptions,
    what: &str,
) -> OrmResult<Vec<Ident>> {
    let (names, rows) = normalize_rows(payload, what)?;
    let columns = names
        .iter()
        .map(|c| Ident::new(c, IdentKind::Column))
        .collect::<OrmResult<Vec<_>>>()?;

    let total = rows.len().saturating_mul(columns.len());
    if total > safety.max_total_params {
        return Err(OrmError::validation(format!(
            "{what} too large: {} rows x {} columns = {total} parameters exceeds max_total_params ({})",
            rows.len(),
            columns.len(),
            safety.max_total_params
        )));
    }

    w.push("INSERT INTO ").push_table(schema, table).push(" (");
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push_ident(column);
    }
    w.push(") VALUES ");
    for (r, row) in rows.into_iter().enumerate() {
        if r > 0 {
            w.push(", ");
        }
        w.push("(");
        for (i, value) in row.into_iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push_bind(value);
        }
        w.push(")");
    }
    Ok(columns)
}

fn write_on_conflict(
    w: &mut SqlWriter,
    columns: &[Ident],
    on_conflict: &[String],
    ignore_duplicates: bool,
) -> OrmResult<()> {
    let target = on_conflict
        .iter()
        .map(|c| Ident::new(c.trim(), IdentKind::Column))
        .collect::<OrmResult<Vec<_>>>()?;

    if target.is_empty() {
        if ignore_duplicates {
            w.push(" ON CONFLICT DO NOTHING");
            return Ok(());
        }
        return Err(OrmError::validation(
            "Upsert with updates requires at least one conflict column",
        ));
    }

    w.push(" ON CONFLICT (");
    for (i, column) in target.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push_ident(column);
    }
    w.push(")");

    let updates: Vec<&Ident> = columns.iter().filter(|c| !target.contains(c)).collect();
    if ignore_duplicates || updates.is_empty() {
        w.push(" DO NOTHING");
        return Ok(());
    }

    w.push(" DO UPDATE SET ");
    for (i, column) in updates.into_iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push_ident(column).push(" = EXCLUDED.").push_ident(column);
    }
    Ok(())
}

fn write_where(
    w: &mut SqlWriter,
    filters: &[FilterClause],
    safety: &SafetyOptions,
) -> OrmResult<()> {
    for (i, clause) in filters.iter().enumerate() {
        w.push(if i == 0 { " WHERE " } else { " AND " });
        write_clause(w, clause, safety)?;
    }
    Ok(())
}

fn write_comparison(w: &mut SqlWriter, c: &Comparison) {
    w.push_ident(&c.column)
        .push(" ")
        .push(c.op.as_sql())
        .push(" ")
        .push_bind(c.value.clone());
}

fn write_clause(w: &mut SqlWriter, clause: &FilterClause, safety: &SafetyOptions) -> OrmResult<()> {
    match clause {
        FilterClause::Compare(c) => write_comparison(w, c),
        FilterClause::Pattern {
            column,
            op,
            pattern,
        } => {
            w.push_ident(column)
                .push(" ")
                .push(op.as_sql())
                .push(" ")
                .push_bind(pattern.clone());
        }
        FilterClause::Is { column, value } => {
            w.push_ident(column)
                .push(" IS NOT DISTINCT FROM ")
                .push_bind(value.clone());
        }
        FilterClause::In {
            column,
            values,
            negated,
        } => {
            if values.len() > safety.max_in_elements {
                return Err(OrmError::validation(format!(
                    "IN list for column '{column}' has {} elements, exceeding max_in_elements ({})",
                    values.len(),
                    safety.max_in_elements
                )));
            }
            if values.is_empty() {
                w.push(if *negated { "TRUE" } else { "FALSE" });
                return Ok(());
            }
            w.push_ident(column)
                .push(if *negated { " NOT IN (" } else { " IN (" });
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_bind(value.clone());
            }
            w.push(")");
        }
        FilterClause::IsDistinct { column, value } => {
            w.push_ident(column)
                .push(" IS DISTINCT FROM ")
                .push_bind(value.clone());
        }
        FilterClause::Contain { column, op, value } => {
            w.push_ident(column)
                .push(" ")
                .push(op.as_sql())
                .push(" ")
                .push_bind(value.clone());
        }
        FilterClause::Not(c) => {
            w.push("NOT (");
            write_comparison(w, c);
            w.push(")");
        }
        FilterClause::TextSearch {
            column,
            query,
            config,
            mode,
        } => {
            // Config names are validated identifiers, so a plain literal is safe.
            let config = config
                .as_ref()
                .map(|c| format!("'{}', ", c.as_str()))
                .unwrap_or_default();
            w.push("to_tsvector(")
                .push(&config)
                .push_ident(column)
                .push(") @@ ")
                .push(mode.function())
                .push("(")
                .push(&config)
                .push_bind(query.clone())
                .push(")");
        }
        FilterClause::Match(pairs) => {
            w.push("(");
            for (i, (column, value)) in pairs.iter().enumerate() {
                if i > 0 {
                    w.push(" AND ");
                }
                w.push_ident(column).push(" = ").push_bind(value.clone());
            }
            w.push(")");
        }
        FilterClause::Or(entries) => {
            w.push("(");
            for (i, entry) in entries.iter().enumerate() {
                if i > 0 {
                    w.push(" OR ");
                }
                write_comparison(w, entry);
            }
            w.push(")");
        }
    }
    Ok(())
}
