//! Fluent, chainable description of one statement.
//!
//! A [`QueryBuilder`] only records calls. Nothing touches the network until
//! [`QueryBuilder::execute`], [`QueryBuilder::execute_as`] or
//! [`QueryBuilder::stream`]. Invalid input (a bad identifier, a negative limit,
//! a payload that is not an object) is remembered and reported by the first of
//! those calls; later recording calls are still accepted.

use crate::client::Client;
use crate::compile::{CompiledStatement, compile};
use crate::connection::ConnectionSource;
use crate::error::{OrmError, OrmResult};
use crate::filter::{AnyOf, CompareOp, ContainOp, FilterClause, PatternOp, TextSearchMode};
use crate::ident::{Ident, IdentKind};
use crate::response::Response;
use crate::state::{BuilderState, CountMode, Operation, Order, OrderSpec, RowShape};
use crate::stream::QueryStream;
use crate::validate::{validate_limit, validate_range};
use crate::value::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Builder for one select, insert, upsert, update, delete or rpc call.
#[must_use = "query builders do nothing until executed"]
pub struct QueryBuilder<'c, S: ConnectionSource> {
    client: &'c Client<S>,
    state: BuilderState,
}

impl<'c, S: ConnectionSource> QueryBuilder<'c, S> {
    pub(crate) fn new(client: &'c Client<S>, state: BuilderState) -> Self {
        Self { client, state }
    }

    /// The recorded state.
    pub fn state(&self) -> &BuilderState {
        &self.state
    }

    /// Compile without executing.
    pub fn to_statement(&self) -> OrmResult<CompiledStatement> {
        compile(&self.state, &self.client.config().safety)
    }

    fn record(mut self, clause: OrmResult<FilterClause>) -> Self {
        match clause {
            Ok(clause) => self.state.filters.push(clause),
            Err(err) => self.state.record_error(err),
        }
        self
    }

    fn fail(mut self, err: OrmError) -> Self {
        self.state.record_error(err);
        self
    }

    // ==================== Target ====================

    /// Use `schema` instead of the client's default schema.
    pub fn schema(mut self, schema: &str) -> Self {
        self.state.schema = schema.to_string();
        self
    }

    // ==================== Operation ====================

    /// Select `columns` (`*` or a comma-separated list).
    ///
    /// After a mutation this sets the `RETURNING` list instead.
    pub fn select(mut self, columns: &str) -> Self {
        if matches!(self.state.operation, Operation::Rpc { .. }) {
            if columns.trim() == "*" {
                return self;
            }
            return self.fail(OrmError::validation(
                "rpc results cannot be narrowed with select(); wrap the function in a view",
            ));
        }
        match &mut self.state.operation {
            Operation::Select { columns: current } => *current = columns.to_string(),
            _ => self.state.returning = Some(columns.to_string()),
        }
        self
    }

    /// Insert one row (a JSON object) or many (an array of objects).
    pub fn insert(mut self, payload: impl Serialize) -> Self {
        match to_payload(payload, "insert") {
            Ok(payload) => self.state.operation = Operation::Insert { payload },
            Err(err) => self.state.record_error(err),
        }
        self
    }

    /// Insert, resolving conflicts on `on_conflict` columns.
    ///
    /// With `ignore_duplicates` conflicting rows are skipped; otherwise the
    /// non-conflict columns are overwritten with the incoming values.
    pub fn upsert(mut self, payload: impl Serialize, on_conflict: &[&str], ignore_duplicates: bool) -> Self {
        match to_payload(payload, "upsert") {
            Ok(payload) => {
                self.state.operation = Operation::Upsert {
                    payload,
                    on_conflict: on_conflict.iter().map(|c| c.to_string()).collect(),
                    ignore_duplicates,
                }
            }
            Err(err) => self.state.record_error(err),
        }
        self
    }

    /// Update the columns of a JSON object on every matching row.
    pub fn update(mut self, values: impl Serialize) -> Self {
        let set = match serde_json::to_value(values) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(column, value)| (column, Value::from_json(value)))
                .collect(),
            Ok(_) => return self.fail(OrmError::validation("update() values must be a JSON object")),
            Err(e) => return self.fail(OrmError::validation(format!("update() values: {e}"))),
        };
        self.state.operation = Operation::Update { set };
        self
    }

    /// Set one column, in call order. Turns the builder into an update.
    pub fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
        let entry = (column.to_string(), value.into());
        if let Operation::Update { set } = &mut self.state.operation {
            set.push(entry);
        } else {
            self.state.operation = Operation::Update { set: vec![entry] };
        }
        self
    }

    /// Delete every matching row.
    pub fn delete(mut self) -> Self {
        self.state.operation = Operation::Delete;
        self
    }

    /// Return `columns` from the affected rows.
    pub fn returning(mut self, columns: &str) -> Self {
        self.state.returning = Some(columns.to_string());
        self
    }

    // ==================== Filters ====================

    /// WHERE column = value
    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Eq, value))
    }

    /// WHERE column <> value
    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Neq, value))
    }

    /// WHERE column > value
    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Gt, value))
    }

    /// WHERE column >= value
    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Gte, value))
    }

    /// WHERE column < value
    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Lt, value))
    }

    /// WHERE column <= value
    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::compare(column, CompareOp::Lte, value))
    }

    /// WHERE column LIKE pattern
    pub fn like(self, column: &str, pattern: impl Into<String>) -> Self {
        self.record(FilterClause::pattern(column, PatternOp::Like, pattern))
    }

    /// WHERE column ILIKE pattern
    pub fn ilike(self, column: &str, pattern: impl Into<String>) -> Self {
        self.record(FilterClause::pattern(column, PatternOp::ILike, pattern))
    }

    /// Null or boolean test. `value` must be NULL, true or false.
    pub fn is(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::is(column, value))
    }

    /// WHERE column IN (values...)
    pub fn in_list<V: Into<Value>>(self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.record(FilterClause::in_list(column, values, false))
    }

    /// WHERE column NOT IN (values...)
    pub fn not_in<V: Into<Value>>(self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.record(FilterClause::in_list(column, values, true))
    }

    /// WHERE column IS DISTINCT FROM value
    pub fn is_distinct(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::is_distinct(column, value))
    }

    /// WHERE column @> value
    pub fn contains(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::contain(column, ContainOp::Contains, value))
    }

    /// WHERE column <@ value
    pub fn contained_by(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::contain(column, ContainOp::ContainedBy, value))
    }

    /// WHERE column && value
    pub fn overlaps(self, column: &str, value: impl Into<Value>) -> Self {
        self.record(FilterClause::contain(column, ContainOp::Overlaps, value))
    }

    /// WHERE NOT (column op value)
    pub fn not(self, column: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.record(FilterClause::not(column, op, value))
    }

    /// Full-text search on `column`, optionally with a text search config.
    pub fn text_search(
        self,
        column: &str,
        query: impl Into<String>,
        config: Option<&str>,
        mode: TextSearchMode,
    ) -> Self {
        self.record(FilterClause::text_search(column, query, config, mode))
    }

    /// Every `(column, value)` pair must match.
    pub fn match_record<K, V>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.record(FilterClause::match_record(pairs))
    }

    /// Any of the comparisons built by `build` must hold.
    ///
    /// ```ignore
    /// client.from("users").or(|any| any.eq("role", "admin").gt("karma", 100))
    /// ```
    pub fn or(self, build: impl FnOnce(AnyOf) -> AnyOf) -> Self {
        let clause = build(AnyOf::default()).finish();
        self.record(clause)
    }

    // ==================== Ordering & Paging ====================

    /// Add an ORDER BY term. Terms apply in call order.
    pub fn order(mut self, column: &str, order: Order) -> Self {
        match Ident::new(column, IdentKind::Column) {
            Ok(column) => self.state.order.push(OrderSpec { column, order }),
            Err(err) => self.state.record_error(err),
        }
        self
    }

    /// Return at most `n` rows.
    pub fn limit(mut self, n: i64) -> Self {
        match validate_limit(n) {
            Ok(n) => self.state.limit = Some(n),
            Err(err) => self.state.record_error(err),
        }
        self
    }

    /// Return rows `from..=to` (zero-based, inclusive).
    pub fn range(mut self, from: i64, to: i64) -> Self {
        match validate_range(from, to) {
            Ok((from, to)) => {
                self.state.offset = Some(from);
                self.state.limit = Some(to - from + 1);
            }
            Err(err) => self.state.record_error(err),
        }
        self
    }

    // ==================== Result shape ====================

    /// Expect exactly one row.
    pub fn single(mut self) -> Self {
        self.state.shape = RowShape::Single;
        self
    }

    /// Expect zero or one row.
    pub fn maybe_single(mut self) -> Self {
        self.state.shape = RowShape::MaybeSingle;
        self
    }

    /// Also report how many rows match.
    pub fn count(mut self, mode: CountMode) -> Self {
        self.state.count = Some(mode);
        self
    }

    /// Abort the call when `token` is cancelled.
    pub fn abort_signal(mut self, token: CancellationToken) -> Self {
        self.state.cancel = Some(token);
        self
    }

    // ==================== Execution ====================

    /// Run the statement.
    ///
    /// `data` is an array of row objects, a single object under `single()` /
    /// `maybe_single()`, or `None` for a mutation without `returning`.
    pub async fn execute(self) -> Response<serde_json::Value> {
        self.client.executor().execute(self.state).await
    }

    /// Run the statement and deserialize `data` into `T`.
    pub async fn execute_as<T: DeserializeOwned>(self) -> Response<T> {
        self.execute().await.decode()
    }

    /// Run a select and return its rows as a stream.
    pub async fn stream(self) -> OrmResult<QueryStream<S::Conn>> {
        self.client.executor().stream(self.state).await
    }
}

impl<S: ConnectionSource> std::fmt::Debug for QueryBuilder<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn to_payload(payload: impl Serialize, what: &str) -> OrmResult<serde_json::Value> {
    let value = serde_json::to_value(payload)
        .map_err(|e| OrmError::validation(format!("{what}() payload: {e}")))?;
    match &value {
        serde_json::Value::Object(_) | serde_json::Value::Array(_) => Ok(value),
        _ => Err(OrmError::validation(format!(
            "{what}() payload must be an object or an array of objects"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSource;
    use crate::value::Value;
    use serde_json::json;

    fn client() -> Client<FakeSource> {
        Client::new(FakeSource::new())
    }

    #[test]
    fn filters_chain_in_call_order() {
        let client = client();
        let stmt = client
            .from("users")
            .select("id, name")
            .eq("org", 3)
            .ilike("name", "a%")
            .in_list("role", ["admin", "owner"])
            .order("name", Order::asc())
            .limit(10)
            .to_statement()
            .unwrap();

        assert_eq!(
            stmt.text(),
            r#"SELECT "id", "name" FROM "public"."users" WHERE "org" = $1 AND "name" ILIKE $2 AND "role" IN ($3, $4) ORDER BY "name" ASC LIMIT 10"#
        );
        assert_eq!(stmt.values().len(), 4);
    }

    #[test]
    fn first_error_wins_and_surfaces_at_compile() {
        let client = client();
        let builder = client
            .from("users")
            .eq("bad column", 1)
            .limit(-1)
            .eq("id", 2);

        let err = builder.to_statement().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("bad column"), "{err}");
    }

    #[test]
    fn schema_override() {
        let client = client();
        let stmt = client.from("events").schema("audit").to_statement().unwrap();
        assert_eq!(stmt.text(), r#"SELECT * FROM "audit"."events""#);
    }

    #[test]
    fn range_sets_offset_and_limit() {
        let client = client();
        let builder = client.from("users").range(20, 29);
        assert_eq!(builder.state().offset, Some(20));
        assert_eq!(builder.state().limit, Some(10));
        assert!(client.from("users").range(5, 4).to_statement().is_err());
    }

    #[test]
    fn select_after_mutation_sets_returning() {
        let client = client();
        let stmt = client
            .from("users")
            .insert(json!({"name": "ann"}))
            .select("id")
            .to_statement()
            .unwrap();
        assert_eq!(
            stmt.text(),
            r#"INSERT INTO "public"."users" ("name") VALUES ($1) RETURNING "id""#
        );
    }

    #[test]
    fn scalar_payload_is_rejected() {
        let client = client();
        let err = client.from("users").insert(42).to_statement().unwrap_err();
        assert!(err.is_validation());
        let err = client.from("users").update(json!([1])).to_statement().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn set_keeps_call_order() {
        let client = client();
        let stmt = client
            .from("users")
            .set("name", "bo")
            .set("active", true)
            .eq("id", 1)
            .to_statement()
            .unwrap();
        assert_eq!(
            stmt.text(),
            r#"UPDATE "public"."users" SET "name" = $1, "active" = $2 WHERE "id" = $3"#
        );
        assert_eq!(
            stmt.values(),
            &[Value::from("bo"), Value::Bool(true), Value::Int(1)]
        );
    }

    #[test]
    fn or_group_compiles_with_parentheses() {
        let client = client();
        let stmt = client
            .from("users")
            .or(|any| any.eq("role", "admin").gt("karma", 100))
            .to_statement()
            .unwrap();
        assert_eq!(
            stmt.text(),
            r#"SELECT * FROM "public"."users" WHERE ("role" = $1 OR "karma" > $2)"#
        );
    }

    #[test]
    fn empty_or_group_is_rejected() {
        let client = client();
        assert!(client.from("users").or(|any| any).to_statement().is_err());
    }

    #[tokio::test]
    async fn execute_as_decodes_rows() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct User {
            id: i64,
        }

        let client = client();
        client
            .source()
            .script
            .push_rows(vec![crate::testing::row(&[("id", json!(5))])]);
        let resp = client.from("users").eq("id", 5).single().execute_as::<User>().await;
        assert_eq!(resp.data, Some(User { id: 5 }));
    }
}
