use super::*;
use crate::config::{RetryPolicy, SafetyOptions};
use crate::error::ErrorCode;
use crate::filter::{CompareOp, FilterClause};
use crate::testing::{FakeSource, row};
use crate::value::Value;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn executor<'a>(source: &'a FakeSource, config: &'a ClientConfig, hooks: &'a Hooks) -> Executor<'a, FakeSource> {
    Executor {
        source,
        config,
        hooks,
        in_transaction: false,
    }
}

fn users() -> BuilderState {
    BuilderState::new("public", "users")
}

fn retrying(attempts: u32) -> ClientConfig {
    ClientConfig::default().with_retry(RetryPolicy::new(attempts, Duration::from_millis(100)))
}

fn serialization_failure() -> OrmError {
    OrmError::query_status("40001", "could not serialize access")
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failure_then_succeeds() {
    let source = FakeSource::new();
    source
        .script
        .push_query_error(serialization_failure())
        .push_query_error(serialization_failure())
        .push_rows(vec![row(&[("id", json!(1))])]);
    let config = retrying(3);
    let hooks = Hooks::new();

    let started = tokio::time::Instant::now();
    let resp = executor(&source, &config, &hooks).execute(users()).await;

    assert!(resp.is_ok(), "{:?}", resp.error);
    assert_eq!(resp.data, Some(json!([{"id": 1}])));
    assert_eq!(source.script.acquires(), 3);
    // 100ms then 200ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_attempts() {
    let source = FakeSource::new();
    for _ in 0..3 {
        source.script.push_query_error(serialization_failure());
    }
    let config = retrying(3);
    let hooks = Hooks::new();

    let resp = executor(&source, &config, &hooks).execute(users()).await;

    let err = resp.error.unwrap();
    assert_eq!(err.status(), Some("40001"));
    assert_eq!(source.script.acquires(), 3);
    assert_eq!(source.script.released(), 3);
}

#[tokio::test]
async fn constraint_violation_is_not_retried() {
    let source = FakeSource::new();
    source
        .script
        .push_execute_error(OrmError::query_status("23505", "duplicate key"));
    let config = retrying(5);
    let hooks = Hooks::new();

    let mut state = users();
    state.operation = Operation::Delete;
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert_eq!(resp.error.unwrap().status(), Some("23505"));
    assert_eq!(source.script.acquires(), 1);
}

#[tokio::test]
async fn transaction_scope_never_retries() {
    let source = FakeSource::new();
    source.script.push_query_error(serialization_failure());
    let config = retrying(5);
    let hooks = Hooks::new();

    let mut exec = executor(&source, &config, &hooks);
    exec.in_transaction = true;
    let resp = exec.execute(users()).await;

    assert!(resp.is_err());
    assert_eq!(source.script.acquires(), 1);
}

#[tokio::test]
async fn connection_failure_is_retried() {
    let source = FakeSource::new();
    source
        .script
        .fail_acquire(OrmError::connection("read ECONNRESET"));
    let config = ClientConfig::default().with_retry(RetryPolicy::new(2, Duration::ZERO));
    let hooks = Hooks::new();

    let resp = executor(&source, &config, &hooks).execute(users()).await;

    assert!(resp.is_ok());
    assert_eq!(source.script.acquires(), 2);
}

#[tokio::test]
async fn compile_failure_never_touches_the_pool() {
    let source = FakeSource::new();
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let state = BuilderState::new("public", "users; drop table users");
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert!(resp.error.unwrap().is_validation());
    assert_eq!(source.script.acquires(), 0);
}

#[tokio::test]
async fn single_row_shapes() {
    let config = retrying(3);
    let hooks = Hooks::new();

    // zero rows: NOT_FOUND, not retried
    let source = FakeSource::new();
    let mut state = users();
    state.shape = RowShape::Single;
    let resp = executor(&source, &config, &hooks).execute(state.clone()).await;
    assert_eq!(resp.error.unwrap().code(), ErrorCode::NotFound);
    assert_eq!(source.script.acquires(), 1);

    // two rows: TOO_MANY_ROWS
    let source = FakeSource::new();
    source
        .script
        .push_rows(vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])]);
    let resp = executor(&source, &config, &hooks).execute(state.clone()).await;
    assert_eq!(resp.error.unwrap().code(), ErrorCode::TooManyRows);

    // one row: the row itself
    let source = FakeSource::new();
    source.script.push_rows(vec![row(&[("id", json!(7))])]);
    let resp = executor(&source, &config, &hooks).execute(state).await;
    assert_eq!(resp.data, Some(json!({"id": 7})));
}

#[tokio::test]
async fn maybe_single_with_no_rows_is_empty_success() {
    let source = FakeSource::new();
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.shape = RowShape::MaybeSingle;
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert!(resp.is_ok());
    assert!(resp.data.is_none());
}

#[tokio::test]
async fn mutation_without_returning_reports_affected_count() {
    let source = FakeSource::new();
    source.script.push_affected(4);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.operation = Operation::Update {
        set: vec![("active".to_string(), Value::Bool(false))],
    };
    state.count = Some(CountMode::Exact);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert!(resp.is_ok());
    assert!(resp.data.is_none());
    assert_eq!(resp.count, Some(4));
    // no second COUNT query for mutations
    assert_eq!(source.script.log().len(), 1);
}

#[tokio::test]
async fn mutation_with_returning_yields_rows() {
    let source = FakeSource::new();
    source
        .script
        .push_rows(vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.operation = Operation::Delete;
    state.returning = Some("id".to_string());
    state.count = Some(CountMode::Exact);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert_eq!(resp.data, Some(json!([{"id": 1}, {"id": 2}])));
    assert_eq!(resp.count, Some(2));
    assert!(source.script.log()[0].ends_with(r#"RETURNING "id""#));
}

#[tokio::test]
async fn exact_count_runs_on_the_same_connection() {
    let source = FakeSource::new();
    source
        .script
        .push_rows(vec![row(&[("id", json!(1))])])
        .push_rows(vec![row(&[("count", json!(42))])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.filters = vec![FilterClause::compare("active", CompareOp::Eq, true).unwrap()];
    state.limit = Some(1);
    state.count = Some(CountMode::Exact);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert_eq!(resp.count, Some(42));
    assert_eq!(source.script.acquires(), 1);
    let log = source.script.log();
    assert_eq!(
        log[1],
        r#"SELECT COUNT(*) AS "count" FROM "public"."users" WHERE "active" = $1"#
    );
}

#[tokio::test]
async fn planned_count_reads_plan_rows() {
    let source = FakeSource::new();
    source.script.push_rows(vec![]).push_rows(vec![row(&[(
        "QUERY PLAN",
        json!([{"Plan": {"Node Type": "Seq Scan", "Plan Rows": 1250}}]),
    )])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.count = Some(CountMode::Planned);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert_eq!(resp.count, Some(1250));
    assert!(source.script.log()[1].starts_with("EXPLAIN (FORMAT JSON) SELECT * FROM"));
}

#[tokio::test]
async fn count_failure_keeps_primary_result() {
    let source = FakeSource::new();
    source
        .script
        .push_rows(vec![row(&[("id", json!(1))])])
        .push_query_error(OrmError::query_status("42501", "permission denied"));
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.count = Some(CountMode::Exact);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert!(resp.is_ok());
    assert_eq!(resp.data, Some(json!([{"id": 1}])));
    assert_eq!(resp.count, None);
}

#[tokio::test]
async fn statement_timeout_is_applied_and_reset() {
    let source = FakeSource::new();
    let config = ClientConfig::default()
        .with_safety(SafetyOptions::default().with_statement_timeout(Duration::from_millis(1500)));
    let hooks = Hooks::new();

    let resp = executor(&source, &config, &hooks).execute(users()).await;
    assert!(resp.is_ok());

    let log = source.script.log();
    assert_eq!(log.len(), 3);
    assert!(log[0].contains("set_config('statement_timeout'"));
    assert_eq!(
        source.script.params()[0],
        vec![Value::Text("1500ms".into()), Value::Bool(false)]
    );
    assert_eq!(log[2], "RESET statement_timeout");
}

#[tokio::test]
async fn statement_timeout_is_local_inside_transaction() {
    let source = FakeSource::new();
    let config = ClientConfig::default().with_statement_timeout(Duration::from_secs(2));
    let hooks = Hooks::new();

    let mut exec = executor(&source, &config, &hooks);
    exec.in_transaction = true;
    let resp = exec.execute(users()).await;
    assert!(resp.is_ok());

    let log = source.script.log();
    assert_eq!(log.len(), 2);
    assert_eq!(source.script.params()[0][1], Value::Bool(true));
    assert!(!log.iter().any(|sql| sql.starts_with("RESET")));
}

#[tokio::test]
async fn cancelled_before_execution_skips_acquire() {
    let source = FakeSource::new();
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let token = CancellationToken::new();
    token.cancel();
    let mut state = users();
    state.cancel = Some(token);
    let resp = executor(&source, &config, &hooks).execute(state).await;

    assert!(resp.error.unwrap().is_aborted());
    assert_eq!(source.script.acquires(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_flight_cancels_backend_and_does_not_retry() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    let config = retrying(3);
    let hooks = Hooks::new();

    let token = CancellationToken::new();
    let mut state = users();
    state.cancel = Some(token.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let resp = executor(&source, &config, &hooks).execute(state).await;
    trigger.await.unwrap();

    assert!(resp.error.unwrap().is_aborted());
    assert_eq!(source.script.cancels(), 1);
    assert_eq!(source.script.acquires(), 1);
    assert_eq!(source.script.released(), 1);
}

#[test]
fn shape_rows_many_wraps_in_array() {
    let rows = vec![row(&[("a", json!(1))])];
    assert_eq!(
        shape_rows(rows, RowShape::Many).unwrap(),
        Some(json!([{"a": 1}]))
    );
    assert_eq!(shape_rows(vec![], RowShape::Many).unwrap(), Some(json!([])));
}

#[tokio::test]
async fn stream_yields_rows_then_releases() {
    let source = FakeSource::new();
    source
        .script
        .push_rows(vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut stream = executor(&source, &config, &hooks)
        .stream(users())
        .await
        .unwrap();

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["id"], json!(1));
    assert_eq!(source.script.released(), 0);
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second["id"], json!(2));
    assert!(stream.next().await.is_none());
    assert!(stream.is_done());
    assert_eq!(source.script.released(), 1);
    // fused
    assert!(stream.next().await.is_none());
    assert_eq!(source.script.cancels(), 0);
}

#[tokio::test]
async fn stream_close_mid_iteration_cancels() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    source.script.push_rows(vec![row(&[("id", json!(1))])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut stream = executor(&source, &config, &hooks)
        .stream(users())
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    stream.close().await.unwrap();
    assert_eq!(source.script.cancels(), 1);
    assert_eq!(source.script.released(), 1);
}

#[tokio::test]
async fn stream_rejects_mutations() {
    let source = FakeSource::new();
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut state = users();
    state.operation = Operation::Delete;
    let err = executor(&source, &config, &hooks)
        .stream(state)
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(source.script.acquires(), 0);
}

#[tokio::test]
async fn dropped_call_resets_timeout_and_cancels() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    let config = ClientConfig::default().with_statement_timeout(Duration::from_millis(1500));
    let hooks = Hooks::new();

    let exec = executor(&source, &config, &hooks);
    let outcome = tokio::time::timeout(Duration::from_millis(10), exec.execute(users())).await;
    assert!(outcome.is_err());

    source.script.wait_released(1).await;
    assert_eq!(source.script.released(), 1);
    assert_eq!(source.script.cancels(), 1);
    let log = source.script.log();
    assert_eq!(log.last().map(String::as_str), Some("RESET statement_timeout"));
}

#[tokio::test]
async fn dropped_call_inside_transaction_leaves_connection_alone() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    let config = ClientConfig::default().with_statement_timeout(Duration::from_millis(1500));
    let hooks = Hooks::new();

    let mut exec = executor(&source, &config, &hooks);
    exec.in_transaction = true;
    let outcome = tokio::time::timeout(Duration::from_millis(10), exec.execute(users())).await;
    assert!(outcome.is_err());

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(source.script.released(), 1);
    assert_eq!(source.script.cancels(), 0);
    assert!(!source.script.log().iter().any(|sql| sql.starts_with("RESET")));
}

#[tokio::test]
async fn stream_error_surfaces_once_and_ends_the_stream() {
    let source = FakeSource::new();
    source.script.push_stream(vec![
        Ok(row(&[("id", json!(1))])),
        Err(OrmError::connection("connection reset by peer")),
        Ok(row(&[("id", json!(2))])),
    ]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let mut stream = executor(&source, &config, &hooks)
        .stream(users())
        .await
        .unwrap();

    assert!(stream.next().await.unwrap().is_ok());
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), ErrorCode::Connection);
    assert!(stream.is_done());
    assert!(stream.next().await.is_none());
    assert_eq!(source.script.released(), 1);
    assert_eq!(source.script.cancels(), 0);
}

#[tokio::test]
async fn dropping_a_live_stream_cancels_and_releases() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    source.script.push_rows(vec![row(&[("id", json!(1))])]);
    let config = ClientConfig::default().with_statement_timeout(Duration::from_millis(1500));
    let hooks = Hooks::new();

    let mut stream = executor(&source, &config, &hooks)
        .stream(users())
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);

    source.script.wait_released(1).await;
    assert_eq!(source.script.released(), 1);
    assert_eq!(source.script.cancels(), 1);
    let log = source.script.log();
    assert_eq!(log.last().map(String::as_str), Some("RESET statement_timeout"));
}

#[tokio::test]
async fn abort_signal_ends_a_live_stream() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    source.script.push_rows(vec![row(&[("id", json!(1))])]);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let token = CancellationToken::new();
    let mut state = users();
    state.cancel = Some(token.clone());
    let mut stream = executor(&source, &config, &hooks)
        .stream(state)
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    token.cancel();
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.is_aborted());
    assert!(stream.next().await.is_none());

    source.script.wait_released(1).await;
    assert_eq!(source.script.released(), 1);
    assert_eq!(source.script.cancels(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_backend_cancel_still_aborts_the_call() {
    let source = FakeSource::new();
    source.script.hang.store(true, Ordering::SeqCst);
    source.script.refuse_cancel.store(true, Ordering::SeqCst);
    let config = ClientConfig::default();
    let hooks = Hooks::new();

    let token = CancellationToken::new();
    let mut state = users();
    state.cancel = Some(token.clone());
    let trigger = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let resp = executor(&source, &config, &hooks).execute(state).await;
    trigger.await.unwrap();

    assert!(resp.error.unwrap().is_aborted());
    assert_eq!(source.script.cancels(), 1);
    assert_eq!(source.script.released(), 1);
}
