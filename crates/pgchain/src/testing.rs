//! Scripted in-memory connections for unit tests.

use crate::connection::{Connection, ConnectionSource, RowStream};
use crate::error::{OrmError, OrmResult};
use crate::row::Row;
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared script and call log behind every [`FakeConn`] of one [`FakeSource`].
#[derive(Default)]
pub(crate) struct Script {
    queries: Mutex<VecDeque<OrmResult<Vec<Row>>>>,
    executes: Mutex<VecDeque<OrmResult<u64>>>,
    streams: Mutex<VecDeque<Vec<OrmResult<Row>>>>,
    batches: Mutex<VecDeque<(String, OrmError)>>,
    acquire_errors: Mutex<VecDeque<OrmError>>,
    log: Mutex<Vec<String>>,
    params: Mutex<Vec<Vec<Value>>>,
    pub acquires: AtomicUsize,
    pub cancels: AtomicUsize,
    pub released: AtomicUsize,
    /// Scripted queries never resolve.
    pub hang: AtomicBool,
    /// Backend cancel requests fail.
    pub refuse_cancel: AtomicBool,
}

impl Script {
    pub fn push_rows(&self, rows: Vec<Row>) -> &Self {
        self.queries.lock().unwrap().push_back(Ok(rows));
        self
    }

    pub fn push_query_error(&self, err: OrmError) -> &Self {
        self.queries.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn push_affected(&self, n: u64) -> &Self {
        self.executes.lock().unwrap().push_back(Ok(n));
        self
    }

    pub fn push_execute_error(&self, err: OrmError) -> &Self {
        self.executes.lock().unwrap().push_back(Err(err));
        self
    }

    /// Script the items of the next streamed query, errors included.
    pub fn push_stream(&self, items: Vec<OrmResult<Row>>) -> &Self {
        self.streams.lock().unwrap().push_back(items);
        self
    }

    /// Fail the next batch statement equal to `sql`.
    pub fn fail_batch(&self, sql: &str, err: OrmError) -> &Self {
        self.batches.lock().unwrap().push_back((sql.to_string(), err));
        self
    }

    pub fn fail_acquire(&self, err: OrmError) -> &Self {
        self.acquire_errors.lock().unwrap().push_back(err);
        self
    }

    /// Every statement text sent, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Parameters of every scripted query/execute, in order.
    pub fn params(&self) -> Vec<Vec<Value>> {
        self.params.lock().unwrap().clone()
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Yield to spawned cleanup tasks until `n` connections are released.
    pub async fn wait_released(&self, n: usize) {
        for _ in 0..100 {
            if self.released() >= n {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.log.lock().unwrap().push(sql.to_string());
        self.params.lock().unwrap().push(params.to_vec());
    }

    fn next_rows(&self) -> OrmResult<Vec<Row>> {
        self.queries.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
    }
}

pub(crate) struct FakeConn {
    script: Arc<Script>,
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        self.script.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeConn {
    async fn maybe_hang(&self) {
        if self.script.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

impl Connection for FakeConn {
    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        self.script.record(sql, params);
        if sql.starts_with("SELECT set_config") {
            return Ok(Vec::new());
        }
        self.maybe_hang().await;
        self.script.next_rows()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        self.script.record(sql, params);
        self.maybe_hang().await;
        self.script
            .executes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(0))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> OrmResult<RowStream> {
        self.script.record(sql, params);
        let scripted = self.script.streams.lock().unwrap().pop_front();
        let rows: Vec<OrmResult<Row>> = match scripted {
            Some(items) => items,
            None => self.script.next_rows()?.into_iter().map(Ok).collect(),
        };
        let hang = self.script.hang.load(Ordering::SeqCst);
        let stream = futures_util::stream::iter(rows);
        if hang {
            use futures_util::StreamExt;
            return Ok(RowStream::new(stream.chain(futures_util::stream::pending())));
        }
        Ok(RowStream::new(stream))
    }

    async fn batch_execute(&self, sql: &str) -> OrmResult<()> {
        self.script.record(sql, &[]);
        let mut batches = self.script.batches.lock().unwrap();
        if let Some(pos) = batches.iter().position(|(s, _)| s == sql) {
            if let Some((_, err)) = batches.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn cancel(&self) -> OrmResult<()> {
        self.script.cancels.fetch_add(1, Ordering::SeqCst);
        if self.script.refuse_cancel.load(Ordering::SeqCst) {
            return Err(OrmError::connection("server requires SSL"));
        }
        Ok(())
    }
}

pub(crate) struct FakeSource {
    pub script: Arc<Script>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script::default()),
        }
    }
}

impl ConnectionSource for FakeSource {
    type Conn = FakeConn;

    async fn acquire(&self) -> OrmResult<FakeConn> {
        self.script.acquires.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.acquire_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(FakeConn {
            script: Arc::clone(&self.script),
        })
    }
}

/// Build a row from `(column, value)` pairs.
pub(crate) fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
