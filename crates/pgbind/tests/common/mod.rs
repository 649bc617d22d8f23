//! In-memory database backend shared by the integration tests.
//!
//! Understands the statements pgbind generates: the column metadata query,
//! multi-row `INSERT ... ON CONFLICT` upserts, `SELECT * FROM <table>` and
//! canned queries registered up front. Counts connections, metadata
//! lookups, transactions and materialized rows so tests can assert on them.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pgbind::prelude::*;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Name of the lazily generated result set
pub const SERIES_QUERY: &str = "SELECT * FROM series";

#[derive(Debug, Clone)]
pub struct MockTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl MockTable {
    fn index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn key_indexes(&self) -> Vec<usize> {
        (0..self.columns.len())
            .filter(|&i| self.columns[i].is_primary_key)
            .collect()
    }
}

fn key_of(pk: &[usize], row: &[Value]) -> Option<Vec<String>> {
    if pk.is_empty() {
        return None;
    }
    pk.iter()
        .map(|&i| match &row[i] {
            Value::Null => None,
            v => Some(v.to_string()),
        })
        .collect()
}

#[derive(Default)]
struct State {
    tables: HashMap<String, MockTable>,
    canned: HashMap<String, Vec<Row>>,
    series_len: usize,
    series_fail_after: Option<usize>,
    fail_when: Option<(String, Value)>,
    fail_connect: bool,
    execute_delay: Option<Duration>,
}

/// In-memory database
#[derive(Default)]
pub struct MockDb {
    state: Mutex<State>,
    statements: Mutex<Vec<String>>,
    last_params: Mutex<Vec<Value>>,
    pub metadata_queries: AtomicUsize,
    pub connections_opened: AtomicUsize,
    pub live_connections: AtomicI64,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub abandoned_transactions: AtomicUsize,
    pub open_transactions: AtomicI64,
    pub materialized: AtomicUsize,
}

impl MockDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connection factory opening connections to this database
    pub fn factory(self: &Arc<Self>) -> Arc<dyn ConnectionFactory> {
        Arc::new(MockFactory(Arc::clone(self)))
    }

    pub fn create_table(&self, name: &str, columns: Vec<Column>) {
        self.state.lock().tables.insert(
            name.to_string(),
            MockTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    pub fn add_column(&self, table: &str, column: Column) {
        let mut state = self.state.lock();
        if let Some(t) = state.tables.get_mut(table) {
            t.columns.push(column);
            for row in &mut t.rows {
                row.push(Value::Null);
            }
        }
    }

    pub fn count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Row whose primary key renders as `key`, as column name -> value
    pub fn row(&self, table: &str, key: &str) -> Option<HashMap<String, Value>> {
        let state = self.state.lock();
        let t = state.tables.get(table)?;
        let pk = t.key_indexes();
        let row = t
            .rows
            .iter()
            .find(|r| key_of(&pk, r) == Some(vec![key.to_string()]))?;
        Some(
            t.columns
                .iter()
                .map(|c| c.name.clone())
                .zip(row.iter().cloned())
                .collect(),
        )
    }

    /// Reject any inserted row whose `column` renders like `value`
    pub fn fail_when(&self, column: &str, value: impl Into<Value>) {
        self.state.lock().fail_when = Some((column.to_string(), value.into()));
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().fail_connect = fail;
    }

    pub fn set_execute_delay(&self, delay: Duration) {
        self.state.lock().execute_delay = Some(delay);
    }

    pub fn register_query(&self, sql: &str, rows: Vec<Row>) {
        self.state.lock().canned.insert(sql.to_string(), rows);
    }

    /// Serve `len` generated rows for [`SERIES_QUERY`], failing after
    /// `fail_after` rows if set
    pub fn serve_series(&self, len: usize, fail_after: Option<usize>) {
        let mut state = self.state.lock();
        state.series_len = len;
        state.series_fail_after = fail_after;
    }

    /// Statements executed so far (positional SQL)
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn last_params(&self) -> Vec<Value> {
        self.last_params.lock().clone()
    }

    fn tables(&self) -> HashMap<String, MockTable> {
        self.state.lock().tables.clone()
    }

    fn metadata(&self, params: &[Value]) -> Vec<Row> {
        self.metadata_queries.fetch_add(1, Ordering::SeqCst);
        let relation = params.first().and_then(Value::as_str).unwrap_or_default();
        let state = self.state.lock();
        let Some(table) = state.tables.get(relation) else {
            return Vec::new();
        };
        table
            .columns
            .iter()
            .map(|c| {
                Row::new(
                    vec![
                        "column_name".into(),
                        "data_type".into(),
                        "is_primary_key".into(),
                        "not_null".into(),
                        "has_default".into(),
                    ],
                    vec![
                        Value::String(c.name.clone()),
                        Value::String(c.data_type.clone()),
                        Value::Bool(c.is_primary_key),
                        Value::Bool(c.not_null),
                        Value::Bool(c.has_default),
                    ],
                )
            })
            .collect()
    }

    fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if sql == PostgresDialect.column_metadata_sql() {
            return Ok(self.metadata(params));
        }
        *self.last_params.lock() = params.to_vec();

        let state = self.state.lock();
        if let Some(rows) = state.canned.get(sql) {
            return Ok(rows.clone());
        }
        if let Some(table) = sql
            .strip_prefix("SELECT * FROM ")
            .and_then(|name| state.tables.get(name.trim()))
        {
            let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
            return Ok(table
                .rows
                .iter()
                .map(|r| Row::new(columns.clone(), r.clone()))
                .collect());
        }
        Err(Error::query_with_sql("unsupported query", sql))
    }

    async fn execute_in(
        &self,
        tables: &Mutex<HashMap<String, MockTable>>,
        sql: &str,
        params: &[Value],
    ) -> Result<u64> {
        let (delay, fail_when) = {
            let state = self.state.lock();
            (state.execute_delay, state.fail_when.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.statements.lock().push(sql.to_string());
        apply_insert(&mut tables.lock(), fail_when.as_ref(), sql, params)
    }
}

enum Conflict {
    None,
    Nothing,
    Update(Vec<String>),
}

struct ParsedInsert {
    relation: String,
    columns: Vec<String>,
    conflict: Conflict,
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').replace("\"\"", "\"")
}

impl ParsedInsert {
    fn parse(sql: &str) -> Option<Self> {
        let rest = sql.strip_prefix("INSERT INTO ")?;
        let (relation, rest) = rest.split_once(" (")?;
        let (columns, rest) = rest.split_once(") VALUES ")?;
        let conflict = match rest.find(" ON CONFLICT (") {
            None => Conflict::None,
            Some(pos) if rest[pos..].ends_with("DO NOTHING") => Conflict::Nothing,
            Some(pos) => {
                let (_, sets) = rest[pos..].split_once("DO UPDATE SET ")?;
                Conflict::Update(
                    sets.split(", ")
                        .filter_map(|a| a.split(" = ").next())
                        .map(unquote)
                        .collect(),
                )
            }
        };
        Some(Self {
            relation: relation.to_string(),
            columns: columns.split(", ").map(unquote).collect(),
            conflict,
        })
    }
}

fn apply_insert(
    tables: &mut HashMap<String, MockTable>,
    fail_when: Option<&(String, Value)>,
    sql: &str,
    params: &[Value],
) -> Result<u64> {
    let stmt =
        ParsedInsert::parse(sql).ok_or_else(|| Error::query_with_sql("unsupported statement", sql))?;
    let table = tables
        .get_mut(&stmt.relation)
        .ok_or_else(|| Error::TableNotFound {
            table: stmt.relation.clone(),
        })?;
    let width = stmt.columns.len();
    if width == 0 || params.len() % width != 0 {
        return Err(Error::query_with_sql("bind parameter count mismatch", sql));
    }

    let pk = table.key_indexes();
    let mut touched: HashSet<Vec<String>> = HashSet::new();
    let mut affected = 0;

    for chunk in params.chunks(width) {
        let mut row = vec![Value::Null; table.columns.len()];
        for (name, value) in stmt.columns.iter().zip(chunk) {
            let i = table
                .index(name)
                .ok_or_else(|| Error::query(format!("column \"{}\" does not exist", name)))?;
            row[i] = value.clone();
        }
        for (i, column) in table.columns.iter().enumerate() {
            if column.has_default && !stmt.columns.contains(&column.name) {
                row[i] = Value::String("default".into());
            }
            if column.not_null && row[i] == Value::Null {
                return Err(Error::Constraint {
                    constraint_name: format!("{}_not_null", column.name),
                    message: format!("null value in column \"{}\"", column.name),
                });
            }
        }
        if let Some((column, bad)) = fail_when {
            if let Some(i) = table.index(column) {
                if row[i].to_string() == bad.to_string() {
                    return Err(Error::Constraint {
                        constraint_name: format!("{}_check", column),
                        message: format!("new row violates check constraint on \"{}\"", column),
                    });
                }
            }
        }

        let key = key_of(&pk, &row);
        let existing = key
            .as_ref()
            .and_then(|k| table.rows.iter().position(|r| key_of(&pk, r).as_ref() == Some(k)));

        match (existing, &stmt.conflict) {
            (Some(_), Conflict::None) => {
                return Err(Error::Constraint {
                    constraint_name: format!("{}_pkey", stmt.relation),
                    message: "duplicate key value violates unique constraint".into(),
                });
            }
            (Some(_), Conflict::Nothing) => {}
            (Some(pos), Conflict::Update(assigned)) => {
                if let Some(k) = &key {
                    if !touched.insert(k.clone()) {
                        return Err(Error::query_with_sql(
                            "ON CONFLICT DO UPDATE command cannot affect row a second time",
                            sql,
                        ));
                    }
                }
                for name in assigned {
                    if let Some(i) = table.index(name) {
                        table.rows[pos][i] = row[i].clone();
                    }
                }
                affected += 1;
            }
            (None, _) => {
                if let Some(k) = key {
                    touched.insert(k);
                }
                table.rows.push(row);
                affected += 1;
            }
        }
    }
    Ok(affected)
}

struct MockFactory(Arc<MockDb>);

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if self.0.state.lock().fail_connect {
            return Err(Error::connection("connection refused"));
        }
        self.0.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.0.live_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            db: Arc::clone(&self.0),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockConnection {
    db: Arc<MockDb>,
    closed: AtomicBool,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.db.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.db.select(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let staged = Mutex::new(self.db.tables());
        let affected = self.db.execute_in(&staged, sql, params).await?;
        self.db.state.lock().tables = staged.into_inner();
        Ok(affected)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.db.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            db: Arc::clone(&self.db),
            staged: Mutex::new(self.db.tables()),
            finished: AtomicBool::new(false),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.ensure_open()?;
        if sql == SERIES_QUERY {
            let state = self.db.state.lock();
            return Ok(Box::pin(MockStream::Series {
                db: Arc::clone(&self.db),
                next: 0,
                len: state.series_len,
                fail_after: state.series_fail_after,
            }));
        }
        let rows = self.db.select(sql, params)?;
        Ok(Box::pin(MockStream::Rows {
            db: Arc::clone(&self.db),
            rows: rows.into_iter(),
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockTransaction {
    db: Arc<MockDb>,
    staged: Mutex<HashMap<String, MockTable>>,
    finished: AtomicBool,
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        self.db.open_transactions.fetch_sub(1, Ordering::SeqCst);
        if !self.finished.load(Ordering::SeqCst) {
            self.db.abandoned_transactions.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.db.select(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.db.execute_in(&self.staged, sql, params).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        self.db.state.lock().tables = self.staged.lock().clone();
        self.db.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        self.db.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum MockStream {
    Rows {
        db: Arc<MockDb>,
        rows: std::vec::IntoIter<Row>,
    },
    Series {
        db: Arc<MockDb>,
        next: usize,
        len: usize,
        fail_after: Option<usize>,
    },
}

impl MockStream {
    fn pull(&mut self) -> Result<Option<Row>> {
        match self {
            MockStream::Rows { db, rows } => {
                let row = rows.next();
                if row.is_some() {
                    db.materialized.fetch_add(1, Ordering::SeqCst);
                }
                Ok(row)
            }
            MockStream::Series {
                db,
                next,
                len,
                fail_after,
            } => {
                if Some(*next) == *fail_after {
                    return Err(Error::connection("server closed the connection unexpectedly"));
                }
                if *next >= *len {
                    return Ok(None);
                }
                db.materialized.fetch_add(1, Ordering::SeqCst);
                let row = Row::new(vec!["n".into()], vec![Value::Int64(*next as i64)]);
                *next += 1;
                Ok(Some(row))
            }
        }
    }
}

impl RowStream for MockStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move { self.pull() })
    }
}

/// Collector over `db` with the given settings
pub fn collector(
    db: &Arc<MockDb>,
    relation: &str,
    config: UpsertConfig,
) -> UpsertCollector<serde_json::Value> {
    UpsertCollector::new(
        relation,
        db.factory(),
        ConnectionConfig::new("postgres://mock/db"),
        config,
    )
    .expect("valid collector")
}

/// `products (id PK, name NOT NULL, cost)`
pub fn products_table(db: &MockDb) {
    db.create_table(
        "products",
        vec![
            Column::new("id", "integer").primary_key(),
            Column::new("name", "text").not_null(),
            Column::new("cost", "integer"),
        ],
    );
}
