//! Batched upsert engine for pgbind
//!
//! Records are buffered by [`UpsertCollector::add`] and written by
//! [`UpsertCollector::flush`] as multi-row `INSERT ... ON CONFLICT`
//! statements, all inside one transaction:
//!
//! 1. An empty buffer returns `0` without touching the database
//! 2. The schema snapshot is taken from the [`SchemaCatalog`]
//! 3. The buffer is drained once; later `add` calls belong to the next flush
//! 4. Every record is checked against the snapshot before any SQL runs
//! 5. Rows are cut into batches and executed in drain order
//! 6. Any failure rolls the whole transaction back

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::RowBuffer;
use crate::command::{CommandTemplate, TemplateCache, UpsertCommandBuilder};
use crate::config::{UnknownFieldPolicy, UpsertConfig};
use crate::connection::{
    cancellable, Connection, ConnectionConfig, ConnectionFactory, Transaction,
};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::record::Record;
use crate::schema::{CatalogSchemaProvider, SchemaCatalog, SchemaSnapshot};
use crate::security::validate_table_name;
use crate::types::Value;

/// Most bind parameters PostgreSQL accepts in one statement
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// Upsert statistics
#[derive(Debug, Clone, Default)]
pub struct UpsertStats {
    /// Total rows committed
    pub rows_written: u64,
    /// Committed flushes
    pub flushes: u64,
    /// Statements executed by committed flushes
    pub batches_written: u64,
    /// Flushes that failed after draining the buffer
    pub flushes_failed: u64,
    /// Rows drained by failed flushes
    pub rows_failed: u64,
    /// Total time spent in committed flushes (milliseconds)
    pub total_write_time_ms: u64,
    /// Average rows per second
    pub rows_per_second: f64,
}

/// Atomic upsert statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicUpsertStats {
    pub rows_written: AtomicU64,
    pub flushes: AtomicU64,
    pub batches_written: AtomicU64,
    pub flushes_failed: AtomicU64,
    pub rows_failed: AtomicU64,
    pub total_write_time_ms: AtomicU64,
}

impl AtomicUpsertStats {
    /// Record a committed flush
    pub fn record_flush(&self, rows: u64, batches: u64, duration: Duration) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.batches_written.fetch_add(batches, Ordering::Relaxed);
        self.total_write_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record a failed flush
    pub fn record_failure(&self, rows: u64) {
        self.rows_failed.fetch_add(rows, Ordering::Relaxed);
        self.flushes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> UpsertStats {
        let rows = self.rows_written.load(Ordering::Relaxed);
        let time_ms = self.total_write_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (rows as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        UpsertStats {
            rows_written: rows,
            flushes: self.flushes.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            flushes_failed: self.flushes_failed.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            total_write_time_ms: time_ms,
            rows_per_second: rps,
        }
    }
}

/// One statement's worth of rows sharing a column set
#[derive(Debug, Clone)]
pub struct Batch {
    template: Arc<CommandTemplate>,
    rows: Vec<Vec<Value>>,
    capacity: usize,
    first_row: usize,
}

impl Batch {
    /// Template for this batch's column set
    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Values per row, in template column order
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Position of the first row in the drained sequence
    pub fn first_row(&self) -> usize {
        self.first_row
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Most rows one statement of this column set may carry
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the batch uses the cached full-size template
    pub fn is_full(&self) -> bool {
        self.rows.len() == self.capacity
    }
}

/// A record after validation: values for the columns it sets
struct CheckedRow {
    shape: Vec<usize>,
    values: Vec<Value>,
    key: Option<Vec<String>>,
}

/// Batch under construction
struct OpenBatch {
    shape: Vec<usize>,
    capacity: usize,
    rows: Vec<Vec<Value>>,
    keys: HashSet<Vec<String>>,
    first_row: usize,
}

impl OpenBatch {
    fn accepts(&self, row: &CheckedRow) -> bool {
        self.shape == row.shape
            && self.rows.len() < self.capacity
            && row.key.as_ref().map_or(true, |k| !self.keys.contains(k))
    }
}

/// Plans and runs one flush at a time.
///
/// Holds the command builder and the template cache; a flush lock
/// guarantees at most one flush is in flight per executor.
pub struct BatchExecutor {
    factory: Arc<dyn ConnectionFactory>,
    connection: ConnectionConfig,
    builder: UpsertCommandBuilder,
    config: UpsertConfig,
    templates: parking_lot::Mutex<TemplateCache>,
    flush_lock: Mutex<()>,
    stats: AtomicUpsertStats,
}

impl BatchExecutor {
    /// Create a new executor
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        dialect: Arc<dyn SqlDialect>,
        config: UpsertConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            connection,
            builder: UpsertCommandBuilder::new(dialect),
            config,
            templates: parking_lot::Mutex::new(TemplateCache::new()),
            flush_lock: Mutex::new(()),
            stats: AtomicUpsertStats::default(),
        })
    }

    /// Engine settings
    pub fn config(&self) -> &UpsertConfig {
        &self.config
    }

    /// Number of cached full-batch templates
    pub fn cached_templates(&self) -> usize {
        self.templates.lock().len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> UpsertStats {
        self.stats.snapshot()
    }

    /// Validate `records` against `snapshot` and cut them into batches.
    ///
    /// No SQL is executed. A new batch starts whenever the column set
    /// changes, the batch is full, or a primary key repeats within it.
    pub fn plan<R: Record>(
        &self,
        snapshot: &Arc<SchemaSnapshot>,
        records: &[R],
    ) -> Result<Vec<Batch>> {
        let mut checked = Vec::with_capacity(records.len());
        let mut ignored = 0usize;
        for (index, record) in records.iter().enumerate() {
            checked.push(self.check_row(snapshot, index, record, &mut ignored)?);
        }
        if ignored > 0 {
            debug!(
                relation = %snapshot.relation(),
                fields = ignored,
                "Ignored record fields with no matching column"
            );
        }

        let mut templates = self.templates.lock();
        let mut batches = Vec::new();
        let mut open: Option<OpenBatch> = None;

        for (index, row) in checked.into_iter().enumerate() {
            if !open.as_ref().is_some_and(|b| b.accepts(&row)) {
                if let Some(done) = open.take() {
                    batches.push(self.close_batch(&mut templates, snapshot, done));
                }
                open = Some(OpenBatch {
                    capacity: self.rows_per_statement(row.shape.len()),
                    shape: row.shape.clone(),
                    rows: Vec::new(),
                    keys: HashSet::new(),
                    first_row: index,
                });
            }
            if let Some(batch) = open.as_mut() {
                if let Some(key) = row.key {
                    batch.keys.insert(key);
                }
                batch.rows.push(row.values);
            }
        }
        if let Some(done) = open {
            batches.push(self.close_batch(&mut templates, snapshot, done));
        }
        Ok(batches)
    }

    /// Drain `buffer` and upsert everything in it within one transaction.
    ///
    /// Returns the number of rows written. Failures raised after the
    /// buffer was drained are wrapped in [`Error::Flush`]; cancellation is
    /// one of them, and an open transaction is rolled back first.
    pub async fn flush<R: Record>(
        &self,
        buffer: &RowBuffer<R>,
        catalog: &SchemaCatalog,
        relation: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let _guard = cancellable(cancel, async { Ok(self.flush_lock.lock().await) })
            .await
            .map_err(|e| Error::flush("cancelled while waiting for a running flush", 0, None, e))?;
        if buffer.is_empty() {
            return Ok(0);
        }

        let snapshot = cancellable(cancel, catalog.get_schema(relation, false))
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    Error::flush("cancelled during schema lookup", 0, None, e)
                } else {
                    e
                }
            })?;

        let start = Instant::now();
        let records = buffer.drain_all();
        let row_count = records.len();

        let result = match self.plan(&snapshot, &records) {
            Ok(batches) => self
                .execute(&batches, row_count, cancel)
                .await
                .map(|()| batches.len()),
            Err(e) => Err(e),
        };

        match result {
            Ok(batches) => {
                let elapsed = start.elapsed();
                self.stats
                    .record_flush(row_count as u64, batches as u64, elapsed);
                info!(
                    relation = %relation,
                    rows = row_count,
                    batches,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Flush committed"
                );
                Ok(row_count)
            }
            Err(e) => {
                self.stats.record_failure(row_count as u64);
                if self.config.restore_on_failure {
                    buffer.restore(records);
                    debug!(relation = %relation, rows = row_count, "Restored rows to buffer");
                }
                Err(e)
            }
        }
    }

    /// Run `batches` in one transaction on a fresh connection
    async fn execute(
        &self,
        batches: &[Batch],
        row_count: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = cancellable(cancel, self.factory.connect(&self.connection))
            .await
            .map_err(|e| Error::flush("could not open connection", row_count, None, e))?;

        let result = self.run_transaction(conn.as_ref(), batches, row_count, cancel).await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close flush connection");
        }
        result
    }

    async fn run_transaction(
        &self,
        conn: &dyn Connection,
        batches: &[Batch],
        row_count: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tx = cancellable(cancel, conn.begin())
            .await
            .map_err(|e| Error::flush("could not begin transaction", row_count, None, e))?;

        for (index, batch) in batches.iter().enumerate() {
            let statement = batch.template.statement_for(&self.builder, batch.len());
            let outcome = match batch.template.bind(&statement, &batch.rows) {
                Ok(params) => cancellable(cancel, tx.execute(statement.sql(), &params)).await,
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                let message = format!(
                    "batch {} (rows {}..{}) into '{}' failed",
                    index,
                    batch.first_row,
                    batch.first_row + batch.len(),
                    batch.template.relation()
                );
                warn!(
                    relation = %batch.template.relation(),
                    batch = index,
                    rows = row_count,
                    error = %e,
                    "Rolling back flush"
                );
                rollback(tx).await;
                return Err(Error::flush(
                    message,
                    row_count,
                    Some(statement.sql().to_string()),
                    e,
                ));
            }
        }

        if cancel.is_cancelled() {
            warn!(rows = row_count, "Flush cancelled before commit, rolling back");
            rollback(tx).await;
            return Err(Error::flush(
                "cancelled before commit",
                row_count,
                None,
                Error::Cancelled,
            ));
        }

        tx.commit()
            .await
            .map_err(|e| Error::flush("commit failed", row_count, None, e))
    }

    fn check_row<R: Record>(
        &self,
        snapshot: &SchemaSnapshot,
        index: usize,
        record: &R,
        ignored: &mut usize,
    ) -> Result<CheckedRow> {
        let columns = snapshot.columns();
        let fields = record
            .fields()
            .map_err(|e| Error::validity(format!("record {}: {}", index, e)))?;

        let mut cells: Vec<Option<Value>> = vec![None; columns.len()];
        for (name, value) in fields {
            match snapshot.column_index(&name) {
                Some(i) if cells[i].is_some() => {
                    return Err(Error::validity(format!(
                        "record {}: field '{}' maps to column '{}' which is already set",
                        index, name, columns[i].name
                    )));
                }
                Some(i) => cells[i] = Some(value),
                None => match self.config.unknown_fields {
                    UnknownFieldPolicy::Ignore => *ignored += 1,
                    UnknownFieldPolicy::Reject => {
                        return Err(Error::validity(format!(
                            "record {}: field '{}' matches no column of '{}'",
                            index,
                            name,
                            snapshot.relation()
                        )));
                    }
                },
            }
        }

        if cells.iter().all(Option::is_none) {
            return Err(Error::validity(format!(
                "record {}: no field matches a column of '{}'",
                index,
                snapshot.relation()
            )));
        }
        if let Some(missing) = columns
            .iter()
            .zip(&cells)
            .find(|(c, v)| c.is_required() && v.is_none())
        {
            return Err(Error::validity(format!(
                "record {}: required column '{}' has no value",
                index, missing.0.name
            )));
        }

        let key: Option<Vec<String>> = if snapshot.primary_key_names().is_empty() {
            None
        } else {
            columns
                .iter()
                .zip(&cells)
                .filter(|(c, _)| c.is_primary_key)
                .map(|(c, v)| v.as_ref().map(|v| key_text(v, &c.data_type)))
                .collect()
        };

        let mut shape = Vec::new();
        let mut values = Vec::new();
        for (i, cell) in cells.into_iter().enumerate() {
            if let Some(value) = cell {
                shape.push(i);
                values.push(value);
            }
        }
        Ok(CheckedRow { shape, values, key })
    }

    fn rows_per_statement(&self, columns: usize) -> usize {
        self.config
            .batch_size
            .min(MAX_BIND_PARAMETERS / columns.max(1))
            .max(1)
    }

    /// Full batches share the cached template; a partial batch gets a
    /// one-off template sized to its rows.
    fn close_batch(
        &self,
        templates: &mut TemplateCache,
        snapshot: &Arc<SchemaSnapshot>,
        batch: OpenBatch,
    ) -> Batch {
        let template = if batch.rows.len() == batch.capacity {
            templates.get_or_build(&self.builder, snapshot, &batch.shape, batch.capacity)
        } else {
            Arc::new(
                self.builder
                    .build_template_for(snapshot, &batch.shape, batch.rows.len()),
            )
        };
        Batch {
            template,
            rows: batch.rows,
            capacity: batch.capacity,
            first_row: batch.first_row,
        }
    }
}

/// Key cell text under the column type's equality, so two spellings of one
/// key (`"01"` and `1` for an integer) are seen as a repeat. A false match
/// only starts an extra batch.
fn key_text(value: &Value, data_type: &str) -> String {
    let data_type = data_type.to_ascii_lowercase();
    let base = data_type.split('(').next().unwrap_or_default().trim();
    let normalized = match base {
        "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8" | "smallserial"
        | "serial" | "bigserial" => value.as_i64().map(|n| n.to_string()),
        "numeric" | "decimal" => value.as_decimal().map(|d| d.normalize().to_string()),
        "real" | "double precision" | "float4" | "float8" => value.as_f64().map(|f| f.to_string()),
        "boolean" | "bool" => value.as_bool().map(|b| b.to_string()),
        "date" => value.as_date().map(|d| d.to_string()),
        "uuid" => value.as_uuid().map(|u| u.to_string()),
        t if t.starts_with("timestamp") => value.as_timestamp().map(|ts| ts.to_rfc3339()),
        _ => None,
    };
    normalized.unwrap_or_else(|| value.to_string())
}

/// Buffers records for one relation and upserts them on [`flush`](Self::flush).
///
/// `add` may be called from any number of tasks; flushes are serialized.
pub struct UpsertCollector<R: Record> {
    relation: String,
    buffer: RowBuffer<R>,
    catalog: Arc<SchemaCatalog>,
    executor: BatchExecutor,
}

impl<R: Record> UpsertCollector<R> {
    /// Create a collector writing to `relation`.
    ///
    /// The relation name and the settings are validated here, before any
    /// connection is opened.
    pub fn new(
        relation: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        config: UpsertConfig,
    ) -> Result<Self> {
        let relation = relation.into();
        validate_table_name(&relation)?;

        let dialect: Arc<dyn SqlDialect> = Arc::new(PostgresDialect);
        let provider = CatalogSchemaProvider::new(
            Arc::clone(&factory),
            connection.clone(),
            Arc::clone(&dialect),
        );
        let catalog = Arc::new(SchemaCatalog::new(Arc::new(provider), config.schema_ttl));
        let executor = BatchExecutor::new(factory, connection, dialect, config)?;

        Ok(Self {
            relation,
            buffer: RowBuffer::new(),
            catalog,
            executor,
        })
    }

    /// Share a schema catalog with other collectors
    pub fn with_catalog(mut self, catalog: Arc<SchemaCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Target relation
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Schema catalog used by this collector
    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    /// Buffer a record; `None` is ignored
    pub fn add(&self, record: impl Into<Option<R>>) {
        self.buffer.add(record);
    }

    /// Buffer several records
    pub fn add_all<I: IntoIterator<Item = R>>(&self, records: I) {
        self.buffer.add_all(records);
    }

    /// Records waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.count()
    }

    /// Drop buffered records, returning how many were dropped
    pub fn discard_pending(&self) -> usize {
        let dropped = self.buffer.clear();
        if dropped > 0 {
            debug!(relation = %self.relation, rows = dropped, "Discarded pending rows");
        }
        dropped
    }

    /// Upsert everything buffered so far; see [`BatchExecutor::flush`]
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<usize> {
        self.executor
            .flush(&self.buffer, &self.catalog, &self.relation, cancel)
            .await
    }

    /// Statistics snapshot
    pub fn stats(&self) -> UpsertStats {
        self.executor.stats()
    }
}

async fn rollback(tx: Box<dyn Transaction>) {
    if let Err(e) = tx.rollback().await {
        error!(error = %e, "Rollback failed");
    }
}
