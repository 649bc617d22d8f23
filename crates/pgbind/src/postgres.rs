//! PostgreSQL backend implementation for pgbind
//!
//! Provides PostgreSQL-specific implementations:
//! - Parameter encoding driven by the server-reported parameter types
//! - Connection and transaction support
//! - Streaming row iteration backed by `query_raw`
//! - Connection factory honoring timeouts and session properties

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, RowStream, Transaction};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// A value could not be encoded as the parameter type the server expects
#[derive(Debug)]
struct ParameterConversionError(String);

impl std::fmt::Display for ParameterConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParameterConversionError {}

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    Box::new(ParameterConversionError(format!(
        "cannot convert {} value '{}' to {}",
        value.sql_type(),
        value,
        ty
    )))
}

fn narrow<T: TryFrom<i64>>(value: &Value, ty: &Type) -> std::result::Result<T, BoxError> {
    let n = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
    T::try_from(n).map_err(|_| {
        Box::new(ParameterConversionError(format!("{} is out of range for {}", n, ty))) as BoxError
    })
}

/// Values are coerced to whatever type the server inferred for the
/// parameter, so one [`Value`] binds to any compatible column.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        if matches!(self, Value::Null) {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => self
                .as_bool()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::INT2 => narrow::<i16>(self, ty)?.to_sql(ty, out),
            Type::INT4 => narrow::<i32>(self, ty)?.to_sql(ty, out),
            Type::INT8 => narrow::<i64>(self, ty)?.to_sql(ty, out),
            Type::OID => narrow::<u32>(self, ty)?.to_sql(ty, out),
            Type::FLOAT4 => (self.as_f64().ok_or_else(|| mismatch(self, ty))? as f32).to_sql(ty, out),
            Type::FLOAT8 => self
                .as_f64()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::NUMERIC => self
                .as_decimal()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => self
                .as_string()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::BYTEA => self
                .as_bytes()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::DATE => self
                .as_date()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::TIME => self
                .as_time()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::TIMESTAMP => self
                .as_timestamp()
                .ok_or_else(|| mismatch(self, ty))?
                .naive_utc()
                .to_sql(ty, out),
            Type::TIMESTAMPTZ => self
                .as_timestamp()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::UUID => self
                .as_uuid()
                .ok_or_else(|| mismatch(self, ty))?
                .to_sql(ty, out),
            Type::JSON | Type::JSONB => {
                let json = match self {
                    Value::Json(j) => j.clone(),
                    // Strings holding a JSON document are sent as that document
                    Value::String(s) => serde_json::from_str(s)
                        .unwrap_or_else(|_| serde_json::Value::String(s.clone())),
                    other => other.to_json(),
                };
                json.to_sql(ty, out)
            }
            // Enum labels travel as their text
            _ if matches!(ty.kind(), Kind::Enum(_)) => match self.as_str() {
                Some(label) => {
                    out.extend_from_slice(label.as_bytes());
                    Ok(IsNull::No)
                }
                None => Err(mismatch(self, ty)),
            },
            _ => Err(mismatch(self, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Text of an enum-typed column
struct EnumLabel(String);

impl<'a> FromSql<'a> for EnumLabel {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(Self(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(ty.kind(), Kind::Enum(_))
    }
}

/// Map a driver error onto the crate taxonomy by SQLSTATE
fn map_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code.starts_with("23") {
            return Error::Constraint {
                constraint_name: db.constraint().unwrap_or(code).to_string(),
                message: db.message().to_string(),
            };
        }
        match code {
            "40P01" => return Error::Deadlock,
            "42P01" => {
                return Error::TableNotFound {
                    table: db.table().unwrap_or(db.message()).to_string(),
                }
            }
            "57014" => return Error::timeout(db.message()),
            _ if code.starts_with("22") => return Error::type_conversion(db.message()),
            _ => {}
        }
    }

    let conversion = std::error::Error::source(&e)
        .and_then(|s| s.downcast_ref::<ParameterConversionError>())
        .map(|c| c.0.clone());
    if let Some(message) = conversion {
        return Error::type_conversion(message);
    }

    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }

    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn param_refs(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// Convert a tokio-postgres row to a pgbind Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(columns, values))
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        Error::type_conversion(format!(
            "cannot decode column '{}': {}",
            row.columns()[idx].name(),
            e
        ))
    })
}

/// Convert a PostgreSQL value to a pgbind Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(Value::Int16),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::Int32),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::Int64),
        Type::OID => get::<u32>(row, idx)?.map(|n| Value::Int64(i64::from(n))),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(Value::Float32),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(Value::Float64),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx)?.map(Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx)?.map(Value::String)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx)?.map(Value::Bytes),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?.map(Value::Date),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?.map(Value::Time),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx)?.map(Value::DateTimeTz)
        }
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(Value::Uuid),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx)?.map(Value::Json),
        _ if matches!(pg_type.kind(), Kind::Enum(_)) => {
            get::<EnumLabel>(row, idx)?.map(|l| Value::String(l.0))
        }
        // citext and friends decode as text
        _ => get::<String>(row, idx)?.map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let pg_rows = self
            .client
            .query(sql, &param_refs(params))
            .await
            .map_err(|e| map_error(e, sql))?;

        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.client
            .execute(sql, &param_refs(params))
            .await
            .map_err(|e| map_error(e, sql))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::Transaction {
                message: e.to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            finished: AtomicBool::new(false),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.ensure_open()?;
        let stream = self
            .client
            .query_raw(sql, params.iter())
            .await
            .map_err(|e| map_error(e, sql))?;

        Ok(Box::pin(PgRowStream {
            inner: Box::pin(stream),
            sql: sql.to_string(),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Rows pulled from the server one at a time
struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.next().await {
                Some(Ok(row)) => pg_row_to_row(&row).map(Some),
                Some(Err(e)) => Err(map_error(e, &self.sql)),
                None => Ok(None),
            }
        })
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    finished: AtomicBool,
}

impl PgTransaction {
    async fn finish(&self, command: &str) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.client
            .batch_execute(command)
            .await
            .map_err(|e| Error::Transaction {
                message: format!("{} failed: {}", command, e),
                source: Some(Box::new(e)),
            })
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let pg_rows = self
            .client
            .query(sql, &param_refs(params))
            .await
            .map_err(|e| map_error(e, sql))?;

        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.client
            .execute(sql, &param_refs(params))
            .await
            .map_err(|e| map_error(e, sql))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Relaxed) || self.client.is_closed() {
            return;
        }
        warn!("Transaction dropped without commit or rollback, rolling back");
        let client = Arc::clone(&self.client);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        error!(error = %e, "Background rollback failed");
                    }
                });
            }
            Err(_) => error!("No runtime available to roll back dropped transaction"),
        }
    }
}

/// Build the driver configuration for `config`
fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
    let mut pg: tokio_postgres::Config = config
        .url
        .parse()
        .map_err(|e| Error::config(format!("invalid connection string: {}", e)))?;

    if config.connect_timeout_ms > 0 {
        pg.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }
    if pg.get_application_name().is_none() {
        if let Some(name) = &config.application_name {
            pg.application_name(name);
        }
    }

    let mut options: Vec<String> = pg.get_options().map(String::from).into_iter().collect();
    if config.query_timeout_ms > 0 {
        options.push(format!("-c statement_timeout={}", config.query_timeout_ms));
    }
    let mut properties: Vec<_> = config.properties.iter().collect();
    properties.sort();
    for (key, value) in properties {
        options.push(format!("-c {}={}", key, value));
    }
    if !options.is_empty() {
        pg.options(&options.join(" "));
    }
    Ok(pg)
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let pg = pg_config(config)?;
        let connecting = pg.connect(tokio_postgres::NoTls);

        let (client, connection) = if config.connect_timeout_ms > 0 {
            tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connecting)
                .await
                .map_err(|_| {
                    Error::timeout(format!(
                        "connect timed out after {} ms",
                        config.connect_timeout_ms
                    ))
                })?
        } else {
            connecting.await
        }
        .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection task failed");
            }
        });

        debug!(config = ?config, "Opened PostgreSQL connection");
        Ok(Box::new(PgConnection::new(client)))
    }
}
