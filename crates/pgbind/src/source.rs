//! Streaming reads for pgbind
//!
//! Provides:
//! - QueryCommand: query text or routine call plus its parameters
//! - StreamingReader: lazy, single-consumer row iteration
//! - fetch_all / fetch_json: eager helpers on top of the reader

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{cancellable, Connection, ConnectionConfig, ConnectionFactory, RowStream};
use crate::dialect::{NamedStatement, PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::params::{parse_parameters, NamedParameter};
use crate::security::validate_table_name;
use crate::types::{Row, Value};

/// How the command text of a read is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Query text with `@name` placeholders
    #[default]
    Text,
    /// Name of a set-returning function
    StoredProcedure,
}

/// A read command and its parameters
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCommand {
    text: String,
    command_type: CommandType,
    parameters: Vec<NamedParameter>,
}

impl QueryCommand {
    /// Build a command, parsing `parameters` in the `@name=value,...` form.
    ///
    /// Everything is checked here, before any connection is opened.
    pub fn new(
        text: impl Into<String>,
        command_type: CommandType,
        parameters: Option<&str>,
    ) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::config("command text must not be empty"));
        }
        if command_type == CommandType::StoredProcedure {
            validate_table_name(&text)?;
        }
        Ok(Self {
            text,
            command_type,
            parameters: parse_parameters(parameters)?,
        })
    }

    /// Query text without parameters
    pub fn sql(text: impl Into<String>) -> Result<Self> {
        Self::new(text, CommandType::Text, None)
    }

    /// Call of a set-returning function without parameters
    pub fn stored_procedure(name: impl Into<String>) -> Result<Self> {
        Self::new(name, CommandType::StoredProcedure, None)
    }

    /// Replace the parameters with those parsed from `spec`
    pub fn with_parameters(mut self, spec: &str) -> Result<Self> {
        self.parameters = parse_parameters(Some(spec))?;
        Ok(self)
    }

    /// Command text as given
    pub fn text(&self) -> &str {
        &self.text
    }

    /// How the text is interpreted
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// Parameters in declaration order
    pub fn parameters(&self) -> &[NamedParameter] {
        &self.parameters
    }

    /// Positional statement and its values.
    ///
    /// A routine is called as `SELECT * FROM name(@p1, @p2, ...)` with the
    /// parameters in declaration order. For query text only placeholders
    /// naming a declared parameter are rewritten; names match ignoring case.
    pub fn compile(&self, dialect: &dyn SqlDialect) -> Result<(NamedStatement, Vec<Value>)> {
        let statement = match self.command_type {
            CommandType::Text => NamedStatement::compile_with(dialect, &self.text, |name| {
                self.parameter(name).is_some()
            }),
            CommandType::StoredProcedure => {
                let args: Vec<String> = self
                    .parameters
                    .iter()
                    .map(|p| format!("@{}", p.name))
                    .collect();
                NamedStatement::compile(
                    dialect,
                    &format!("SELECT * FROM {}({})", self.text, args.join(", ")),
                )
            }
        };
        let values = statement.bind(|name| self.parameter(name).map(NamedParameter::value))?;
        Ok((statement, values))
    }

    fn parameter(&self, name: &str) -> Option<&NamedParameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Lifecycle of a [`StreamingReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Nothing executed yet
    Unopened,
    /// Query running, rows being pulled
    Reading,
    /// Every row was delivered; resources are released
    Exhausted,
    /// Closed explicitly or after a failure
    Closed,
}

/// Lazy reader over the results of one [`QueryCommand`].
///
/// The query runs on the first [`advance`](Self::advance); each further call
/// pulls exactly one row. The reader owns its connection and releases it
/// when the rows run out, on any failure, on [`close`](Self::close) and on
/// drop.
pub struct StreamingReader<T> {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    command: QueryCommand,
    dialect: Arc<dyn SqlDialect>,
    state: ReaderState,
    // Dropped before the connection it reads from
    stream: Option<Pin<Box<dyn RowStream>>>,
    connection: Option<Box<dyn Connection>>,
    current: Option<T>,
    rows_read: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamingReader<T> {
    /// Prepare a reader; nothing is executed until the first `advance`
    pub fn open(
        factory: Arc<dyn ConnectionFactory>,
        config: ConnectionConfig,
        command: QueryCommand,
    ) -> Self {
        Self {
            factory,
            config,
            command,
            dialect: Arc::new(PostgresDialect),
            state: ReaderState::Unopened,
            stream: None,
            connection: None,
            current: None,
            rows_read: 0,
            _marker: PhantomData,
        }
    }

    /// Use another dialect for placeholder rewriting
    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Rows delivered so far
    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Move to the next row.
    ///
    /// Returns `true` when a row is available through
    /// [`current`](Self::current), `false` once the results are exhausted
    /// or the reader is closed. Any error, cancellation included, closes
    /// the reader before it is returned.
    pub async fn advance(&mut self, cancel: &CancellationToken) -> Result<bool> {
        self.current = None;
        match self.state {
            ReaderState::Exhausted | ReaderState::Closed => return Ok(false),
            ReaderState::Unopened => {
                if let Err(e) = cancellable(cancel, self.start()).await {
                    self.close().await;
                    return Err(e);
                }
                self.state = ReaderState::Reading;
            }
            ReaderState::Reading => {}
        }

        let next = match self.stream.as_mut() {
            Some(stream) => cancellable(cancel, stream.next()).await,
            None => Err(Error::Internal {
                message: "reader has no open result stream".into(),
            }),
        };

        match next.and_then(|row| row.map(decode_row::<T>).transpose()) {
            Ok(Some(item)) => {
                self.current = Some(item);
                self.rows_read += 1;
                Ok(true)
            }
            Ok(None) => {
                self.release().await;
                self.state = ReaderState::Exhausted;
                info!(rows = self.rows_read, "Reader exhausted");
                Ok(false)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    /// Row produced by the last successful `advance`
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// Take ownership of the current row
    pub fn take_current(&mut self) -> Option<T> {
        self.current.take()
    }

    /// Release the cursor and the connection. Safe to call any number of
    /// times, in any state.
    pub async fn close(&mut self) {
        self.current = None;
        self.release().await;
        self.state = ReaderState::Closed;
    }

    /// Read every remaining row, then close
    pub async fn fetch_all(mut self, cancel: &CancellationToken) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        while self.advance(cancel).await? {
            if let Some(row) = self.take_current() {
                rows.push(row);
            }
        }
        self.close().await;
        Ok(rows)
    }

    /// Turn the reader into a [`Stream`] of rows; the stream ends after the
    /// first error.
    pub fn into_stream(self, cancel: CancellationToken) -> impl Stream<Item = Result<T>> {
        futures::stream::unfold(Some((self, cancel)), |state| async move {
            let (mut reader, cancel) = state?;
            match reader.advance(&cancel).await {
                Ok(true) => {
                    let item = reader.take_current()?;
                    Some((Ok(item), Some((reader, cancel))))
                }
                Ok(false) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn start(&mut self) -> Result<()> {
        let (statement, params) = self.command.compile(self.dialect.as_ref())?;
        let conn = self.factory.connect(&self.config).await?;
        let stream = conn.query_stream(statement.sql(), &params).await;
        self.connection = Some(conn);
        self.stream = Some(stream?);
        debug!(
            command_type = ?self.command.command_type(),
            parameters = params.len(),
            "Reader opened"
        );
        Ok(())
    }
}

impl<T> StreamingReader<T> {
    async fn release(&mut self) {
        self.stream = None;
        if let Some(conn) = self.connection.take() {
            // The connection may already be gone after a fatal error
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Ignoring error while closing reader connection");
            }
        }
    }
}

impl<T> Drop for StreamingReader<T> {
    fn drop(&mut self) {
        if self.connection.is_some() {
            debug!(rows = self.rows_read, "Reader dropped while open, releasing connection");
        }
        self.stream = None;
        self.connection = None;
    }
}

fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    serde_json::from_value(row.to_json())
        .map_err(|e| Error::type_conversion(format!("cannot convert row: {}", e)))
}

/// Run `command` and return every row as a JSON array string.
///
/// Keys follow result column order; timestamps use
/// [`TIMESTAMP_FORMAT`](crate::types::TIMESTAMP_FORMAT).
pub async fn fetch_json(
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    command: QueryCommand,
    cancel: &CancellationToken,
) -> Result<String> {
    let rows = StreamingReader::<serde_json::Value>::open(factory, config, command)
        .fetch_all(cancel)
        .await?;
    serde_json::to_string(&rows)
        .map_err(|e| Error::type_conversion(format!("cannot serialize rows: {}", e)))
}
