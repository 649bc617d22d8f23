//! Schema discovery and caching for pgbind
//!
//! Provides:
//! - SchemaProvider: reads column metadata for one relation
//! - CatalogSchemaProvider: SchemaProvider backed by the system catalog
//! - SchemaCatalog: per-relation snapshot cache with a time-to-live

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{ConnectionConfig, ConnectionFactory};
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::security::validate_table_name;
use crate::types::{Row, Value};

/// Default time a schema snapshot stays fresh
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(5 * 60);

/// One column of a relation, as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name, exactly as stored in the catalog
    pub name: String,
    /// Engine-native type descriptor (e.g. `character varying(100)`)
    pub data_type: String,
    /// Member of the primary key
    pub is_primary_key: bool,
    /// Declared NOT NULL
    pub not_null: bool,
    /// Has a default, identity or generation expression
    pub has_default: bool,
}

impl Column {
    /// Nullable column without a default
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_primary_key: false,
            not_null: false,
            has_default: false,
        }
    }

    /// Mark as primary key column (primary keys are NOT NULL)
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.not_null = true;
        self
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Mark as having a default value
    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// A row that omits this column cannot be inserted
    #[inline]
    pub fn is_required(&self) -> bool {
        self.not_null && !self.has_default
    }

    fn from_row(row: &Row) -> Result<Self> {
        let name = row
            .get_by_name("column_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::schema("column metadata row has no column_name"))?
            .to_string();

        let data_type = row
            .get_by_name("data_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let flag = |field: &str| {
            row.get_by_name(field)
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        Ok(Self {
            name,
            data_type,
            is_primary_key: flag("is_primary_key"),
            not_null: flag("not_null"),
            has_default: flag("has_default"),
        })
    }
}

/// Immutable description of one relation at one point in time
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    relation: String,
    columns: Vec<Column>,
    primary_key_names: Vec<String>,
    fetched_at: Instant,
}

impl SchemaSnapshot {
    /// Build a snapshot from catalog columns, in catalog order
    pub fn new(relation: impl Into<String>, columns: Vec<Column>) -> Self {
        let primary_key_names = columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect();
        Self {
            relation: relation.into(),
            columns,
            primary_key_names,
            fetched_at: Instant::now(),
        }
    }

    /// Relation this snapshot describes
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Columns in catalog order
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Primary key column names, in column order
    pub fn primary_key_names(&self) -> &[String] {
        &self.primary_key_names
    }

    /// When the catalog was read
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Whether the snapshot is older than `ttl`
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }

    /// Index of the column a record field maps to.
    ///
    /// An exact match wins; otherwise names are compared ignoring ASCII case.
    pub fn column_index(&self, field: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name == field)
            .or_else(|| {
                self.columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(field))
            })
    }

    /// Column a record field maps to
    pub fn column(&self, field: &str) -> Option<&Column> {
        self.column_index(field).map(|i| &self.columns[i])
    }

    /// Same relation and same columns (fetch time ignored)
    pub fn same_shape(&self, other: &SchemaSnapshot) -> bool {
        self.relation == other.relation && self.columns == other.columns
    }
}

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Columns of `relation` in catalog order, `None` if it does not exist
    async fn get_columns(&self, relation: &str) -> Result<Option<Vec<Column>>>;
}

/// [`SchemaProvider`] that opens a connection and runs the dialect's
/// column metadata query
pub struct CatalogSchemaProvider {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    dialect: Arc<dyn SqlDialect>,
}

impl CatalogSchemaProvider {
    /// Create a new catalog-backed provider
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        config: ConnectionConfig,
        dialect: Arc<dyn SqlDialect>,
    ) -> Self {
        Self {
            factory,
            config,
            dialect,
        }
    }
}

#[async_trait]
impl SchemaProvider for CatalogSchemaProvider {
    async fn get_columns(&self, relation: &str) -> Result<Option<Vec<Column>>> {
        let conn = self.factory.connect(&self.config).await?;
        let result = conn
            .query(
                self.dialect.column_metadata_sql(),
                &[Value::String(relation.to_string())],
            )
            .await;
        if let Err(e) = conn.close().await {
            warn!(relation = %relation, error = %e, "Failed to close metadata connection");
        }

        let rows = result?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.iter().map(Column::from_row).collect::<Result<_>>().map(Some)
    }
}

/// Per-relation cache of [`SchemaSnapshot`]s.
///
/// Snapshots are shared as `Arc`s and replaced wholesale on refresh, so a
/// caller holding one never sees it change.
pub struct SchemaCatalog {
    provider: Arc<dyn SchemaProvider>,
    ttl: Duration,
    snapshots: RwLock<HashMap<String, Arc<SchemaSnapshot>>>,
    lookups: AtomicU64,
}

impl SchemaCatalog {
    /// Create a catalog over `provider` with the given time-to-live
    pub fn new(provider: Arc<dyn SchemaProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            snapshots: RwLock::new(HashMap::new()),
            lookups: AtomicU64::new(0),
        }
    }

    /// Snapshot time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of catalog lookups (cache misses) so far
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Cached snapshot for `relation`, fresh or not
    pub fn cached(&self, relation: &str) -> Option<Arc<SchemaSnapshot>> {
        self.snapshots.read().get(relation).cloned()
    }

    /// Drop the cached snapshot so the next lookup reads the catalog
    pub fn invalidate(&self, relation: &str) {
        self.snapshots.write().remove(relation);
    }

    /// Current snapshot of `relation`.
    ///
    /// Served from the cache unless `force_refresh` is set or the cached
    /// snapshot is older than the TTL. A missing relation fails with
    /// [`Error::TableNotFound`]; any other lookup failure is wrapped in
    /// [`Error::Schema`].
    pub async fn get_schema(
        &self,
        relation: &str,
        force_refresh: bool,
    ) -> Result<Arc<SchemaSnapshot>> {
        validate_table_name(relation)?;

        if !force_refresh {
            if let Some(snapshot) = self.cached(relation) {
                if !snapshot.is_expired(self.ttl) {
                    debug!(relation = %relation, "Schema cache hit");
                    return Ok(snapshot);
                }
            }
        }

        let start = Instant::now();
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let columns = match self.provider.get_columns(relation).await {
            Ok(Some(columns)) if !columns.is_empty() => columns,
            Ok(_) => {
                return Err(Error::TableNotFound {
                    table: relation.to_string(),
                })
            }
            Err(e @ (Error::Schema { .. } | Error::TableNotFound { .. })) => return Err(e),
            Err(e) => {
                return Err(Error::schema_with_source(
                    format!("failed to read columns of '{}'", relation),
                    e,
                ))
            }
        };

        let snapshot = Arc::new(SchemaSnapshot::new(relation, columns));
        self.snapshots
            .write()
            .insert(relation.to_string(), Arc::clone(&snapshot));

        debug!(
            relation = %relation,
            columns = snapshot.columns().len(),
            primary_keys = ?snapshot.primary_key_names(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Schema cache miss, columns loaded"
        );
        Ok(snapshot)
    }
}
