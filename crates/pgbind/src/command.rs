//! Upsert command generation.
//!
//! A [`CommandTemplate`] holds the three clauses of a multi-row upsert for
//! one column set:
//!
//! ```text
//! INSERT INTO products ("ProductId", "Name", "Cost") VALUES
//! (@ProductId_0, @Name_0, @Cost_0), (@ProductId_1, @Name_1, @Cost_1)
//!  ON CONFLICT ("ProductId") DO UPDATE SET "Name" = EXCLUDED."Name", "Cost" = EXCLUDED."Cost"
//! ```
//!
//! Templates contain placeholders only, so the text for a full batch is
//! built once and reused for every full batch of the same column set.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::dialect::{NamedStatement, SqlDialect};
use crate::error::{Error, Result};
use crate::schema::SchemaSnapshot;
use crate::types::Value;

/// Name of the placeholder for one (column, row) cell, without the `@`.
///
/// Plain identifiers use the column name as stem. Other names use
/// `c$<position>`; `$` never occurs in a plain stem, so the two forms
/// cannot collide, and the `_` before the row index keeps `id`/`id1`
/// apart.
pub fn placeholder_name(column: &str, position: usize, row: usize) -> String {
    if is_plain_identifier(column) {
        format!("{}_{}", column, row)
    } else {
        format!("c${}_{}", position, row)
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Builds upsert templates for a dialect
#[derive(Clone)]
pub struct UpsertCommandBuilder {
    dialect: Arc<dyn SqlDialect>,
}

impl UpsertCommandBuilder {
    /// Create a builder for `dialect`
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        Self { dialect }
    }

    /// Dialect used for quoting and placeholders
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Template writing every column of the snapshot
    pub fn build_template(&self, snapshot: &SchemaSnapshot, batch_size: usize) -> CommandTemplate {
        let all: Vec<usize> = (0..snapshot.columns().len()).collect();
        self.build_template_for(snapshot, &all, batch_size)
    }

    /// Template writing only the given columns (indexes into the snapshot,
    /// in snapshot order).
    pub fn build_template_for(
        &self,
        snapshot: &SchemaSnapshot,
        columns: &[usize],
        batch_size: usize,
    ) -> CommandTemplate {
        let names: Vec<String> = columns
            .iter()
            .map(|&i| snapshot.columns()[i].name.clone())
            .collect();
        let primary_keys = snapshot.primary_key_names().to_vec();

        let insert_clause = self.insert_clause(snapshot.relation(), &names);
        let values_clause = self.build_values_clause(&names, batch_size);
        let conflict_clause = self.conflict_clause(&names, &primary_keys);
        let statement = NamedStatement::compile(
            self.dialect(),
            &join_clauses(&insert_clause, &values_clause, &conflict_clause),
        );

        debug!(
            relation = %snapshot.relation(),
            columns = names.len(),
            batch_size,
            "Built upsert command template"
        );

        CommandTemplate {
            relation: snapshot.relation().to_string(),
            columns: names,
            primary_keys,
            batch_size,
            insert_clause,
            values_clause,
            conflict_clause,
            statement,
        }
    }

    /// `rowCount` parenthesized groups of one placeholder per column
    pub fn build_values_clause<S: AsRef<str>>(&self, columns: &[S], row_count: usize) -> String {
        let mut groups = Vec::with_capacity(row_count);
        for row in 0..row_count {
            let cells: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(position, c)| format!("@{}", placeholder_name(c.as_ref(), position, row)))
                .collect();
            groups.push(format!("({})", cells.join(", ")));
        }
        groups.join(", ")
    }

    fn insert_clause(&self, relation: &str, columns: &[String]) -> String {
        let quoted: Vec<String> = columns
            .iter()
            .map(|c| self.dialect.quote_identifier(c))
            .collect();
        format!("INSERT INTO {} ({}) VALUES", relation, quoted.join(", "))
    }

    /// Empty without a primary key. When every written column is a key
    /// column there is nothing to update and the clause is `DO NOTHING`.
    fn conflict_clause(&self, columns: &[String], primary_keys: &[String]) -> String {
        if primary_keys.is_empty() {
            return String::new();
        }

        let target: Vec<String> = primary_keys
            .iter()
            .map(|k| self.dialect.quote_identifier(k))
            .collect();
        let assignments: Vec<String> = columns
            .iter()
            .filter(|c| !primary_keys.contains(c))
            .map(|c| {
                let quoted = self.dialect.quote_identifier(c);
                format!("{} = EXCLUDED.{}", quoted, quoted)
            })
            .collect();

        if assignments.is_empty() {
            format!(" ON CONFLICT ({}) DO NOTHING", target.join(", "))
        } else {
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                target.join(", "),
                assignments.join(", ")
            )
        }
    }
}

fn join_clauses(insert: &str, values: &str, conflict: &str) -> String {
    format!("{} {}{}", insert, values, conflict)
}

/// Reusable upsert text for one relation, column set and batch size
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    relation: String,
    columns: Vec<String>,
    primary_keys: Vec<String>,
    batch_size: usize,
    insert_clause: String,
    values_clause: String,
    conflict_clause: String,
    statement: NamedStatement,
}

impl CommandTemplate {
    /// Target relation
    pub fn relation(&self) -> &str {
        &self.relation
    }

    /// Written columns, in schema order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Conflict target
    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    /// Rows per full batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// `INSERT INTO ... VALUES`
    pub fn insert_clause(&self) -> &str {
        &self.insert_clause
    }

    /// Values clause sized to a full batch
    pub fn values_clause(&self) -> &str {
        &self.values_clause
    }

    /// ` ON CONFLICT ...`, empty without a primary key
    pub fn conflict_clause(&self) -> &str {
        &self.conflict_clause
    }

    /// Full-batch command text with named placeholders
    pub fn text(&self) -> String {
        join_clauses(&self.insert_clause, &self.values_clause, &self.conflict_clause)
    }

    /// Compiled statement for `row_count` rows.
    ///
    /// A full batch borrows the precompiled statement; any other size builds
    /// a one-off statement from the same insert and conflict clauses.
    pub fn statement_for(
        &self,
        builder: &UpsertCommandBuilder,
        row_count: usize,
    ) -> Cow<'_, NamedStatement> {
        if row_count == self.batch_size {
            return Cow::Borrowed(&self.statement);
        }
        let values = builder.build_values_clause(&self.columns, row_count);
        Cow::Owned(NamedStatement::compile(
            builder.dialect(),
            &join_clauses(&self.insert_clause, &values, &self.conflict_clause),
        ))
    }

    /// Positional parameters for `rows`, each holding one value per column
    /// in template column order.
    pub fn bind(&self, statement: &NamedStatement, rows: &[Vec<Value>]) -> Result<Vec<Value>> {
        let mut cells: HashMap<String, Value> =
            HashMap::with_capacity(rows.len() * self.columns.len());
        for (row_index, row) in rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(Error::Internal {
                    message: format!(
                        "row {} has {} values for {} columns",
                        row_index,
                        row.len(),
                        self.columns.len()
                    ),
                });
            }
            for (position, (column, value)) in self.columns.iter().zip(row).enumerate() {
                cells.insert(placeholder_name(column, position, row_index), value.clone());
            }
        }
        statement.bind(|name| cells.remove(name))
    }
}

/// Key identifying a cached template
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    /// Target relation
    pub relation: String,
    /// Primary key names of the snapshot the template was built from
    pub primary_keys: Vec<String>,
    /// Rows per full batch
    pub batch_size: usize,
    /// Written columns
    pub columns: Vec<String>,
}

/// Full-batch templates, dropped whenever the schema changes
#[derive(Default)]
pub struct TemplateCache {
    snapshot: Option<Arc<SchemaSnapshot>>,
    templates: HashMap<TemplateKey, Arc<CommandTemplate>>,
}

impl TemplateCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached templates
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Cached template for `columns` of `snapshot`, building it on a miss
    pub fn get_or_build(
        &mut self,
        builder: &UpsertCommandBuilder,
        snapshot: &Arc<SchemaSnapshot>,
        columns: &[usize],
        batch_size: usize,
    ) -> Arc<CommandTemplate> {
        let changed = match &self.snapshot {
            Some(current) => !current.same_shape(snapshot),
            None => true,
        };
        if changed {
            if !self.templates.is_empty() {
                debug!(
                    relation = %snapshot.relation(),
                    discarded = self.templates.len(),
                    "Schema changed, discarding command templates"
                );
            }
            self.templates.clear();
            self.snapshot = Some(Arc::clone(snapshot));
        }

        let key = TemplateKey {
            relation: snapshot.relation().to_string(),
            primary_keys: snapshot.primary_key_names().to_vec(),
            batch_size,
            columns: columns
                .iter()
                .map(|&i| snapshot.columns()[i].name.clone())
                .collect(),
        };
        Arc::clone(
            self.templates
                .entry(key)
                .or_insert_with(|| Arc::new(builder.build_template_for(snapshot, columns, batch_size))),
        )
    }
}
