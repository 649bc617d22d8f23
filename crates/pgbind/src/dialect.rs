//! SQL dialect abstraction for pgbind
//!
//! - SqlDialect: identifier quoting, placeholders and catalog queries
//! - NamedStatement: `@name` placeholders rewritten to positional ones

use crate::error::{Error, Result};
use crate::types::Value;

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Quote an identifier (column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a 1-based parameter index
    fn placeholder(&self, index: usize) -> String;

    /// Catalog query describing the columns of one relation.
    ///
    /// Takes the relation name as its only parameter and returns, in column
    /// order, `column_name`, `data_type`, `is_primary_key`, `not_null` and
    /// `has_default`. A relation that does not exist yields no rows.
    fn column_metadata_sql(&self) -> &'static str;
}

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

const PG_COLUMN_METADATA_SQL: &str = r#"SELECT
    a.attname AS column_name,
    format_type(a.atttypid, a.atttypmod) AS data_type,
    COALESCE(a.attnum = ANY(i.indkey), FALSE) AS is_primary_key,
    a.attnotnull AS not_null,
    (a.atthasdef OR a.attidentity <> '' OR a.attgenerated <> '') AS has_default
FROM pg_attribute a
LEFT JOIN pg_index i ON i.indrelid = a.attrelid AND i.indisprimary
WHERE a.attrelid = to_regclass($1)
    AND a.attnum > 0
    AND NOT a.attisdropped
ORDER BY a.attnum"#;

impl SqlDialect for PostgresDialect {
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn column_metadata_sql(&self) -> &'static str {
        PG_COLUMN_METADATA_SQL
    }
}

/// A statement whose `@name` placeholders were rewritten to positional ones.
///
/// Each distinct name gets one position, in order of first appearance, so a
/// name used twice binds a single value. Placeholders inside string
/// literals, quoted identifiers, dollar-quoted bodies and comments are left
/// alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStatement {
    sql: String,
    names: Vec<String>,
}

impl NamedStatement {
    /// Rewrite every `@name` placeholder in `sql`.
    pub fn compile(dialect: &dyn SqlDialect, sql: &str) -> Self {
        Self::compile_with(dialect, sql, |_| true)
    }

    /// Rewrite only the placeholders for which `is_bound` returns true;
    /// other `@` sequences (operators such as `@>`, stray names) are kept.
    pub fn compile_with<F>(dialect: &dyn SqlDialect, sql: &str, is_bound: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        let bytes = sql.as_bytes();
        let mut out = String::with_capacity(sql.len());
        let mut names: Vec<String> = Vec::new();
        let mut copied = 0;
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'\'' => i = skip_quoted(bytes, i, false),
                b'"' => i = skip_quoted(bytes, i, false),
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    i = sql[i..].find('\n').map_or(bytes.len(), |n| i + n + 1);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
                b'$' => i = skip_dollar_quoted(sql, i).unwrap_or(i + 1),
                b'@' if bytes.get(i + 1).is_some_and(|b| is_ident_start(*b)) => {
                    let start = i + 1;
                    let end = scan_ident(bytes, start);
                    let name = &sql[start..end];
                    if is_bound(name) {
                        out.push_str(&sql[copied..i]);
                        let position = match names.iter().position(|n| n == name) {
                            Some(p) => p,
                            None => {
                                names.push(name.to_string());
                                names.len() - 1
                            }
                        };
                        out.push_str(&dialect.placeholder(position + 1));
                        copied = end;
                    }
                    i = end;
                }
                b if is_ident_start(b) => {
                    let end = scan_ident(bytes, i);
                    // E'...' strings allow backslash escapes
                    if end == i + 1 && matches!(b, b'E' | b'e') && bytes.get(end) == Some(&b'\'') {
                        i = skip_quoted(bytes, end, true);
                    } else {
                        i = end;
                    }
                }
                _ => i += 1,
            }
        }

        out.push_str(&sql[copied..]);
        Self { sql: out, names }
    }

    /// Positional SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names, indexed by position - 1
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of positional parameters
    pub fn parameter_count(&self) -> usize {
        self.names.len()
    }

    /// Produce the positional parameter list by looking up every name.
    ///
    /// Fails with a configuration error naming the first placeholder that
    /// has no value.
    pub fn bind<F>(&self, mut lookup: F) -> Result<Vec<Value>>
    where
        F: FnMut(&str) -> Option<Value>,
    {
        self.names
            .iter()
            .map(|name| {
                lookup(name).ok_or_else(|| {
                    Error::config(format!("no value supplied for parameter '@{}'", name))
                })
            })
            .collect()
    }
}

#[inline]
fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

#[inline]
fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn scan_ident(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() && is_ident_byte(bytes[end]) {
        end += 1;
    }
    end
}

/// Skip a `'...'` or `"..."` token starting at `start`; a doubled quote
/// stays inside the token. Returns the index after the closing quote.
fn skip_quoted(bytes: &[u8], start: usize, backslash_escapes: bool) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if backslash_escapes && b == b'\\' {
            i += 2;
            continue;
        }
        if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Block comments nest in PostgreSQL.
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// `$tag$ ... $tag$`; returns `None` when `$` does not open a dollar quote
/// (for example a positional `$1`).
fn skip_dollar_quoted(sql: &str, start: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut j = start + 1;
    if j < bytes.len() && is_ident_start(bytes[j]) {
        while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
            j += 1;
        }
    }
    if bytes.get(j) != Some(&b'$') {
        return None;
    }
    let delimiter = &sql[start..=j];
    let body = j + 1;
    Some(
        sql[body..]
            .find(delimiter)
            .map_or(bytes.len(), |n| body + n + delimiter.len()),
    )
}
