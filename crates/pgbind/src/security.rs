//! Identifier validation for pgbind.
//!
//! Relation names and parameter names are the only caller-controlled text
//! that ends up inside generated SQL, so both are checked against strict
//! character rules before any statement is built.

use crate::error::Error;

/// Validate a relation identifier supplied through a binding.
///
/// Accepts only non-empty names made of ASCII letters, digits, underscores
/// and periods (`^[A-Za-z0-9_.]+$`), which covers plain and
/// schema-qualified names such as `public.products`. Anything else is
/// rejected with [`Error::InvalidName`] listing the offending characters.
///
/// # Examples
///
/// ```
/// use pgbind::security::validate_table_name;
///
/// assert!(validate_table_name("products").is_ok());
/// assert!(validate_table_name("public.products").is_ok());
///
/// // Rejects injection attempts
/// assert!(validate_table_name("products; DROP TABLE x").is_err());
/// assert!(validate_table_name("").is_err());
/// ```
pub fn validate_table_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: String::new(),
            reason: "relation name cannot be empty".into(),
        });
    }

    let mut offending: Vec<char> = Vec::new();
    for c in name.chars() {
        if !is_table_name_char(c) && !offending.contains(&c) {
            offending.push(c);
        }
    }

    if offending.is_empty() {
        return Ok(());
    }

    let listed: Vec<String> = offending.iter().map(|c| format!("{:?}", c)).collect();
    Err(Error::InvalidName {
        name: name.to_string(),
        reason: format!(
            "contains characters outside [A-Za-z0-9_.]: {}",
            listed.join(", ")
        ),
    })
}

#[inline]
fn is_table_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Validate a parameter name (the part after `@`).
///
/// Must start with an ASCII letter or underscore and continue with ASCII
/// alphanumerics or underscores, at most 63 characters (PostgreSQL's
/// identifier length). Names outside this rule could never be matched
/// against a placeholder in the query text.
///
/// # Examples
///
/// ```
/// use pgbind::security::validate_parameter_name;
///
/// assert!(validate_parameter_name("product_id").is_ok());
/// assert!(validate_parameter_name("1st").is_err());
/// assert!(validate_parameter_name("a b").is_err());
/// ```
pub fn validate_parameter_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::parse("parameter name cannot be empty"));
    }

    if name.len() > 63 {
        return Err(Error::parse(format!(
            "parameter name too long: {} chars (max 63)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::parse(format!(
                "invalid parameter name '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::parse(format!(
                "invalid parameter name '{}': contains invalid character {:?}",
                name, c
            )));
        }
    }

    Ok(())
}
