//! Parameter mini-language for parameterized read queries.
//!
//! A binding supplies its query parameters as one string:
//!
//! ```text
//! @id=42,@name=,@deleted_at=null
//! ```
//!
//! `null` (any casing) binds SQL NULL, a missing value after `=` binds the
//! empty string, and any other text is bound verbatim as a literal.

use std::fmt;

use crate::error::{Error, Result};
use crate::security::validate_parameter_name;
use crate::types::Value;

/// How a parameter's value was spelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterKind {
    /// Verbatim text
    Literal(String),
    /// `null` in any casing
    Null,
    /// Nothing after `=`
    EmptyString,
}

/// A parsed `@name=value` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedParameter {
    /// Name without the leading `@`
    pub name: String,
    /// Parsed value
    pub kind: ParameterKind,
}

impl NamedParameter {
    /// Value bound for this parameter
    pub fn value(&self) -> Value {
        match &self.kind {
            ParameterKind::Literal(text) => Value::String(text.clone()),
            ParameterKind::Null => Value::Null,
            ParameterKind::EmptyString => Value::String(String::new()),
        }
    }
}

impl fmt::Display for NamedParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParameterKind::Literal(text) => write!(f, "@{}={}", self.name, text),
            ParameterKind::Null => write!(f, "@{}=null", self.name),
            ParameterKind::EmptyString => write!(f, "@{}=", self.name),
        }
    }
}

/// Parse a parameter string into named parameters, in order of appearance.
///
/// An empty or absent string yields no parameters. Empty fragments between
/// commas are skipped. Every other fragment must be exactly `@name=value`
/// with a single `=`; anything else fails with [`Error::Parse`].
///
/// # Examples
///
/// ```
/// use pgbind::params::{parse_parameters, ParameterKind};
///
/// let params = parse_parameters(Some("@a=1,@b=,@c=null")).unwrap();
/// assert_eq!(params[0].kind, ParameterKind::Literal("1".into()));
/// assert_eq!(params[1].kind, ParameterKind::EmptyString);
/// assert_eq!(params[2].kind, ParameterKind::Null);
///
/// assert!(parse_parameters(Some("a=1")).is_err());
/// assert!(parse_parameters(None).unwrap().is_empty());
/// ```
pub fn parse_parameters(spec: Option<&str>) -> Result<Vec<NamedParameter>> {
    let Some(spec) = spec else {
        return Ok(Vec::new());
    };

    let mut parameters = Vec::new();
    for fragment in spec.split(',').filter(|f| !f.is_empty()) {
        let parameter = parse_fragment(fragment)?;
        if parameters
            .iter()
            .any(|p: &NamedParameter| p.name == parameter.name)
        {
            return Err(Error::parse(format!(
                "parameter '@{}' is specified more than once",
                parameter.name
            )));
        }
        parameters.push(parameter);
    }
    Ok(parameters)
}

fn parse_fragment(fragment: &str) -> Result<NamedParameter> {
    let parts: Vec<&str> = fragment.split('=').collect();
    if parts.len() != 2 {
        return Err(Error::parse(format!(
            "'{}' must have the form @name=value with exactly one '='",
            fragment
        )));
    }

    let Some(name) = parts[0].strip_prefix('@') else {
        return Err(Error::parse(format!(
            "parameter name '{}' must start with '@'",
            parts[0]
        )));
    };
    validate_parameter_name(name)?;

    let kind = match parts[1] {
        "" => ParameterKind::EmptyString,
        v if v.eq_ignore_ascii_case("null") => ParameterKind::Null,
        v => ParameterKind::Literal(v.to_string()),
    };

    Ok(NamedParameter {
        name: name.to_string(),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_kinds_in_order() {
        let params = parse_parameters(Some("@a=1,@b=,@c=null")).unwrap();
        assert_eq!(
            params,
            vec![
                NamedParameter {
                    name: "a".into(),
                    kind: ParameterKind::Literal("1".into())
                },
                NamedParameter {
                    name: "b".into(),
                    kind: ParameterKind::EmptyString
                },
                NamedParameter {
                    name: "c".into(),
                    kind: ParameterKind::Null
                },
            ]
        );
    }

    #[test]
    fn test_empty_and_absent() {
        assert!(parse_parameters(None).unwrap().is_empty());
        assert!(parse_parameters(Some("")).unwrap().is_empty());
        assert!(parse_parameters(Some(",,")).unwrap().is_empty());
    }

    #[test]
    fn test_stray_commas_are_skipped() {
        let params = parse_parameters(Some(",@a=1,,@b=2,")).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].name, "b");
    }

    #[test]
    fn test_null_is_case_insensitive() {
        for spelling in ["null", "NULL", "Null", "nUlL"] {
            let params = parse_parameters(Some(&format!("@x={spelling}"))).unwrap();
            assert_eq!(params[0].kind, ParameterKind::Null);
        }
        // Only the bare word means NULL
        let params = parse_parameters(Some("@x=nullable")).unwrap();
        assert_eq!(params[0].kind, ParameterKind::Literal("nullable".into()));
    }

    #[test]
    fn test_malformed_fragments() {
        for bad in [
            "@a",
            "@a=1=2",
            "a=1",
            "=1",
            "@=1",
            "@a=1, @b=2",
            "@a b=1",
            "@a=1,@a=2",
        ] {
            let err = parse_parameters(Some(bad)).unwrap_err();
            assert!(
                matches!(err, Error::Parse { .. }),
                "expected parse error for {bad:?}, got {err}"
            );
        }
    }

    #[test]
    fn test_literal_is_verbatim() {
        let params = parse_parameters(Some("@name= padded ")).unwrap();
        assert_eq!(params[0].kind, ParameterKind::Literal(" padded ".into()));
        assert_eq!(params[0].value(), Value::String(" padded ".into()));
    }

    #[test]
    fn test_values() {
        let params = parse_parameters(Some("@a=1,@b=,@c=NULL")).unwrap();
        assert_eq!(params[0].value(), Value::String("1".into()));
        assert_eq!(params[1].value(), Value::String(String::new()));
        assert_eq!(params[2].value(), Value::Null);
    }

    #[test]
    fn test_display_round_trips() {
        let spec = "@a=1,@b=,@c=null";
        let params = parse_parameters(Some(spec)).unwrap();
        let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
        assert_eq!(rendered.join(","), spec);
    }
}
