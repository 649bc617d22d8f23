//! Records written through the upsert engine.
//!
//! A [`Record`] hands over its fields as an ordered list of
//! `(name, value)` pairs. Field names are matched against the table's
//! columns ignoring ASCII case.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// A caller record that can be written to a table
pub trait Record: Send + Sync + 'static {
    /// Fields present on this record, in a stable order
    fn fields(&self) -> Result<Vec<(String, Value)>>;
}

impl Record for serde_json::Value {
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        match self {
            serde_json::Value::Object(map) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v.clone())))
                .collect()),
            other => Err(Error::validity(format!(
                "expected a JSON object, got {}",
                json_kind(other)
            ))),
        }
    }
}

impl Record for Row {
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        Ok(self
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect())
    }
}

impl Record for Vec<(String, Value)> {
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.clone())
    }
}

impl Record for BTreeMap<String, Value> {
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Field order follows `HashMap` iteration and may vary between calls;
/// columns are still written in table order.
impl Record for HashMap<String, Value> {
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        Ok(self.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Adapter writing any `Serialize` struct as a record.
///
/// The struct is serialized to a JSON object; its serde field names are
/// the record's field names.
///
/// ```
/// use pgbind::record::{Json, Record};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Product { product_id: i32, name: String }
///
/// let fields = Json(Product { product_id: 1, name: "Cup".into() }).fields().unwrap();
/// assert_eq!(fields[0].0, "product_id");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Record for Json<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn fields(&self) -> Result<Vec<(String, Value)>> {
        let json = serde_json::to_value(&self.0)
            .map_err(|e| Error::validity(format!("record is not serializable: {}", e)))?;
        json.fields()
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
