//! Unit tests for pgbind types module

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use pgbind::types::{Row, Value, TIMESTAMP_FORMAT};
use rust_decimal::Decimal;

#[test]
fn test_value_null() {
    let v = Value::Null;
    assert!(v.is_null());
    assert_eq!(v.as_str(), None);
    assert_eq!(v.as_i64(), None);
    assert_eq!(v.as_f64(), None);
    assert_eq!(v.as_bool(), None);
    assert_eq!(v.as_string(), None);
}

#[test]
fn test_value_boolean() {
    let v = Value::Bool(true);
    assert!(!v.is_null());
    assert_eq!(v.as_bool(), Some(true));

    let v = Value::Bool(false);
    assert_eq!(v.as_bool(), Some(false));
}

#[test]
fn test_value_integer_types() {
    let v = Value::Int16(-100);
    assert_eq!(v.as_i64(), Some(-100));

    let v = Value::Int32(1_000_000);
    assert_eq!(v.as_i64(), Some(1_000_000));

    let v = Value::Int64(9_000_000_000_000);
    assert_eq!(v.as_i64(), Some(9_000_000_000_000));

    let v = Value::Decimal(Decimal::new(1200, 2));
    assert_eq!(v.as_i64(), Some(12));
}

#[test]
fn test_value_float_types() {
    let v = Value::Float32(1.5);
    assert!((v.as_f64().unwrap() - 1.5).abs() < 0.01);

    let v = Value::Float64(2.5);
    assert!((v.as_f64().unwrap() - 2.5).abs() < 0.00001);
    assert_eq!(v.as_i64(), None);
}

#[test]
fn test_value_string() {
    let v = Value::String("hello world".to_string());
    assert_eq!(v.as_str(), Some("hello world"));
    assert_eq!(v.as_string(), Some("hello world".to_string()));

    // Parameter literals arrive as text
    assert_eq!(Value::String("42".into()).as_i64(), Some(42));
}

#[test]
fn test_value_bytes() {
    let data = vec![0u8, 1, 2, 3, 4, 5];
    let v = Value::Bytes(data.clone());
    assert_eq!(v.as_bytes(), Some(&data[..]));
    assert_eq!(v.to_json(), serde_json::json!("AAECAwQF"));
}

#[test]
fn test_value_date_time() {
    let date = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
    let time = NaiveTime::from_hms_opt(14, 30, 45).unwrap();
    let datetime = NaiveDateTime::new(date, time);

    assert_eq!(Value::Date(date).as_date(), Some(date));
    assert_eq!(Value::Time(time).as_time(), Some(time));
    assert_eq!(Value::DateTime(datetime).as_date(), Some(date));
    assert_eq!(
        Value::DateTime(datetime).as_timestamp(),
        Some(Utc.from_utc_datetime(&datetime))
    );
    assert_eq!(Value::String("2024-12-25".into()).as_date(), Some(date));
}

#[test]
fn test_timestamps_serialize_with_millis() {
    let datetime = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_micro_opt(3, 4, 5, 123_456)
        .unwrap();

    assert_eq!(
        Value::DateTime(datetime).to_json(),
        serde_json::json!("2024-01-02T03:04:05.123Z")
    );
    assert_eq!(
        Value::DateTimeTz(Utc.from_utc_datetime(&datetime)).to_json(),
        serde_json::json!(datetime.format(TIMESTAMP_FORMAT).to_string())
    );
}

#[test]
fn test_value_uuid() {
    let uuid = uuid::Uuid::from_u128(0x67e5_5044_10b1_426f_9247_bb68_0e5f_e0c8);
    let v = Value::Uuid(uuid);
    assert_eq!(v.as_uuid(), Some(uuid));
    assert_eq!(Value::String(uuid.to_string()).as_uuid(), Some(uuid));
}

#[test]
fn test_value_json() {
    let json_val = serde_json::json!({"name": "test", "count": 42});
    let v = Value::Json(json_val.clone());
    assert_eq!(v.as_json(), Some(&json_val));
    assert_eq!(v.to_json(), json_val);
}

#[test]
fn test_value_from_json() {
    assert_eq!(Value::from_json(serde_json::json!(null)), Value::Null);
    assert_eq!(Value::from_json(serde_json::json!(7)), Value::Int64(7));
    assert_eq!(Value::from_json(serde_json::json!("x")), Value::String("x".into()));
    assert_eq!(
        Value::from_json(serde_json::json!([1, 2])),
        Value::Json(serde_json::json!([1, 2]))
    );
}

#[test]
fn test_numeric_keeps_exact_digits() {
    let price: Decimal = "12345678901234567.89".parse().unwrap();
    let row = Row::new(vec!["price".to_string()], vec![Value::Decimal(price)]);
    assert_eq!(
        serde_json::to_string(&row.to_json()).unwrap(),
        r#"{"price":12345678901234567.89}"#
    );

    let record: serde_json::Value =
        serde_json::from_str(r#"{"p": 0.1000000000000000000001}"#).unwrap();
    let value = Value::from_json(record["p"].clone());
    assert_eq!(
        value,
        Value::Decimal("0.1000000000000000000001".parse().unwrap())
    );
    assert_eq!(value.to_json().to_string(), "0.1000000000000000000001");

    // Scale survives as well as magnitude
    assert_eq!(Value::Decimal(Decimal::new(500, 2)).to_json().to_string(), "5.00");
}

#[test]
fn test_value_sql_type() {
    assert_eq!(Value::Int64(1).sql_type(), "BIGINT");
    assert_eq!(Value::String(String::new()).sql_type(), "TEXT");
    assert_eq!(Value::Json(serde_json::json!({})).sql_type(), "JSONB");
}

#[test]
fn test_row_get_by_index() {
    let columns = vec!["id".to_string(), "name".to_string(), "age".to_string()];
    let values = vec![
        Value::Int32(1),
        Value::String("Alice".to_string()),
        Value::Int32(30),
    ];

    let row = Row::new(columns, values);

    assert_eq!(row.len(), 3);
    assert!(!row.is_empty());

    assert_eq!(row.get(0).and_then(|v| v.as_i64()), Some(1));
    assert_eq!(row.get(1).and_then(|v| v.as_str()), Some("Alice"));
    assert_eq!(row.get(2).and_then(|v| v.as_i64()), Some(30));
    assert!(row.get(3).is_none());
}

#[test]
fn test_row_get_by_name() {
    let row = Row::new(
        vec!["id".to_string(), "Name".to_string()],
        vec![Value::Int32(1), Value::String("Alice".to_string())],
    );

    assert_eq!(row.get_by_name("name").and_then(|v| v.as_str()), Some("Alice"));
    assert_eq!(row.get_by_name("ID").and_then(|v| v.as_i64()), Some(1));
    assert!(row.get_by_name("missing").is_none());
}

#[test]
fn test_row_to_json_keeps_column_order() {
    let row = Row::new(
        vec!["z".to_string(), "a".to_string(), "m".to_string()],
        vec![Value::Int32(1), Value::Null, Value::Bool(true)],
    );

    assert_eq!(
        serde_json::to_string(&row.to_json()).unwrap(),
        r#"{"z":1,"a":null,"m":true}"#
    );
}

#[test]
fn test_value_from_primitives() {
    let v: Value = 42i32.into();
    assert_eq!(v.as_i64(), Some(42));

    let v: Value = "hello".into();
    assert_eq!(v.as_str(), Some("hello"));

    let v: Value = true.into();
    assert_eq!(v.as_bool(), Some(true));
}

#[test]
fn test_value_serialization() {
    let v = Value::String("test".to_string());
    let json = serde_json::to_string(&v).unwrap();
    assert!(json.contains("test"));

    let v2: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(v, v2);
}

#[test]
fn test_row_into_map() {
    let columns = vec!["id".to_string(), "name".to_string()];
    let values = vec![Value::Int32(1), Value::String("Alice".to_string())];

    let row = Row::new(columns, values);
    let map = row.into_map();

    assert_eq!(map.get("id").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(map.get("name").and_then(|v| v.as_str()), Some("Alice"));
}
