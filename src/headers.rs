// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Header Conversion
//!
//! Handlers and schemas see headers as JSON; the broker sees AMQP field
//! tables. This module converts between the two.

use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// Converts a JSON value into the closest AMQP field value.
pub fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else if let Some(u) = n.as_u64() {
                AMQPValue::Timestamp(u)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(json_to_amqp).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(FieldTable::from(json_to_table(map))),
    }
}

/// Converts a JSON object into AMQP headers.
pub fn json_to_table(map: &Map<String, Value>) -> BTreeMap<ShortString, AMQPValue> {
    map.iter()
        .map(|(key, value)| (ShortString::from(key.clone()), json_to_amqp(value)))
        .collect()
}

/// Converts an AMQP field value into JSON.
pub fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(u) => Value::from(*u),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(u) => Value::from(*u),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(u) => Value::from(*u),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(*f as f64).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::DecimalValue(d) => {
            let value = d.value as f64 / 10f64.powi(d.scale as i32);
            Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
        }
        AMQPValue::ShortString(s) => Value::String(s.as_str().to_owned()),
        AMQPValue::LongString(s) => Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(arr) => Value::Array(arr.as_slice().iter().map(amqp_to_json).collect()),
        AMQPValue::FieldTable(table) => table_to_json(table),
        AMQPValue::ByteArray(bytes) => Value::Array(bytes.as_slice().iter().map(|b| Value::from(*b)).collect()),
        AMQPValue::Void => Value::Null,
    }
}

/// Converts AMQP headers into a JSON object.
pub fn table_to_json(table: &FieldTable) -> Value {
    Value::Object(
        table
            .inner()
            .iter()
            .map(|(key, value)| (key.as_str().to_owned(), amqp_to_json(value)))
            .collect(),
    )
}

/// Reads any AMQP integer flavour as `i64`.
pub fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(i) => Some(*i as i64),
        AMQPValue::ShortShortUInt(u) => Some(*u as i64),
        AMQPValue::ShortInt(i) => Some(*i as i64),
        AMQPValue::ShortUInt(u) => Some(*u as i64),
        AMQPValue::LongInt(i) => Some(*i as i64),
        AMQPValue::LongUInt(u) => Some(*u as i64),
        AMQPValue::LongLongInt(i) => Some(*i),
        AMQPValue::Timestamp(t) => i64::try_from(*t).ok(),
        _ => None,
    }
}

/// Reads a short or long string header.
pub fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_headers_survive_the_field_table() {
        let headers = json!({
            "tenant": "acme",
            "priority": 3,
            "flags": [true, false],
            "meta": { "source": "api" }
        });

        let table = FieldTable::from(json_to_table(headers.as_object().unwrap()));
        assert_eq!(table_to_json(&table), headers);
    }

    #[test]
    fn reads_every_integer_flavour() {
        assert_eq!(as_i64(&AMQPValue::ShortInt(3)), Some(3));
        assert_eq!(as_i64(&AMQPValue::LongUInt(7)), Some(7));
        assert_eq!(as_i64(&AMQPValue::LongLongInt(-1)), Some(-1));
        assert_eq!(as_i64(&AMQPValue::Boolean(true)), None);
    }
}
