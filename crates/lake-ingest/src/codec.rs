// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload codec.
//!
//! Decodes raw MQTT payload bytes into a JSON document and a tagged
//! `value`. Decoding happens in three steps, each with its own failure:
//!
//! ```text
//! bytes --utf8--> text --json--> object --lookup("value")--> ReadingValue
//!        Encoding         Format/NotAnObject          MissingField
//! ```

use serde_json::{Number, Value};
use thiserror::Error;

/// Name of the field carrying the sensor reading.
pub const VALUE_FIELD: &str = "value";

/// Why a payload could not be decoded.
///
/// A decode failure is permanent: the same bytes will never decode, so the
/// message is logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("payload is not a well-formed JSON document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),

    #[error("payload has no `value` field")]
    MissingField,
}

/// Coarse failure category, used for log lines and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    Encoding,
    Format,
    MissingField,
}

impl DecodeError {
    /// Category of this failure. A non-object document is a format error.
    pub fn kind(&self) -> DecodeErrorKind {
        match self {
            Self::Encoding(_) => DecodeErrorKind::Encoding,
            Self::Format(_) | Self::NotAnObject(_) => DecodeErrorKind::Format,
            Self::MissingField => DecodeErrorKind::MissingField,
        }
    }
}

/// The `value` field of a payload, tagged by its JSON source type.
///
/// Numbers keep the type they were written with: `42` is `Integer`,
/// `42.0` and `4.2e1` are `Real`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingValue {
    Integer(i64),
    Real(f64),
    /// Number outside the range of its type (kept as written).
    OutOfRange(String),
    Bool(bool),
    Text(String),
    Null,
    Array,
    Object,
}

impl ReadingValue {
    /// Tag a JSON value.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => Self::from_number(n),
            Value::Bool(b) => Self::Bool(*b),
            Value::String(s) => Self::Text(s.clone()),
            Value::Null => Self::Null,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    fn from_number(n: &Number) -> Self {
        if let Some(i) = n.as_i64() {
            return Self::Integer(i);
        }

        // Numbers keep their literal text, so an integer too wide for i64
        // is still recognisable as an integer here.
        let literal = n.to_string();
        if is_integer_literal(&literal) {
            return Self::OutOfRange(literal);
        }
        match n.as_f64() {
            Some(f) => Self::Real(f),
            None => Self::OutOfRange(literal),
        }
    }

    /// Short type name for log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "int",
            Self::Real(_) => "float",
            Self::OutOfRange(_) => "out-of-range number",
            Self::Bool(_) => "bool",
            Self::Text(_) => "str",
            Self::Null => "null",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// A successfully decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// The full document as received (always a JSON object).
    pub document: Value,
    /// The tagged `value` field.
    pub value: ReadingValue,
}

/// Decode a raw payload.
pub fn decode(raw: &[u8]) -> Result<DecodedPayload, DecodeError> {
    let text = std::str::from_utf8(raw)?;
    let document: Value = serde_json::from_str(text)?;

    let value = match &document {
        Value::Object(fields) => fields
            .get(VALUE_FIELD)
            .map(ReadingValue::from_json)
            .ok_or(DecodeError::MissingField)?,
        other => return Err(DecodeError::NotAnObject(json_type_name(other))),
    };

    Ok(DecodedPayload { document, value })
}

fn is_integer_literal(literal: &str) -> bool {
    let digits = literal.strip_prefix('-').unwrap_or(literal);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_integer_payload() {
        let decoded = decode(br#"{"value": 42, "unit": "C"}"#).unwrap();
        assert_eq!(decoded.value, ReadingValue::Integer(42));
        assert_eq!(decoded.document, json!({"value": 42, "unit": "C"}));
    }

    #[test]
    fn test_decode_keeps_source_number_type() {
        match decode(br#"{"value": 21.75}"#).unwrap().value {
            ReadingValue::Real(v) => assert!((v - 21.75).abs() < 1e-9),
            other => panic!("expected real, got {:?}", other),
        }
        assert_eq!(decode(br#"{"value": 3.0}"#).unwrap().value, ReadingValue::Real(3.0));
        assert_eq!(decode(br#"{"value": 1e2}"#).unwrap().value, ReadingValue::Real(100.0));
        assert_eq!(decode(br#"{"value": -7}"#).unwrap().value, ReadingValue::Integer(-7));
    }

    #[test]
    fn test_decode_large_unsigned_is_out_of_range() {
        let decoded = decode(br#"{"value": 18446744073709551615}"#).unwrap();
        assert_eq!(
            decoded.value,
            ReadingValue::OutOfRange("18446744073709551615".to_string())
        );
    }

    #[test]
    fn test_decode_wide_integer_is_not_real() {
        let decoded = decode(br#"{"value": 100000000000000000000000}"#).unwrap();
        assert_eq!(
            decoded.value,
            ReadingValue::OutOfRange("100000000000000000000000".to_string())
        );
        assert_eq!(
            decode(br#"{"value": -9223372036854775809}"#).unwrap().value,
            ReadingValue::OutOfRange("-9223372036854775809".to_string())
        );
    }

    #[test]
    fn test_decode_non_numeric_values() {
        assert_eq!(decode(br#"{"value": true}"#).unwrap().value, ReadingValue::Bool(true));
        assert_eq!(
            decode(br#"{"value": "hot"}"#).unwrap().value,
            ReadingValue::Text("hot".to_string())
        );
        assert_eq!(decode(br#"{"value": null}"#).unwrap().value, ReadingValue::Null);
        assert_eq!(decode(br#"{"value": [1, 2]}"#).unwrap().value, ReadingValue::Array);
        assert_eq!(decode(br#"{"value": {"a": 1}}"#).unwrap().value, ReadingValue::Object);
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode(&[0xff, 0xfe, 0x7b]).unwrap_err();
        assert!(matches!(err, DecodeError::Encoding(_)));
        assert_eq!(err.kind(), DecodeErrorKind::Encoding);
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode(b"not-json").unwrap_err();
        assert!(matches!(err, DecodeError::Format(_)));
        assert_eq!(err.kind(), DecodeErrorKind::Format);
    }

    #[test]
    fn test_decode_top_level_not_object() {
        let err = decode(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject("array")));
        assert_eq!(err.kind(), DecodeErrorKind::Format);

        let err = decode(b"42").unwrap_err();
        assert!(matches!(err, DecodeError::NotAnObject("number")));
    }

    #[test]
    fn test_decode_missing_value_field() {
        let err = decode(br#"{"temperature": 21}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField));
        assert_eq!(err.kind(), DecodeErrorKind::MissingField);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(ReadingValue::Integer(1).type_name(), "int");
        assert_eq!(ReadingValue::Real(1.0).type_name(), "float");
        assert_eq!(ReadingValue::Bool(false).type_name(), "bool");
        assert_eq!(ReadingValue::Null.type_name(), "null");
    }
}
