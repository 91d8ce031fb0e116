//! Type coercion between native values and wire values.
//!
//! # Architecture
//!
//! Coercion uses a two-phase approach:
//! 1. The declared `ColumnKind` picks the handling: scalars convert directly,
//!    custom kinds are routed to a registered [`Coder`].
//! 2. The column's storage `WireType` decides what the driver binds or reads.
//!
//! Custom kinds without a coder fall back to base64 text for byte payloads.
//! Anything else is logged and written as NULL.

use crate::error::{DbError, DbResult};
use crate::models::value::{LIST_TYPE, MAP_TYPE, UUID_TYPE};
use crate::models::{ColumnKind, Value, WireType, WireValue};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// Text form of timestamps inside serialized containers.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Element separator of the pre-JSON list layout.
pub const LEGACY_LIST_DELIMITER: &str = "\u{c2}\u{b6}";
/// Absent element marker of the pre-JSON list layout.
pub const LEGACY_NULL: &str = "NULL";

const EMPTY_LIST: &str = "[]";
const EMPTY_MAP: &str = "[[null,null]]";

/// Encode/decode strategy for a custom column kind.
///
/// `args` are the generic arguments of the declared kind (e.g. the element
/// kind of a list). Coders may recurse into the registry for them.
pub trait Coder: Send + Sync {
    fn encode(&self, value: &Value, args: &[ColumnKind], coders: &CoderRegistry)
    -> DbResult<String>;

    fn decode(&self, text: &str, args: &[ColumnKind], coders: &CoderRegistry) -> DbResult<Value>;
}

/// Registry of coders keyed by type identifier.
#[derive(Clone)]
pub struct CoderRegistry {
    coders: HashMap<String, Arc<dyn Coder>>,
}

impl fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.coders.keys().collect();
        names.sort();
        f.debug_struct("CoderRegistry").field("coders", &names).finish()
    }
}

impl Default for CoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CoderRegistry {
    /// Registry with the built-in `list`, `map` and `uuid` coders.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(LIST_TYPE, ListCoder);
        registry.register(MAP_TYPE, MapCoder);
        registry.register(UUID_TYPE, UuidCoder);
        registry
    }

    pub fn empty() -> Self {
        Self {
            coders: HashMap::new(),
        }
    }

    /// Register or replace the coder for an identifier.
    pub fn register(&mut self, identifier: impl Into<String>, coder: impl Coder + 'static) {
        self.coders
            .insert(base_identifier(&identifier.into()).to_string(), Arc::new(coder));
    }

    /// Look up a coder. A generic suffix such as `<text,int>` is ignored.
    pub fn get(&self, identifier: &str) -> Option<Arc<dyn Coder>> {
        self.coders.get(base_identifier(identifier)).cloned()
    }

    /// Convert a native value into the wire value stored for `kind`.
    ///
    /// A missing coder is not fatal: it is logged and the column is written
    /// as NULL.
    pub fn to_wire(&self, value: &Value, kind: &ColumnKind, storage: WireType) -> DbResult<WireValue> {
        if value.is_null() && !kind.is_container() {
            return Ok(WireValue::Null(storage));
        }
        let result = match kind {
            ColumnKind::Custom(_) => self.encode_custom(value, kind).map(WireValue::Text),
            _ => scalar_to_wire(value, storage),
        };
        match result {
            Err(DbError::UnknownType { type_name }) => {
                error!(type_name = %type_name, "No coder for value, writing NULL");
                Ok(WireValue::Null(storage))
            }
            other => other,
        }
    }

    /// Convert a wire value read from the database back into a native value.
    pub fn from_wire(&self, wire: &WireValue, kind: &ColumnKind) -> DbResult<Value> {
        if let ColumnKind::Custom(_) = kind {
            return match wire {
                WireValue::Null(_) if kind.is_container() => self.decode_custom("", kind),
                WireValue::Null(_) => Ok(Value::Null),
                WireValue::Text(text) => self.decode_custom(text, kind),
                other => Err(DbError::decode(format!(
                    "expected text for {} but found {:?}",
                    kind,
                    other.wire_type()
                ))),
            };
        }
        scalar_from_wire(wire, kind)
    }

    fn encode_custom(&self, value: &Value, kind: &ColumnKind) -> DbResult<String> {
        let identifier = kind.identifier();
        if let Some(coder) = self.get(&identifier) {
            return coder.encode(value, kind.args(), self);
        }
        match value {
            Value::Bytes(bytes) => Ok(STANDARD.encode(bytes)),
            _ => Err(DbError::unknown_type(identifier)),
        }
    }

    fn decode_custom(&self, text: &str, kind: &ColumnKind) -> DbResult<Value> {
        let identifier = kind.identifier();
        if let Some(coder) = self.get(&identifier) {
            return coder.decode(text, kind.args(), self);
        }
        match STANDARD.decode(text) {
            Ok(bytes) => Ok(Value::Bytes(bytes)),
            Err(e) => {
                error!(type_name = %identifier, error = %e, "No coder for stored value, reading NULL");
                Ok(Value::Null)
            }
        }
    }
}

fn base_identifier(identifier: &str) -> &str {
    identifier
        .split_once('<')
        .map_or(identifier, |(base, _)| base)
        .trim()
}

// =============================================================================
// Scalars
// =============================================================================

fn cannot_store(value: &Value, storage: WireType) -> DbError {
    DbError::invalid_input(format!(
        "cannot store {} as {:?}",
        value.type_name(),
        storage
    ))
}

fn scalar_to_wire(value: &Value, storage: WireType) -> DbResult<WireValue> {
    let wire = match storage {
        WireType::Bool => match value {
            Value::Bool(b) => Some(WireValue::Bool(*b)),
            other => other.as_i64().map(|v| WireValue::Bool(v != 0)),
        },
        WireType::Int => match value {
            Value::Bool(b) => Some(WireValue::Int(i32::from(*b))),
            other => other
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(WireValue::Int),
        },
        WireType::BigInt => match value {
            Value::Bool(b) => Some(WireValue::BigInt(i64::from(*b))),
            other => other.as_i64().map(WireValue::BigInt),
        },
        WireType::Double => value.as_f64().map(WireValue::Double),
        WireType::Text => match value {
            Value::Text(s) => Some(WireValue::Text(s.clone())),
            Value::Char(c) => Some(WireValue::Text(c.to_string())),
            Value::Uuid(u) => Some(WireValue::Text(u.to_string())),
            _ => None,
        },
        WireType::Timestamp => match value {
            Value::Timestamp(ts) => Some(WireValue::Timestamp(*ts)),
            Value::Text(s) => parse_timestamp(s).ok().map(WireValue::Timestamp),
            _ => None,
        },
    };
    wire.ok_or_else(|| cannot_store(value, storage))
}

fn narrow(value: i64, kind: &ColumnKind) -> DbResult<Value> {
    let out_of_range = || DbError::decode(format!("{} out of range for {}", value, kind));
    Ok(match kind {
        ColumnKind::Byte => Value::Byte(i8::try_from(value).map_err(|_| out_of_range())?),
        ColumnKind::Short => Value::Short(i16::try_from(value).map_err(|_| out_of_range())?),
        ColumnKind::Int => Value::Int(i32::try_from(value).map_err(|_| out_of_range())?),
        _ => Value::Long(value),
    })
}

fn scalar_from_wire(wire: &WireValue, kind: &ColumnKind) -> DbResult<Value> {
    if wire.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = || {
        DbError::decode(format!(
            "cannot read {:?} as {}",
            wire.wire_type(),
            kind
        ))
    };
    match kind {
        ColumnKind::Boolean => match wire {
            WireValue::Bool(b) => Ok(Value::Bool(*b)),
            other => other.as_i64().map(|v| Value::Bool(v != 0)).ok_or_else(mismatch),
        },
        ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int | ColumnKind::Long => {
            let v = match wire {
                WireValue::Text(s) => s.trim().parse::<i64>().ok(),
                WireValue::Bool(b) => Some(i64::from(*b)),
                other => other.as_i64(),
            };
            narrow(v.ok_or_else(mismatch)?, kind)
        }
        ColumnKind::Float | ColumnKind::Double => {
            let v = match wire {
                WireValue::Double(d) => *d,
                other => other.as_i64().ok_or_else(mismatch)? as f64,
            };
            Ok(match kind {
                ColumnKind::Float => Value::Float(v as f32),
                _ => Value::Double(v),
            })
        }
        ColumnKind::Char => match wire {
            WireValue::Text(s) => Ok(s.chars().next().map_or(Value::Null, Value::Char)),
            _ => Err(mismatch()),
        },
        ColumnKind::Text => match wire {
            WireValue::Text(s) => Ok(Value::Text(s.clone())),
            _ => Err(mismatch()),
        },
        ColumnKind::Timestamp => match wire {
            WireValue::Timestamp(ts) => Ok(Value::Timestamp(*ts)),
            WireValue::Text(s) => parse_timestamp(s).map(Value::Timestamp),
            _ => Err(mismatch()),
        },
        ColumnKind::Custom(_) => Err(mismatch()),
    }
}

/// Parse the text form of a timestamp; the fractional part is optional.
pub fn parse_timestamp(text: &str) -> DbResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| DbError::decode(format!("invalid timestamp '{}': {}", text, e)))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

// =============================================================================
// Container elements
// =============================================================================

fn element_kind<'a>(args: &'a [ColumnKind], idx: usize) -> &'a ColumnKind {
    args.get(idx).unwrap_or(&ColumnKind::Text)
}

fn element_to_json(value: &Value, kind: &ColumnKind, coders: &CoderRegistry) -> DbResult<JsonValue> {
    if kind.is_container() {
        return Err(DbError::unsupported_nesting(kind.identifier()));
    }
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::List(_) | Value::Map(_) => {
            return Err(DbError::unsupported_nesting(value.type_name()));
        }
        _ if matches!(kind, ColumnKind::Custom(_)) => {
            JsonValue::String(coders.encode_custom(value, kind)?)
        }
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Float(f) => json_float(*f as f64),
        Value::Double(d) => json_float(*d),
        Value::Char(c) => JsonValue::String(c.to_string()),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Timestamp(ts) => JsonValue::String(format_timestamp(ts)),
        Value::Uuid(u) => JsonValue::String(u.to_string()),
        Value::Bytes(bytes) => JsonValue::String(STANDARD.encode(bytes)),
        other => match other.as_i64() {
            Some(v) => JsonValue::from(v),
            None => return Err(DbError::unknown_type(other.type_name())),
        },
    })
}

fn json_float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number)
}

fn element_from_json(json: &JsonValue, kind: &ColumnKind, coders: &CoderRegistry) -> DbResult<Value> {
    if kind.is_container() {
        return Err(DbError::unsupported_nesting(kind.identifier()));
    }
    let mismatch = || DbError::decode(format!("cannot read element {} as {}", json, kind));
    match json {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(DbError::unsupported_nesting(kind.identifier()))
        }
        JsonValue::String(text) => element_from_text(text, kind, coders),
        JsonValue::Bool(b) => match kind {
            ColumnKind::Boolean => Ok(Value::Bool(*b)),
            _ => Err(mismatch()),
        },
        JsonValue::Number(n) => match kind {
            ColumnKind::Boolean => n.as_i64().map(|v| Value::Bool(v != 0)).ok_or_else(mismatch),
            ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int | ColumnKind::Long => {
                let v = n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(mismatch)?;
                narrow(v, kind)
            }
            ColumnKind::Float => n.as_f64().map(|f| Value::Float(f as f32)).ok_or_else(mismatch),
            ColumnKind::Double => n.as_f64().map(Value::Double).ok_or_else(mismatch),
            ColumnKind::Text => Ok(Value::Text(n.to_string())),
            _ => Err(mismatch()),
        },
    }
}

/// Decode one element from its text form, as found in a JSON string or a
/// legacy delimited list.
fn element_from_text(text: &str, kind: &ColumnKind, coders: &CoderRegistry) -> DbResult<Value> {
    let invalid = |e: &dyn fmt::Display| {
        DbError::decode(format!("invalid {} element '{}': {}", kind, text, e))
    };
    match kind {
        ColumnKind::Boolean => Ok(Value::Bool(text.trim().eq_ignore_ascii_case("true"))),
        ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int | ColumnKind::Long => {
            let v = text.trim().parse::<i64>().map_err(|e| invalid(&e))?;
            narrow(v, kind)
        }
        ColumnKind::Float => text
            .trim()
            .parse::<f32>()
            .map(Value::Float)
            .map_err(|e| invalid(&e)),
        ColumnKind::Double => text
            .trim()
            .parse::<f64>()
            .map(Value::Double)
            .map_err(|e| invalid(&e)),
        ColumnKind::Char => Ok(text.chars().next().map_or(Value::Null, Value::Char)),
        ColumnKind::Text => Ok(Value::Text(text.to_string())),
        ColumnKind::Timestamp => parse_timestamp(text).map(Value::Timestamp),
        ColumnKind::Custom(_) if kind.is_container() => {
            Err(DbError::unsupported_nesting(kind.identifier()))
        }
        ColumnKind::Custom(_) => coders.decode_custom(text, kind),
    }
}

// =============================================================================
// Built-in coders
// =============================================================================

/// Lists stored as a JSON array. Also reads the legacy delimited layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListCoder;

impl Coder for ListCoder {
    fn encode(&self, value: &Value, args: &[ColumnKind], coders: &CoderRegistry) -> DbResult<String> {
        let items = match value {
            Value::Null => return Ok(EMPTY_LIST.to_string()),
            Value::List(items) => items,
            other => {
                return Err(DbError::invalid_input(format!(
                    "expected list but found {}",
                    other.type_name()
                )));
            }
        };
        let kind = element_kind(args, 0);
        let array = items
            .iter()
            .map(|item| element_to_json(item, kind, coders))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(JsonValue::Array(array).to_string())
    }

    fn decode(&self, text: &str, args: &[ColumnKind], coders: &CoderRegistry) -> DbResult<Value> {
        let kind = element_kind(args, 0);
        if kind.is_container() {
            return Err(DbError::unsupported_nesting(kind.identifier()));
        }
        if text.is_empty() || text.eq_ignore_ascii_case(LEGACY_NULL) {
            return Ok(Value::List(Vec::new()));
        }
        if !text.contains('[') && !text.contains(']') {
            return decode_legacy_list(text, kind, coders);
        }
        let json: JsonValue =
            serde_json::from_str(text).map_err(|e| DbError::decode(e.to_string()))?;
        let JsonValue::Array(array) = json else {
            return Err(DbError::decode(format!("expected JSON array, found {}", text)));
        };
        array
            .iter()
            .map(|item| element_from_json(item, kind, coders))
            .collect::<DbResult<Vec<_>>>()
            .map(Value::List)
    }
}

fn decode_legacy_list(text: &str, kind: &ColumnKind, coders: &CoderRegistry) -> DbResult<Value> {
    let mut parts: Vec<&str> = text.split(LEGACY_LIST_DELIMITER).collect();
    // Trailing empty segments carry no elements in the legacy layout.
    while parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    parts
        .into_iter()
        .map(|part| {
            if part == LEGACY_NULL {
                Ok(Value::Null)
            } else {
                element_from_text(part, kind, coders)
            }
        })
        .collect::<DbResult<Vec<_>>>()
        .map(Value::List)
}

/// Single-level maps stored as a JSON array of `[key, value]` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapCoder;

impl Coder for MapCoder {
    fn encode(&self, value: &Value, args: &[ColumnKind], coders: &CoderRegistry) -> DbResult<String> {
        let pairs = match value {
            Value::Null => return Ok(EMPTY_MAP.to_string()),
            Value::Map(pairs) if pairs.is_empty() => return Ok(EMPTY_MAP.to_string()),
            Value::Map(pairs) => pairs,
            other => {
                return Err(DbError::invalid_input(format!(
                    "expected map but found {}",
                    other.type_name()
                )));
            }
        };
        let (key_kind, value_kind) = (element_kind(args, 0), element_kind(args, 1));
        let array = pairs
            .iter()
            .map(|(k, v)| {
                Ok(JsonValue::Array(vec![
                    element_to_json(k, key_kind, coders)?,
                    element_to_json(v, value_kind, coders)?,
                ]))
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(JsonValue::Array(array).to_string())
    }

    fn decode(&self, text: &str, args: &[ColumnKind], coders: &CoderRegistry) -> DbResult<Value> {
        let (key_kind, value_kind) = (element_kind(args, 0), element_kind(args, 1));
        if key_kind.is_container() || value_kind.is_container() {
            return Err(DbError::unsupported_nesting(format!("map<{},{}>", key_kind, value_kind)));
        }
        if text.is_empty() {
            return Ok(Value::Map(Vec::new()));
        }
        let json: JsonValue =
            serde_json::from_str(text).map_err(|e| DbError::decode(e.to_string()))?;
        let JsonValue::Array(entries) = json else {
            return Err(DbError::decode(format!("expected JSON array, found {}", text)));
        };
        let mut pairs = Vec::with_capacity(entries.len());
        for entry in &entries {
            let JsonValue::Array(pair) = entry else {
                return Err(DbError::decode(format!("expected [key, value] pair, found {}", entry)));
            };
            let key = pair.first().unwrap_or(&JsonValue::Null);
            let value = pair.get(1).unwrap_or(&JsonValue::Null);
            if key.is_null() && value.is_null() {
                continue;
            }
            pairs.push((
                element_from_json(key, key_kind, coders)?,
                element_from_json(value, value_kind, coders)?,
            ));
        }
        Ok(Value::Map(pairs))
    }
}

/// UUIDs stored in their hyphenated text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidCoder;

impl Coder for UuidCoder {
    fn encode(&self, value: &Value, _args: &[ColumnKind], _coders: &CoderRegistry) -> DbResult<String> {
        match value {
            Value::Uuid(u) => Ok(u.to_string()),
            Value::Text(s) => uuid::Uuid::parse_str(s)
                .map(|u| u.to_string())
                .map_err(|e| DbError::invalid_input(e.to_string())),
            other => Err(DbError::invalid_input(format!(
                "expected uuid but found {}",
                other.type_name()
            ))),
        }
    }

    fn decode(&self, text: &str, _args: &[ColumnKind], _coders: &CoderRegistry) -> DbResult<Value> {
        uuid::Uuid::parse_str(text.trim())
            .map(Value::Uuid)
            .map_err(|e| DbError::decode(format!("invalid uuid '{}': {}", text, e)))
    }
}
