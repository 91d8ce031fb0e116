//! Native values and declared column kinds.
//!
//! `Value` is the in-memory form every column passes through on its way to
//! and from the database. `ColumnKind` is what an entity declares for a
//! column; it decides the storage type and which coder handles the value.

use crate::error::{DbError, DbResult};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

/// A native column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    /// Opaque serialized payload, stored as base64 text.
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Ordered key/value pairs.
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Byte(_)
                | Self::Short(_)
                | Self::Int(_)
                | Self::Long(_)
                | Self::Float(_)
                | Self::Double(_)
        )
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(self, Self::Timestamp(_))
    }

    /// Integer view of integral values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Byte(v) => Some(*v as i64),
            Self::Short(v) => Some(*v as i64),
            Self::Int(v) => Some(*v as i64),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point view of any numeric value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Byte(_) => "byte",
            Self::Short(_) => "short",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Char(_) => "char",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
            Self::Uuid(_) => "uuid",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )+
    };
}

value_from!(
    bool => Bool,
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    char => Char,
    String => Text,
    NaiveDateTime => Timestamp,
    Uuid => Uuid,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Identifier of the built-in list coder.
pub const LIST_TYPE: &str = "list";
/// Identifier of the built-in map coder.
pub const MAP_TYPE: &str = "map";
/// Identifier of the built-in uuid coder.
pub const UUID_TYPE: &str = "uuid";

/// Declared kind of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Stored as single-character text.
    Char,
    Text,
    Timestamp,
    /// Resolved through the coder registry by name.
    Custom(CustomKind),
}

/// A named custom kind with its generic arguments, e.g. `map<text,int>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CustomKind {
    pub name: String,
    pub args: Vec<ColumnKind>,
}

impl ColumnKind {
    pub fn list(element: ColumnKind) -> Self {
        Self::Custom(CustomKind {
            name: LIST_TYPE.to_string(),
            args: vec![element],
        })
    }

    pub fn map(key: ColumnKind, value: ColumnKind) -> Self {
        Self::Custom(CustomKind {
            name: MAP_TYPE.to_string(),
            args: vec![key, value],
        })
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(CustomKind {
            name: name.into(),
            args: Vec::new(),
        })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Byte | Self::Short | Self::Int | Self::Long)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || matches!(self, Self::Float | Self::Double)
    }

    /// True for list and map kinds.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Custom(c) if c.name == LIST_TYPE || c.name == MAP_TYPE)
    }

    /// Type arguments of a custom kind.
    pub fn args(&self) -> &[ColumnKind] {
        match self {
            Self::Custom(c) => &c.args,
            _ => &[],
        }
    }

    /// Full identifier including generic arguments, e.g. `list<int>`.
    pub fn identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::Byte => "byte",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Char => "char",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Custom(custom) => {
                write!(f, "{}", custom.name)?;
                if !custom.args.is_empty() {
                    let args: Vec<String> = custom.args.iter().map(|a| a.to_string()).collect();
                    write!(f, "<{}>", args.join(","))?;
                }
                return Ok(());
            }
        };
        f.write_str(name)
    }
}

// =============================================================================
// Field conversions
// =============================================================================

/// Conversion between a Rust field type and a column `Value`.
///
/// Non-optional scalar fields read SQL NULL as their default value; wrap the
/// field in `Option` to keep NULL distinct.
pub trait ColumnValue: Sized {
    fn kind() -> ColumnKind;
    fn to_value(&self) -> Value;
    fn from_value(value: Value) -> DbResult<Self>;
}

fn mismatch(expected: &str, found: &Value) -> DbError {
    DbError::decode(format!(
        "expected {} but found {}",
        expected,
        found.type_name()
    ))
}

macro_rules! integer_column {
    ($($ty:ty => $kind:ident / $variant:ident),+ $(,)?) => {
        $(
            impl ColumnValue for $ty {
                fn kind() -> ColumnKind {
                    ColumnKind::$kind
                }

                fn to_value(&self) -> Value {
                    Value::$variant(*self)
                }

                fn from_value(value: Value) -> DbResult<Self> {
                    if value.is_null() {
                        return Ok(0);
                    }
                    value
                        .as_i64()
                        .and_then(|v| <$ty>::try_from(v).ok())
                        .ok_or_else(|| mismatch(stringify!($ty), &value))
                }
            }
        )+
    };
}

integer_column!(
    i8 => Byte / Byte,
    i16 => Short / Short,
    i32 => Int / Int,
    i64 => Long / Long,
);

impl ColumnValue for f32 {
    fn kind() -> ColumnKind {
        ColumnKind::Float
    }

    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        if value.is_null() {
            return Ok(0.0);
        }
        value
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| mismatch("f32", &value))
    }
}

impl ColumnValue for f64 {
    fn kind() -> ColumnKind {
        ColumnKind::Double
    }

    fn to_value(&self) -> Value {
        Value::Double(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        if value.is_null() {
            return Ok(0.0);
        }
        value.as_f64().ok_or_else(|| mismatch("f64", &value))
    }
}

impl ColumnValue for bool {
    fn kind() -> ColumnKind {
        ColumnKind::Boolean
    }

    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            other => other
                .as_i64()
                .map(|v| v != 0)
                .ok_or_else(|| mismatch("bool", &other)),
        }
    }
}

impl ColumnValue for char {
    fn kind() -> ColumnKind {
        ColumnKind::Char
    }

    fn to_value(&self) -> Value {
        Value::Char(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok('\0'),
            Value::Char(c) => Ok(c),
            Value::Text(s) => Ok(s.chars().next().unwrap_or('\0')),
            other => Err(mismatch("char", &other)),
        }
    }
}

impl ColumnValue for String {
    fn kind() -> ColumnKind {
        ColumnKind::Text
    }

    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Text(s) => Ok(s),
            Value::Char(c) => Ok(c.to_string()),
            other => Err(mismatch("String", &other)),
        }
    }
}

impl ColumnValue for NaiveDateTime {
    fn kind() -> ColumnKind {
        ColumnKind::Timestamp
    }

    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(NaiveDateTime::default()),
            Value::Timestamp(ts) => Ok(ts),
            other => Err(mismatch("NaiveDateTime", &other)),
        }
    }
}

impl ColumnValue for Uuid {
    fn kind() -> ColumnKind {
        ColumnKind::custom(UUID_TYPE)
    }

    fn to_value(&self) -> Value {
        Value::Uuid(*self)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(Uuid::nil()),
            Value::Uuid(u) => Ok(u),
            Value::Text(s) => Uuid::parse_str(&s).map_err(|e| DbError::decode(e.to_string())),
            other => Err(mismatch("Uuid", &other)),
        }
    }
}

impl<T: ColumnValue> ColumnValue for Option<T> {
    fn kind() -> ColumnKind {
        T::kind()
    }

    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, ColumnValue::to_value)
    }

    fn from_value(value: Value) -> DbResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl<T: ColumnValue> ColumnValue for Vec<T> {
    fn kind() -> ColumnKind {
        ColumnKind::list(T::kind())
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(ColumnValue::to_value).collect())
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("list", &other)),
        }
    }
}

impl<K: ColumnValue + Ord, V: ColumnValue> ColumnValue for BTreeMap<K, V> {
    fn kind() -> ColumnKind {
        ColumnKind::map(K::kind(), V::kind())
    }

    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.to_value(), v.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(BTreeMap::new()),
            Value::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            other => Err(mismatch("map", &other)),
        }
    }
}

impl<K: ColumnValue + Eq + Hash, V: ColumnValue> ColumnValue for HashMap<K, V> {
    fn kind() -> ColumnKind {
        ColumnKind::map(K::kind(), V::kind())
    }

    fn to_value(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.to_value(), v.to_value()))
                .collect(),
        )
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(HashMap::new()),
            Value::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
                .collect(),
            other => Err(mismatch("map", &other)),
        }
    }
}

/// Raw bytes column. Without a registered `blob` coder it is stored as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl ColumnValue for Blob {
    fn kind() -> ColumnKind {
        ColumnKind::custom("blob")
    }

    fn to_value(&self) -> Value {
        Value::Bytes(self.0.clone())
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(Blob::default()),
            Value::Bytes(b) => Ok(Blob(b)),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

/// Any serde type stored through the binary fallback (JSON bytes, base64 text).
///
/// The column kind is named after the Rust type, so a coder registered under
/// that name takes precedence over the fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Serialized<T>(pub T);

impl<T: Serialize + DeserializeOwned + Default> ColumnValue for Serialized<T> {
    fn kind() -> ColumnKind {
        ColumnKind::custom(std::any::type_name::<T>())
    }

    fn to_value(&self) -> Value {
        match serde_json::to_vec(&self.0) {
            Ok(bytes) => Value::Bytes(bytes),
            Err(e) => {
                tracing::error!(
                    type_name = std::any::type_name::<T>(),
                    error = %e,
                    "Failed to serialize value, writing NULL"
                );
                Value::Null
            }
        }
    }

    fn from_value(value: Value) -> DbResult<Self> {
        match value {
            Value::Null => Ok(Serialized(T::default())),
            Value::Bytes(bytes) => serde_json::from_slice(&bytes)
                .map(Serialized)
                .map_err(|e| DbError::decode(e.to_string())),
            other => Err(mismatch("serialized bytes", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_identifier() {
        assert_eq!(ColumnKind::Int.identifier(), "int");
        assert_eq!(ColumnKind::list(ColumnKind::Text).identifier(), "list<text>");
        assert_eq!(
            ColumnKind::map(ColumnKind::Text, ColumnKind::Long).identifier(),
            "map<text,long>"
        );
        assert_eq!(<Vec<Uuid>>::kind().identifier(), "list<uuid>");
    }

    #[test]
    fn test_kind_classification() {
        assert!(ColumnKind::Long.is_integer());
        assert!(ColumnKind::Double.is_numeric());
        assert!(!ColumnKind::Text.is_numeric());
        assert!(ColumnKind::list(ColumnKind::Int).is_container());
        assert!(!ColumnKind::custom(UUID_TYPE).is_container());
    }

    #[test]
    fn test_integer_narrowing() {
        assert_eq!(i32::from_value(Value::Long(42)).unwrap(), 42);
        assert_eq!(i8::from_value(Value::Null).unwrap(), 0);
        assert!(i8::from_value(Value::Long(1000)).is_err());
        assert!(i32::from_value(Value::Text("x".into())).is_err());
    }

    #[test]
    fn test_option_keeps_null() {
        assert_eq!(<Option<i32>>::from_value(Value::Null).unwrap(), None);
        assert_eq!(<Option<i32>>::from_value(Value::Int(5)).unwrap(), Some(5));
        assert_eq!(Some(7i64).to_value(), Value::Long(7));
        assert_eq!(None::<i64>.to_value(), Value::Null);
    }

    #[test]
    fn test_char_from_text() {
        assert_eq!(char::from_value(Value::Text("xyz".into())).unwrap(), 'x');
        assert_eq!(char::from_value(Value::Text(String::new())).unwrap(), '\0');
    }

    #[test]
    fn test_containers_from_null_are_empty() {
        assert!(Vec::<i32>::from_value(Value::Null).unwrap().is_empty());
        assert!(BTreeMap::<String, i32>::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_serialized_round_trip() {
        let original = Serialized(vec![1u32, 2, 3]);
        let value = original.to_value();
        assert!(matches!(value, Value::Bytes(_)));
        let back = Serialized::<Vec<u32>>::from_value(value).unwrap();
        assert_eq!(back, original);
    }
}
