//! Wire-level parameter and result values.
//!
//! These are the only types that cross into the sqlx driver layer. Every
//! column value is coerced to one of them before binding and read back as one
//! of them before decoding.

use chrono::NaiveDateTime;

/// Native storage type used to bind and read a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireType {
    Bool,
    /// 32-bit integer
    Int,
    /// 64-bit integer
    BigInt,
    Double,
    Text,
    Timestamp,
}

/// A value as the driver sees it.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// NULL typed with the column's storage type
    Null(WireType),
    Bool(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl WireValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Null(ty) => *ty,
            Self::Bool(_) => WireType::Bool,
            Self::Int(_) => WireType::Int,
            Self::BigInt(_) => WireType::BigInt,
            Self::Double(_) => WireType::Double,
            Self::Text(_) => WireType::Text,
            Self::Timestamp(_) => WireType::Timestamp,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v as i64),
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_type_of_null() {
        let null = WireValue::Null(WireType::Timestamp);
        assert!(null.is_null());
        assert_eq!(null.wire_type(), WireType::Timestamp);
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(WireValue::Int(7).as_i64(), Some(7));
        assert_eq!(WireValue::BigInt(-1).as_i64(), Some(-1));
        assert_eq!(WireValue::Text("7".into()).as_i64(), None);
    }
}
