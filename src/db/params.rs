//! Parameter binding utilities for database queries.
//!
//! Binds `WireValue`s to database-specific sqlx query objects. NULLs are bound
//! with the column's storage type so Postgres can infer parameter types.

use crate::models::{WireType, WireValue};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! bind_wire {
    ($query:expr, $param:expr) => {
        match $param {
            WireValue::Null(WireType::Bool) => $query.bind(None::<bool>),
            WireValue::Null(WireType::Int) => $query.bind(None::<i32>),
            WireValue::Null(WireType::BigInt) => $query.bind(None::<i64>),
            WireValue::Null(WireType::Double) => $query.bind(None::<f64>),
            WireValue::Null(WireType::Text) => $query.bind(None::<String>),
            WireValue::Null(WireType::Timestamp) => $query.bind(None::<chrono::NaiveDateTime>),
            WireValue::Bool(v) => $query.bind(*v),
            WireValue::Int(v) => $query.bind(*v),
            WireValue::BigInt(v) => $query.bind(*v),
            WireValue::Double(v) => $query.bind(*v),
            WireValue::Text(v) => $query.bind(v.as_str()),
            WireValue::Timestamp(v) => $query.bind(*v),
        }
    };
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q WireValue,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    bind_wire!(query, param)
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q WireValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    bind_wire!(query, param)
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q WireValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    bind_wire!(query, param)
}

/// Text form of a value inside a `COPY ... WITH (FORMAT csv)` stream.
///
/// NULL is an unquoted empty field; text is always quoted so an empty string
/// stays distinct from NULL.
pub(crate) fn csv_field(param: &WireValue) -> String {
    match param {
        WireValue::Null(_) => String::new(),
        WireValue::Bool(v) => v.to_string(),
        WireValue::Int(v) => v.to_string(),
        WireValue::BigInt(v) => v.to_string(),
        WireValue::Double(v) if v.is_nan() => "NaN".to_string(),
        WireValue::Double(v) if v.is_infinite() => {
            if v.is_sign_positive() { "Infinity" } else { "-Infinity" }.to_string()
        }
        WireValue::Double(v) => v.to_string(),
        WireValue::Text(v) => format!("\"{}\"", v.replace('"', "\"\"")),
        WireValue::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
    }
}
