//! Physical database connections.
//!
//! `DbConnection` is the driver capability surface the rest of the crate is
//! written against: execute, query, generated keys, metadata and the optional
//! bulk copy path.
//!
//! # Architecture
//!
//! Each dialect lives in its own submodule (mysql, postgres, sqlite) with the
//! same set of functions. SQL reaches this module with `?` placeholders; the
//! postgres submodule numbers them before preparing.

use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, DatabaseType, WireType, WireValue};
use chrono::NaiveDateTime;
use futures_util::TryStreamExt;
use sqlx::{Connection, Executor, MySqlConnection, PgConnection, Row, SqliteConnection};
use std::str::FromStr;
use tracing::debug;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOutcome {
    pub rows_affected: u64,
}

/// One open physical connection.
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbConnection")
            .field(&self.database_type())
            .finish()
    }
}

impl DbConnection {
    /// Open a new physical connection.
    pub async fn open(config: &ConnectionConfig) -> DbResult<Self> {
        match config.db_type {
            DatabaseType::MySQL => mysql::open(&config.connection_string).await.map(Self::MySql),
            DatabaseType::PostgreSQL => postgres::open(&config.connection_string)
                .await
                .map(Self::Postgres),
            DatabaseType::SQLite => sqlite::open(&config.connection_string).await.map(Self::SQLite),
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            Self::MySql(_) => DatabaseType::MySQL,
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Execute a write or DDL statement.
    pub async fn execute(&mut self, sql: &str, params: &[WireValue]) -> DbResult<ExecuteOutcome> {
        debug!(sql = %sql, params = params.len(), "Executing statement");
        impl_db_dispatch!(self, {
            MySql(c) => mysql::execute(c, sql, params).await,
            Postgres(c) => postgres::execute(c, sql, params).await,
            SQLite(c) => sqlite::execute(c, sql, params).await,
        })
    }

    /// Execute an INSERT and return the key generated for `key_column`.
    pub async fn insert_returning_key(
        &mut self,
        sql: &str,
        params: &[WireValue],
        key_column: &str,
    ) -> DbResult<Option<i64>> {
        debug!(sql = %sql, params = params.len(), key = %key_column, "Executing insert");
        impl_db_dispatch!(self, {
            MySql(c) => mysql::insert_returning_key(c, sql, params).await,
            Postgres(c) => postgres::insert_returning_key(c, sql, params, key_column).await,
            SQLite(c) => sqlite::insert_returning_key(c, sql, params).await,
        })
    }

    /// Run a query and read every row with the given column shape.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[WireValue],
        shape: &[WireType],
    ) -> DbResult<Vec<Vec<WireValue>>> {
        debug!(sql = %sql, params = params.len(), "Executing query");
        impl_db_dispatch!(self, {
            MySql(c) => mysql::query(c, sql, params, shape).await,
            Postgres(c) => postgres::query(c, sql, params, shape).await,
            SQLite(c) => sqlite::query(c, sql, params, shape).await,
        })
    }

    pub async fn table_exists(&mut self, table: &str) -> DbResult<bool> {
        impl_db_dispatch!(self, {
            MySql(c) => mysql::table_exists(c, table).await,
            Postgres(c) => postgres::table_exists(c, table).await,
            SQLite(c) => sqlite::table_exists(c, table).await,
        })
    }

    /// Column names of a table in physical order. Empty if the table is missing.
    pub async fn list_columns(&mut self, table: &str) -> DbResult<Vec<String>> {
        impl_db_dispatch!(self, {
            MySql(c) => mysql::list_columns(c, table).await,
            Postgres(c) => postgres::list_columns(c, table).await,
            SQLite(c) => sqlite::list_columns(c, table).await,
        })
    }

    pub async fn list_tables(&mut self) -> DbResult<Vec<String>> {
        impl_db_dispatch!(self, {
            MySql(c) => mysql::list_tables(c).await,
            Postgres(c) => postgres::list_tables(c).await,
            SQLite(c) => sqlite::list_tables(c).await,
        })
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> bool {
        let result = impl_db_dispatch!(self, {
            MySql(c) => c.ping().await,
            Postgres(c) => c.ping().await,
            SQLite(c) => c.ping().await,
        });
        result.is_ok()
    }

    /// Gracefully close the connection. Errors are logged, never raised.
    pub async fn close(self) {
        let result = match self {
            Self::MySql(c) => c.close().await,
            Self::Postgres(c) => c.close().await,
            Self::SQLite(c) => c.close().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Error while closing connection");
        }
    }

    /// Whether this connection supports [`copy_in_csv`](Self::copy_in_csv).
    pub fn supports_bulk_copy(&self) -> bool {
        self.database_type().supports_bulk_copy()
    }

    /// Stream CSV rows through `COPY ... FROM STDIN`. Postgres only.
    pub async fn copy_in_csv(&mut self, statement: &str, data: &[u8]) -> DbResult<u64> {
        match self {
            Self::Postgres(c) => postgres::copy_in_csv(c, statement, data).await,
            other => Err(DbError::invalid_input(format!(
                "{} has no bulk copy protocol",
                other.database_type()
            ))),
        }
    }
}

/// Read one row into wire values according to `shape`.
macro_rules! read_wire_row {
    ($row:expr, $shape:expr) => {{
        let mut values = Vec::with_capacity($shape.len());
        for (idx, ty) in $shape.iter().enumerate() {
            let value = match ty {
                WireType::Bool => $row.try_get::<Option<bool>, _>(idx)?.map(WireValue::Bool),
                WireType::Int => $row.try_get::<Option<i32>, _>(idx)?.map(WireValue::Int),
                WireType::BigInt => $row.try_get::<Option<i64>, _>(idx)?.map(WireValue::BigInt),
                WireType::Double => $row.try_get::<Option<f64>, _>(idx)?.map(WireValue::Double),
                WireType::Text => $row.try_get::<Option<String>, _>(idx)?.map(WireValue::Text),
                WireType::Timestamp => $row
                    .try_get::<Option<NaiveDateTime>, _>(idx)?
                    .map(WireValue::Timestamp),
            };
            values.push(value.unwrap_or(WireValue::Null(*ty)));
        }
        values
    }};
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod mysql {
        pub const TABLE_EXISTS: &str = r#"
            SELECT COUNT(*)
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT COLUMN_NAME
            FROM information_schema.COLUMNS
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
            "#;

        pub const LIST_TABLES: &str = r#"
            SELECT TABLE_NAME
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;
    }

    pub mod postgres {
        pub const TABLE_EXISTS: &str = r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = lower($1)
            )
            "#;

        pub const LIST_COLUMNS: &str = r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = lower($1)
            ORDER BY ordinal_position
            "#;

        pub const LIST_TABLES: &str = r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#;
    }

    pub mod sqlite {
        pub const TABLE_EXISTS: &str =
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?";

        pub const LIST_COLUMNS: &str = "SELECT name FROM pragma_table_info(?) ORDER BY cid";

        pub const LIST_TABLES: &str = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// The code structure is intentionally parallel to make differences obvious.

mod mysql {
    use super::*;
    use sqlx::mysql::{MySqlConnectOptions, MySqlQueryResult};

    pub async fn open(url: &str) -> DbResult<MySqlConnection> {
        let options = MySqlConnectOptions::from_str(url)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid MySQL connection string: {}", e),
                    "Check the connection URL format",
                )
            })?
            .charset("utf8mb4");
        MySqlConnection::connect_with(&options)
            .await
            .map_err(DbError::from)
    }

    async fn run(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<MySqlQueryResult> {
        // Raw execution for parameterless statements; some DDL is not preparable
        if params.is_empty() {
            return Ok(conn.execute(sql).await?);
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        Ok(query.execute(&mut *conn).await?)
    }

    pub async fn execute(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<ExecuteOutcome> {
        let result = run(conn, sql, params).await?;
        Ok(ExecuteOutcome {
            rows_affected: result.rows_affected(),
        })
    }

    pub async fn insert_returning_key(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<Option<i64>> {
        let result = run(conn, sql, params).await?;
        let id = result.last_insert_id();
        Ok((id > 0).then_some(id as i64))
    }

    pub async fn query(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[WireValue],
        shape: &[WireType],
    ) -> DbResult<Vec<Vec<WireValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_mysql_param(query, param);
        }
        let rows = query.fetch(&mut *conn).try_collect::<Vec<_>>().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(read_wire_row!(row, shape));
        }
        Ok(out)
    }

    /// information_schema columns may come back as VARBINARY on some servers.
    fn get_string(row: &sqlx::mysql::MySqlRow, idx: usize) -> DbResult<String> {
        if let Ok(s) = row.try_get::<String, _>(idx) {
            return Ok(s);
        }
        let bytes: Vec<u8> = row.try_get(idx)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn table_exists(conn: &mut MySqlConnection, table: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar(queries::mysql::TABLE_EXISTS)
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count > 0)
    }

    pub async fn list_columns(conn: &mut MySqlConnection, table: &str) -> DbResult<Vec<String>> {
        let rows = sqlx::query(queries::mysql::LIST_COLUMNS)
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(|r| get_string(r, 0)).collect()
    }

    pub async fn list_tables(conn: &mut MySqlConnection) -> DbResult<Vec<String>> {
        let rows = sqlx::query(queries::mysql::LIST_TABLES)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(|r| get_string(r, 0)).collect()
    }
}

mod postgres {
    use super::*;
    use crate::db::dialect::number_placeholders;
    use sqlx::postgres::PgQueryResult;

    pub async fn open(url: &str) -> DbResult<PgConnection> {
        PgConnection::connect(url).await.map_err(DbError::from)
    }

    async fn run(
        conn: &mut PgConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<PgQueryResult> {
        if params.is_empty() {
            return Ok(conn.execute(sql).await?);
        }
        let sql = number_placeholders(sql);
        let mut query = sqlx::query(&sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        Ok(query.execute(&mut *conn).await?)
    }

    pub async fn execute(
        conn: &mut PgConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<ExecuteOutcome> {
        let result = run(conn, sql, params).await?;
        Ok(ExecuteOutcome {
            rows_affected: result.rows_affected(),
        })
    }

    pub async fn insert_returning_key(
        conn: &mut PgConnection,
        sql: &str,
        params: &[WireValue],
        key_column: &str,
    ) -> DbResult<Option<i64>> {
        let sql = number_placeholders(&format!("{} RETURNING {}", sql, key_column));
        let mut query = sqlx::query(&sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        let row = query.fetch_optional(&mut *conn).await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<i64>, _>(0)?),
            None => Ok(None),
        }
    }

    pub async fn query(
        conn: &mut PgConnection,
        sql: &str,
        params: &[WireValue],
        shape: &[WireType],
    ) -> DbResult<Vec<Vec<WireValue>>> {
        let sql = number_placeholders(sql);
        let mut query = sqlx::query(&sql);
        for param in params {
            query = bind_postgres_param(query, param);
        }
        let rows = query.fetch(&mut *conn).try_collect::<Vec<_>>().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(read_wire_row!(row, shape));
        }
        Ok(out)
    }

    pub async fn table_exists(conn: &mut PgConnection, table: &str) -> DbResult<bool> {
        let exists: bool = sqlx::query_scalar(queries::postgres::TABLE_EXISTS)
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
        Ok(exists)
    }

    pub async fn list_columns(conn: &mut PgConnection, table: &str) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(queries::postgres::LIST_COLUMNS)
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
        Ok(names)
    }

    pub async fn list_tables(conn: &mut PgConnection) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(queries::postgres::LIST_TABLES)
            .fetch_all(&mut *conn)
            .await?;
        Ok(names)
    }

    pub async fn copy_in_csv(conn: &mut PgConnection, statement: &str, data: &[u8]) -> DbResult<u64> {
        debug!(statement = %statement, bytes = data.len(), "Starting COPY");
        let mut copy = conn.copy_in_raw(statement).await?;
        let sent = copy.send(data).await.map(|_| ());
        if let Err(e) = sent {
            // The send error is more useful than a failed abort
            let _ = copy.abort(e.to_string()).await;
            return Err(e.into());
        }
        Ok(copy.finish().await?)
    }
}

mod sqlite {
    use super::*;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteQueryResult};

    pub async fn open(url: &str) -> DbResult<SqliteConnection> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Use sqlite:path/to/file.db or sqlite::memory:",
                )
            })?
            .create_if_missing(true);
        SqliteConnection::connect_with(&options)
            .await
            .map_err(DbError::from)
    }

    async fn run(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<SqliteQueryResult> {
        if params.is_empty() {
            return Ok(conn.execute(sql).await?);
        }
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        Ok(query.execute(&mut *conn).await?)
    }

    pub async fn execute(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<ExecuteOutcome> {
        let result = run(conn, sql, params).await?;
        Ok(ExecuteOutcome {
            rows_affected: result.rows_affected(),
        })
    }

    pub async fn insert_returning_key(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[WireValue],
    ) -> DbResult<Option<i64>> {
        let result = run(conn, sql, params).await?;
        let id = result.last_insert_rowid();
        Ok((id > 0).then_some(id))
    }

    pub async fn query(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[WireValue],
        shape: &[WireType],
    ) -> DbResult<Vec<Vec<WireValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }
        let rows = query.fetch(&mut *conn).try_collect::<Vec<_>>().await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(read_wire_row!(row, shape));
        }
        Ok(out)
    }

    pub async fn table_exists(conn: &mut SqliteConnection, table: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar(queries::sqlite::TABLE_EXISTS)
            .bind(table)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count > 0)
    }

    pub async fn list_columns(conn: &mut SqliteConnection, table: &str) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(queries::sqlite::LIST_COLUMNS)
            .bind(table)
            .fetch_all(&mut *conn)
            .await?;
        Ok(names)
    }

    pub async fn list_tables(conn: &mut SqliteConnection) -> DbResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(queries::sqlite::LIST_TABLES)
            .fetch_all(&mut *conn)
            .await?;
        Ok(names)
    }
}
