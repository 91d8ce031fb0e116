//! Error types for rowbase.
//!
//! Configuration errors (bad entity declarations, invalid pool settings) are
//! fatal and surfaced at registration time. Everything else is a runtime
//! condition returned to the caller as a typed value.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message} (entity: {entity})")]
    Configuration { message: String, entity: String },

    #[error("Unknown column '{column}' for entity {entity}")]
    UnknownColumn { column: String, entity: String },

    #[error("Unsupported filter on '{field}': {reason}")]
    UnsupportedFilter { field: String, reason: String },

    #[error("Connection pool exhausted: {loaned} of {max} connections loaned")]
    PoolExhausted { loaned: usize, max: usize },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("No coder registered for type '{type_name}'")]
    UnknownType { type_name: String },

    #[error("Unsupported nesting for type '{type_name}': containers may only hold scalar values")]
    UnsupportedNesting { type_name: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a configuration error for an entity declaration.
    pub fn configuration(message: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            entity: entity.into(),
        }
    }

    pub fn unknown_column(column: impl Into<String>, entity: impl Into<String>) -> Self {
        Self::UnknownColumn {
            column: column.into(),
            entity: entity.into(),
        }
    }

    pub fn unsupported_filter(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedFilter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn pool_exhausted(loaned: usize, max: usize) -> Self {
        Self::PoolExhausted { loaned, max }
    }

    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        Self::UnknownType {
            type_name: type_name.into(),
        }
    }

    pub fn unsupported_nesting(type_name: impl Into<String>) -> Self {
        Self::UnsupportedNesting {
            type_name: type_name.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("Release connections sooner or raise max_pool_size"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::PoolExhausted { .. }
        )
    }

    /// Configuration errors abort initialisation and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Suggestion for a driver error, keyed by SQLSTATE or vendor code.
fn database_suggestion(code: Option<&str>) -> &'static str {
    match code {
        // unique violation: Postgres, MySQL, SQLite (primary key and unique)
        Some("23505" | "1062" | "1555" | "2067") => {
            "A unique or primary column already holds this value; load the stored row instead"
        }
        Some("23502" | "1048" | "1299") => "A NOT NULL column was written without a value",
        // undefined table / column
        Some("42P01" | "42703" | "1146" | "1054") => {
            "The live table differs from the entity; register the entity to reconcile it"
        }
        _ => "Check that the table matches the entity declaration",
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the database URL and its credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let suggestion = database_suggestion(code.as_deref());
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::decode("statement returned no row"),
            sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", 0),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database server is reachable",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Build with the tls-native or tls-rustls feature and check certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::decode(format!("result has no column '{}'", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::decode(format!(
                "result column {} requested but the row has {}",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::decode(format!("column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::decode(source.to_string()),
            other => DbError::internal(format!("driver error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
