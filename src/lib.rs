//! rowbase
//!
//! Entity data access for SQL databases (SQLite, PostgreSQL, MySQL): typed
//! entities mapped to tables, filter-driven CRUD, additive schema
//! reconciliation and a self-managed connection pool.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, PoolSettings};
pub use db::{ConnectionPool, DataHandler};
pub use error::{DbError, DbResult};
pub use models::{ColumnDef, ConnectionConfig, DatabaseType, Entity, QueryFilter, RowState, Value};
