//! Data models for rowbase.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod entity;
pub mod filter;
pub mod pool;
pub mod query;
pub mod value;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType};
pub use entity::{ColumnDef, ColumnRole, Entity, EntityDeclaration, RowState, UNORDERED, kind_of};
pub use filter::{FilterParam, Operator, ParamBinding, QueryFilter, RenderedClause, SortOrder};
pub use pool::{ConnectionSnapshot, ConnectionState, PoolStatistics};
pub use query::{WireType, WireValue};
pub use value::{Blob, ColumnKind, ColumnValue, CustomKind, Serialized, Value};
