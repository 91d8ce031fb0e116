//! Database layer.
//!
//! - Physical connections and per-dialect dispatch
//! - SQL dialect rendering
//! - The self-managed connection pool
//! - Entity schema description and reconciliation
//! - Value coercion between entity fields and storage
//! - The data handler composing all of the above into CRUD

#[macro_use]
pub mod macros;
pub mod connection;
pub mod dialect;
pub mod handler;
pub mod params;
pub mod pool;
pub mod schema;
pub mod types;

pub use connection::{DbConnection, ExecuteOutcome};
pub use handler::DataHandler;
pub use pool::{ConnectionPool, PooledConnection};
pub use schema::{
    ColumnDescriptor, EntityDescriptor, SchemaPlan, SchemaRegistry, plan_reconciliation, reconcile,
};
pub use types::{Coder, CoderRegistry, ListCoder, MapCoder, UuidCoder};
