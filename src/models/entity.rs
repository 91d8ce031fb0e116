//! Entity declarations.
//!
//! An entity is a Rust struct mapped to one table. It describes itself with an
//! [`EntityDeclaration`] (usually generated by [`impl_entity!`](crate::impl_entity))
//! and exposes its fields by name so the handler can read and assign them.

use crate::error::DbResult;
use crate::models::value::{ColumnKind, ColumnValue, Value};
use serde::{Deserialize, Serialize};

/// Position hint for columns without a declared position.
pub const UNORDERED: i32 = -1;

/// Role of a column within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnRole {
    Normal,
    Unique,
    Primary,
}

/// Declaration of a single column, bound to a struct field.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    field: String,
    name: Option<String>,
    kind: Option<ColumnKind>,
    role: ColumnRole,
    auto_increment: bool,
    order: i32,
}

impl ColumnDef {
    fn with_role(role: ColumnRole) -> Self {
        Self {
            field: String::new(),
            name: None,
            kind: None,
            role,
            auto_increment: false,
            order: UNORDERED,
        }
    }

    pub fn normal() -> Self {
        Self::with_role(ColumnRole::Normal)
    }

    pub fn unique() -> Self {
        Self::with_role(ColumnRole::Unique)
    }

    pub fn primary() -> Self {
        Self::with_role(ColumnRole::Primary)
    }

    /// Explicit column name. Defaults to the lower-cased field name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Physical position hint (1-based). Hints form a partial order.
    pub fn position(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Attach the struct field and its kind.
    pub fn bind(mut self, field: impl Into<String>, kind: ColumnKind) -> Self {
        self.field = field.into();
        self.kind = Some(kind);
        self
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> Option<&ColumnKind> {
        self.kind.as_ref()
    }

    pub fn role(&self) -> ColumnRole {
        self.role
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn order(&self) -> i32 {
        self.order
    }
}

/// Declaration of an entity: its table and columns in discovery order.
#[derive(Debug, Clone)]
pub struct EntityDeclaration {
    type_name: String,
    table: Option<String>,
    columns: Vec<ColumnDef>,
}

impl EntityDeclaration {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            table: None,
            columns: Vec::new(),
        }
    }

    /// Explicit table name. Defaults to the lower-cased type name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Columns of an embedded parent declaration, discovered before our own.
    pub fn inherit(mut self, parent: EntityDeclaration) -> Self {
        let mut columns = parent.columns;
        columns.append(&mut self.columns);
        self.columns = columns;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn explicit_table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }
}

/// Load state of a materialized row. Starts unloaded and is set exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowState {
    loaded: bool,
}

impl RowState {
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn mark_loaded(&mut self) {
        self.loaded = true;
    }
}

/// A record type mapped to one table.
///
/// `Default` is the no-argument constructor used to materialize query results.
pub trait Entity: Default + Send + Sync + 'static {
    fn declare() -> EntityDeclaration;

    /// Current value of a declared field, `None` if the field is unknown.
    fn column_value(&self, field: &str) -> Option<Value>;

    fn set_column_value(&mut self, field: &str, value: Value) -> DbResult<()>;

    fn row_state(&self) -> &RowState;

    fn row_state_mut(&mut self) -> &mut RowState;

    fn is_loaded(&self) -> bool {
        self.row_state().is_loaded()
    }
}

/// Column kind of a field, inferred from its accessor.
pub fn kind_of<E, T, F>(_accessor: F) -> ColumnKind
where
    T: ColumnValue,
    F: Fn(&E) -> &T,
{
    T::kind()
}
