//! Schema registry and reconciliation.
//!
//! An [`EntityDescriptor`] is derived once per entity type from its
//! declaration and cached in a [`SchemaRegistry`]. Reconciliation compares a
//! descriptor with the live table and creates it or adds/drops columns.

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnKind, ColumnRole, DatabaseType, Entity, EntityDeclaration, UNORDERED};
use serde::Serialize;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Cached metadata of one column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    /// Column name in the database
    pub name: String,
    /// Struct field the column is bound to
    pub field: String,
    pub kind: ColumnKind,
    pub role: ColumnRole,
    pub auto_increment: bool,
    /// Position hint, [`UNORDERED`] when absent
    pub order: i32,
}

impl ColumnDescriptor {
    pub fn is_primary(&self) -> bool {
        self.role == ColumnRole::Primary
    }

    pub fn is_unique(&self) -> bool {
        self.role == ColumnRole::Unique
    }

    /// Server-generated columns are never written by INSERT or UPDATE.
    pub fn is_generated(&self) -> bool {
        self.is_primary() || self.auto_increment
    }
}

/// Cached metadata of one entity type: its table and column layout.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDescriptor {
    type_name: String,
    table: String,
    columns: Vec<ColumnDescriptor>,
    primary: Option<usize>,
}

fn configuration(message: impl Into<String>, decl: &EntityDeclaration) -> DbError {
    DbError::configuration(message, decl.type_name())
}

fn default_table_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

fn check_nesting(kind: &ColumnKind) -> DbResult<()> {
    if kind.is_container() && kind.args().iter().any(ColumnKind::is_container) {
        return Err(DbError::unsupported_nesting(kind.identifier()));
    }
    Ok(())
}

impl EntityDescriptor {
    /// Validate a declaration and compute the column layout.
    pub fn from_declaration(decl: EntityDeclaration) -> DbResult<Self> {
        if decl.columns().is_empty() {
            return Err(configuration("entity declares no columns", &decl));
        }

        let mut columns: Vec<ColumnDescriptor> = Vec::with_capacity(decl.columns().len());
        let mut seen = HashSet::new();
        for def in decl.columns() {
            let kind = def.kind().cloned().ok_or_else(|| {
                configuration(format!("column '{}' has no bound kind", def.field()), &decl)
            })?;
            check_nesting(&kind)?;

            let name = def
                .explicit_name()
                .map(str::to_string)
                .unwrap_or_else(|| def.field().to_lowercase());
            if !seen.insert(name.to_lowercase()) {
                return Err(configuration(format!("duplicate column '{}'", name), &decl));
            }

            let order = def.order();
            if order == 0 || order < UNORDERED {
                return Err(configuration(
                    format!("column '{}' has invalid position {}", name, order),
                    &decl,
                ));
            }

            match def.role() {
                ColumnRole::Primary if !kind.is_integer() => {
                    return Err(configuration(
                        format!("primary column '{}' must be an integer, found {}", name, kind),
                        &decl,
                    ));
                }
                ColumnRole::Unique if def.is_auto_increment() => {
                    return Err(configuration(
                        format!("auto-increment is not allowed on unique column '{}'", name),
                        &decl,
                    ));
                }
                ColumnRole::Normal if def.is_auto_increment() && !kind.is_integer() => {
                    return Err(configuration(
                        format!("auto-increment column '{}' must be an integer", name),
                        &decl,
                    ));
                }
                _ => {}
            }

            columns.push(ColumnDescriptor {
                name,
                field: def.field().to_string(),
                kind,
                role: def.role(),
                auto_increment: def.is_auto_increment(),
                order,
            });
        }

        let primaries: Vec<&str> = columns
            .iter()
            .filter(|c| c.is_primary())
            .map(|c| c.name.as_str())
            .collect();
        if primaries.len() > 1 {
            return Err(configuration(
                format!("multiple primary columns: {}", primaries.join(", ")),
                &decl,
            ));
        }

        sort_layout(&mut columns);
        let primary = columns.iter().position(ColumnDescriptor::is_primary);
        let table = decl
            .explicit_table()
            .map(str::to_string)
            .unwrap_or_else(|| default_table_name(decl.type_name()));

        Ok(Self {
            type_name: decl.type_name().to_string(),
            table,
            columns,
            primary,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Columns in layout order.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Look up a column by name, case-insensitively.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn require_column(&self, name: &str) -> DbResult<&ColumnDescriptor> {
        self.column(name)
            .ok_or_else(|| DbError::unknown_column(name, &self.type_name))
    }

    pub fn primary(&self) -> Option<&ColumnDescriptor> {
        self.primary.map(|idx| &self.columns[idx])
    }

    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_unique())
    }

    /// Columns written by INSERT.
    pub fn insertable_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| !c.is_generated())
    }

    /// Columns written by UPDATE.
    pub fn loadable_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.insertable_columns()
    }

    /// Index of a column in the layout.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Stable sort of the columns that carry a position hint.
///
/// Hinted columns are reordered among the slots they already occupy; columns
/// without a hint keep their discovery position.
fn sort_layout(columns: &mut [ColumnDescriptor]) {
    let slots: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.order != UNORDERED)
        .map(|(idx, _)| idx)
        .collect();
    let mut ordered: Vec<ColumnDescriptor> = slots.iter().map(|&idx| columns[idx].clone()).collect();
    ordered.sort_by_key(|c| c.order);
    for (slot, column) in slots.into_iter().zip(ordered) {
        columns[slot] = column;
    }
}

/// Process-wide cache of entity descriptors keyed by type identity.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    descriptors: RwLock<HashMap<TypeId, Arc<EntityDescriptor>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor of `E`, derived on first use.
    pub fn describe<E: Entity>(&self) -> DbResult<Arc<EntityDescriptor>> {
        let key = TypeId::of::<E>();
        {
            let descriptors = self
                .descriptors
                .read()
                .map_err(|_| DbError::internal("schema registry lock poisoned"))?;
            if let Some(desc) = descriptors.get(&key) {
                return Ok(Arc::clone(desc));
            }
        }

        let desc = Arc::new(EntityDescriptor::from_declaration(E::declare())?);
        let mut descriptors = self
            .descriptors
            .write()
            .map_err(|_| DbError::internal("schema registry lock poisoned"))?;
        let entry = descriptors.entry(key).or_insert_with(|| {
            debug!(entity = %desc.type_name(), table = %desc.table(), "Registered entity");
            desc
        });
        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Statements that bring a live table in line with its descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaPlan {
    pub create: Option<String>,
    pub drops: Vec<String>,
    pub adds: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.drops.is_empty() && self.adds.is_empty()
    }

    /// Statements in execution order: create, drops, then adds.
    pub fn statements(&self) -> impl Iterator<Item = &str> {
        self.create
            .iter()
            .chain(&self.drops)
            .chain(&self.adds)
            .map(String::as_str)
    }
}

/// Compute the reconciliation plan.
///
/// `live` is the live column list, or `None` when the table does not exist.
/// Names are compared case-insensitively; existing columns are never renamed
/// or retyped.
pub fn plan_reconciliation(
    desc: &EntityDescriptor,
    dialect: DatabaseType,
    live: Option<&[String]>,
) -> SchemaPlan {
    let Some(live) = live else {
        return SchemaPlan {
            create: Some(dialect.create_table_sql(desc)),
            ..SchemaPlan::default()
        };
    };

    let live_names: HashSet<String> = live.iter().map(|c| c.to_lowercase()).collect();
    let drops = live
        .iter()
        .filter(|name| desc.column(name).is_none())
        .map(|name| dialect.drop_column_sql(desc.table(), name))
        .collect();
    let adds = desc
        .columns()
        .iter()
        .filter(|c| !live_names.contains(&c.name.to_lowercase()))
        .flat_map(|c| dialect.add_column_sql(desc, c))
        .collect();

    SchemaPlan {
        create: None,
        drops,
        adds,
    }
}

/// Reconcile the live table of `desc` on `conn`, returning the executed plan.
pub async fn reconcile(conn: &mut DbConnection, desc: &EntityDescriptor) -> DbResult<SchemaPlan> {
    let dialect = conn.database_type();
    let live = if conn.table_exists(desc.table()).await? {
        Some(conn.list_columns(desc.table()).await?)
    } else {
        None
    };

    let plan = plan_reconciliation(desc, dialect, live.as_deref());
    for sql in plan.statements() {
        debug!(sql = %sql, "Reconciling schema");
        conn.execute(sql, &[]).await?;
    }

    if plan.create.is_some() {
        info!(table = %desc.table(), entity = %desc.type_name(), "Created table");
    } else if !plan.is_empty() {
        info!(
            table = %desc.table(),
            dropped = plan.drops.len(),
            added = plan.adds.len(),
            "Altered table"
        );
    }
    Ok(plan)
}
