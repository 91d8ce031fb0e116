//! Data access handler.
//!
//! Composes the pool, schema registry, filter rendering and type coercion
//! into entity CRUD. One handler serves one database; entity tables are
//! reconciled once per handler on first use.

use crate::db::connection::DbConnection;
use crate::db::params::csv_field;
use crate::db::pool::ConnectionPool;
use crate::db::schema::{ColumnDescriptor, EntityDescriptor, SchemaRegistry, reconcile};
use crate::db::types::CoderRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnKind, ConnectionConfig, DatabaseType, Entity, ParamBinding, PoolStatistics, QueryFilter,
    RenderedClause, Value, WireType, WireValue,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

/// Rows per `COPY` batch on the bulk insert path.
const BULK_BATCH_SIZE: usize = 75;

/// Entity CRUD against one database.
pub struct DataHandler {
    pool: Arc<ConnectionPool>,
    dialect: DatabaseType,
    registry: Arc<SchemaRegistry>,
    coders: Arc<CoderRegistry>,
    /// Per-entity reconciliation. OnceCell ensures single-flight, and a failed
    /// attempt leaves the cell empty so the next call retries.
    reconciled: RwLock<HashMap<TypeId, Arc<OnceCell<()>>>>,
}

impl std::fmt::Debug for DataHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataHandler")
            .field("dialect", &self.dialect)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl DataHandler {
    /// Handler with its own schema registry and the built-in coders.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_registries(
            pool,
            Arc::new(SchemaRegistry::new()),
            Arc::new(CoderRegistry::new()),
        )
    }

    /// Handler sharing a schema registry and coders with other handlers.
    pub fn with_registries(
        pool: Arc<ConnectionPool>,
        registry: Arc<SchemaRegistry>,
        coders: Arc<CoderRegistry>,
    ) -> Self {
        Self {
            dialect: pool.database_type(),
            pool,
            registry,
            coders,
            reconciled: RwLock::new(HashMap::new()),
        }
    }

    /// Open a pool for `config` and wrap it in a handler.
    pub async fn connect(config: ConnectionConfig) -> DbResult<Self> {
        let pool = ConnectionPool::connect(config).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn dialect(&self) -> DatabaseType {
        self.dialect
    }

    pub fn coders(&self) -> &CoderRegistry {
        &self.coders
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Describe and reconcile `E` now instead of on first use.
    pub async fn register<E: Entity>(&self) -> DbResult<Arc<EntityDescriptor>> {
        self.descriptor::<E>().await
    }

    async fn descriptor<E: Entity>(&self) -> DbResult<Arc<EntityDescriptor>> {
        let desc = self.registry.describe::<E>()?;
        self.ensure_reconciled(TypeId::of::<E>(), &desc).await?;
        Ok(desc)
    }

    async fn ensure_reconciled(&self, key: TypeId, desc: &EntityDescriptor) -> DbResult<()> {
        let cell = {
            let cells = self.reconciled.read().await;
            cells.get(&key).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut cells = self.reconciled.write().await;
                Arc::clone(cells.entry(key).or_insert_with(|| Arc::new(OnceCell::new())))
            }
        };

        cell.get_or_try_init(|| async {
            let mut guard = self.pool.acquire().await?;
            reconcile(guard.connection()?, desc).await.map(|_| ())
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Coercion helpers
    // =========================================================================

    fn encode(&self, column: &ColumnDescriptor, value: &Value) -> DbResult<WireValue> {
        self.coders
            .to_wire(value, &column.kind, self.dialect.storage_type(column))
    }

    fn row_value<E: Entity>(row: &E, desc: &EntityDescriptor, column: &ColumnDescriptor) -> DbResult<Value> {
        row.column_value(&column.field)
            .ok_or_else(|| DbError::unknown_column(&column.name, desc.type_name()))
    }

    fn encode_row<E: Entity>(
        &self,
        row: &E,
        desc: &EntityDescriptor,
        columns: &[&ColumnDescriptor],
    ) -> DbResult<Vec<WireValue>> {
        columns
            .iter()
            .map(|c| self.encode(c, &Self::row_value(row, desc, c)?))
            .collect()
    }

    fn decode_row<E: Entity>(&self, desc: &EntityDescriptor, wire: Vec<WireValue>) -> DbResult<E> {
        let mut row = E::default();
        for (column, value) in desc.columns().iter().zip(wire) {
            let value = self.coders.from_wire(&value, &column.kind)?;
            row.set_column_value(&column.field, value)?;
        }
        row.row_state_mut().mark_loaded();
        Ok(row)
    }

    fn validate_filter(desc: &EntityDescriptor, filter: &QueryFilter) -> DbResult<()> {
        for field in filter.fields() {
            desc.require_column(field)?;
        }
        for field in filter.range_fields() {
            let column = desc.require_column(field)?;
            if !column.kind.is_numeric() && column.kind != ColumnKind::Timestamp {
                return Err(DbError::unsupported_filter(
                    &column.name,
                    format!("BETWEEN needs a numeric or timestamp column, got {}", column.kind.identifier()),
                ));
            }
        }
        Ok(())
    }

    fn bind_filter(&self, desc: &EntityDescriptor, clause: &RenderedClause) -> DbResult<Vec<WireValue>> {
        clause
            .params
            .iter()
            .map(|param| {
                let column = desc.require_column(&param.column)?;
                match param.binding {
                    ParamBinding::Column => self.encode(column, &param.value),
                    ParamBinding::Length => {
                        let length = param.value.as_i64().ok_or_else(|| {
                            DbError::invalid_input(format!("length of '{}' must be an integer", column.name))
                        })?;
                        match self.dialect.length_type() {
                            WireType::Int => i32::try_from(length)
                                .map(WireValue::Int)
                                .map_err(|_| DbError::invalid_input(format!("length {} out of range", length))),
                            _ => Ok(WireValue::BigInt(length)),
                        }
                    }
                }
            })
            .collect()
    }

    /// Filter matching a row by primary key, or by all unique columns.
    fn key_filter<E: Entity>(row: &E, desc: &EntityDescriptor) -> DbResult<QueryFilter> {
        if let Some(pk) = desc.primary() {
            return Ok(QueryFilter::new().equals(&pk.name, Self::row_value(row, desc, pk)?));
        }
        let mut filter = QueryFilter::new();
        for column in desc.unique_columns() {
            filter = filter.equals(&column.name, Self::row_value(row, desc, column)?);
        }
        if !filter.has_predicates() {
            return Err(DbError::invalid_input(format!(
                "{} has neither a primary nor a unique column",
                desc.type_name()
            )));
        }
        Ok(filter)
    }

    fn quoted_columns<'a>(&self, columns: impl Iterator<Item = &'a ColumnDescriptor>) -> String {
        columns
            .map(|c| self.dialect.quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // =========================================================================
    // Insert
    // =========================================================================

    fn insert_sql(&self, desc: &EntityDescriptor, columns: &[&ColumnDescriptor]) -> String {
        let table = self.dialect.quote(desc.table());
        if columns.is_empty() {
            return match self.dialect {
                DatabaseType::MySQL => format!("INSERT INTO {table} () VALUES ()"),
                DatabaseType::PostgreSQL | DatabaseType::SQLite => {
                    format!("INSERT INTO {table} DEFAULT VALUES")
                }
            };
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            self.quoted_columns(columns.iter().copied())
        )
    }

    async fn insert_one<E: Entity>(
        &self,
        conn: &mut DbConnection,
        desc: &EntityDescriptor,
        row: &mut E,
    ) -> DbResult<()> {
        let columns: Vec<&ColumnDescriptor> = desc.insertable_columns().collect();
        let sql = self.insert_sql(desc, &columns);
        let params = self.encode_row(row, desc, &columns)?;

        match desc.primary() {
            Some(pk) => {
                let key = conn
                    .insert_returning_key(&sql, &params, &self.dialect.quote(&pk.name))
                    .await?;
                if let Some(key) = key {
                    let value = self.coders.from_wire(&WireValue::BigInt(key), &pk.kind)?;
                    row.set_column_value(&pk.field, value)?;
                }
            }
            None => {
                conn.execute(&sql, &params).await?;
            }
        }
        row.row_state_mut().mark_loaded();
        Ok(())
    }

    /// Insert one row. A server-generated primary key is written back to the row.
    pub async fn insert<E: Entity>(&self, row: &mut E) -> DbResult<()> {
        let desc = self.descriptor::<E>().await?;
        let mut guard = self.pool.acquire().await?;
        self.insert_one(guard.connection()?, &desc, row).await
    }

    /// Insert many rows.
    ///
    /// Entities without a primary key use the bulk copy path where the
    /// backend has one, falling back to row-by-row inserts if it fails.
    pub async fn insert_all<E: Entity>(&self, rows: &mut [E]) -> DbResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let desc = self.descriptor::<E>().await?;
        let mut guard = self.pool.acquire().await?;
        let conn = guard.connection()?;

        if desc.primary().is_none() && conn.supports_bulk_copy() {
            match self.copy_insert(conn, &desc, rows).await {
                Ok(()) => {
                    for row in rows.iter_mut() {
                        row.row_state_mut().mark_loaded();
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        table = %desc.table(),
                        error = %e,
                        "Bulk copy failed, falling back to row inserts"
                    );
                }
            }
        }

        for row in rows.iter_mut() {
            self.insert_one(conn, &desc, row).await?;
        }
        Ok(())
    }

    async fn copy_insert<E: Entity>(
        &self,
        conn: &mut DbConnection,
        desc: &EntityDescriptor,
        rows: &[E],
    ) -> DbResult<()> {
        let columns: Vec<&ColumnDescriptor> = desc.insertable_columns().collect();
        if columns.is_empty() {
            return Err(DbError::invalid_input("no insertable columns for bulk copy"));
        }
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
            self.dialect.quote(desc.table()),
            self.quoted_columns(columns.iter().copied())
        );

        conn.execute("BEGIN", &[]).await?;
        match self.copy_batches(conn, desc, &columns, &statement, rows).await {
            Ok(copied) => {
                conn.execute("COMMIT", &[]).await?;
                debug!(table = %desc.table(), rows = copied, "Bulk copy finished");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = conn.execute("ROLLBACK", &[]).await {
                    warn!(error = %rollback, "Rollback after failed bulk copy failed");
                }
                Err(e)
            }
        }
    }

    async fn copy_batches<E: Entity>(
        &self,
        conn: &mut DbConnection,
        desc: &EntityDescriptor,
        columns: &[&ColumnDescriptor],
        statement: &str,
        rows: &[E],
    ) -> DbResult<u64> {
        let mut copied = 0;
        for batch in rows.chunks(BULK_BATCH_SIZE) {
            let mut data = String::new();
            for row in batch {
                let fields: Vec<String> = self
                    .encode_row(row, desc, columns)?
                    .iter()
                    .map(csv_field)
                    .collect();
                data.push_str(&fields.join(","));
                data.push('\n');
            }
            copied += conn.copy_in_csv(statement, data.as_bytes()).await?;
        }
        Ok(copied)
    }

    // =========================================================================
    // Update
    // =========================================================================

    async fn run_update(
        &self,
        desc: &EntityDescriptor,
        assignments: Vec<(&ColumnDescriptor, Value)>,
        filter: &QueryFilter,
    ) -> DbResult<bool> {
        if assignments.is_empty() {
            return Ok(false);
        }
        Self::validate_filter(desc, filter)?;

        let set = assignments
            .iter()
            .map(|(c, _)| format!("{} = ?", self.dialect.quote(&c.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let clause = filter.render_where(self.dialect);
        let sql = format!("UPDATE {} SET {}{}", self.dialect.quote(desc.table()), set, clause.sql);

        let mut params = assignments
            .iter()
            .map(|(c, v)| self.encode(c, v))
            .collect::<DbResult<Vec<_>>>()?;
        params.extend(self.bind_filter(desc, &clause)?);

        let mut guard = self.pool.acquire().await?;
        let outcome = guard.connection()?.execute(&sql, &params).await?;
        Ok(outcome.rows_affected > 0)
    }

    /// Write the row's values to every row matching `filter`.
    ///
    /// `columns` restricts the SET clause to the named columns. Primary and
    /// auto-increment columns are never written. Returns false without
    /// touching the database when the row was never loaded or inserted.
    pub async fn update<E: Entity>(
        &self,
        row: &E,
        filter: &QueryFilter,
        columns: Option<&[&str]>,
    ) -> DbResult<bool> {
        if !row.is_loaded() {
            return Ok(false);
        }
        let desc = self.descriptor::<E>().await?;

        let selected: Vec<&ColumnDescriptor> = match columns {
            Some(names) if !names.is_empty() => {
                for name in names {
                    desc.require_column(name)?;
                }
                desc.loadable_columns()
                    .filter(|c| names.iter().any(|n| c.name.eq_ignore_ascii_case(n)))
                    .collect()
            }
            _ => desc.loadable_columns().collect(),
        };
        let assignments = selected
            .into_iter()
            .map(|c| Ok((c, Self::row_value(row, &desc, c)?)))
            .collect::<DbResult<Vec<_>>>()?;
        self.run_update(&desc, assignments, filter).await
    }

    /// Update the stored row matching this row's primary key (or its unique
    /// columns when there is no primary key).
    pub async fn update_row<E: Entity>(&self, row: &E) -> DbResult<bool> {
        if !row.is_loaded() {
            return Ok(false);
        }
        let desc = self.descriptor::<E>().await?;
        let filter = Self::key_filter(row, &desc)?;
        self.update(row, &filter, None).await
    }

    /// Set explicit column values on every row matching `filter`.
    pub async fn update_values<E: Entity>(
        &self,
        filter: &QueryFilter,
        content: Vec<(String, Value)>,
    ) -> DbResult<bool> {
        if content.is_empty() {
            return Err(DbError::invalid_input("update content is empty"));
        }
        let desc = self.descriptor::<E>().await?;
        let mut assignments = Vec::with_capacity(content.len());
        for (name, value) in content {
            let column = desc.require_column(&name)?;
            if !column.is_generated() {
                assignments.push((column, value));
            }
        }
        self.run_update(&desc, assignments, filter).await
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Delete rows matching `filter`. An empty filter empties the table.
    pub async fn remove<E: Entity>(&self, filter: &QueryFilter) -> DbResult<()> {
        let desc = self.descriptor::<E>().await?;
        Self::validate_filter(&desc, filter)?;

        let (sql, params) = if filter.has_predicates() {
            let clause = filter.render_where(self.dialect);
            let params = self.bind_filter(&desc, &clause)?;
            (
                format!("DELETE FROM {}{}", self.dialect.quote(desc.table()), clause.sql),
                params,
            )
        } else {
            (self.dialect.truncate_sql(desc.table()), Vec::new())
        };

        let mut guard = self.pool.acquire().await?;
        guard.connection()?.execute(&sql, &params).await?;
        Ok(())
    }

    /// Delete the stored row matching this row's key. Returns whether a row was removed.
    pub async fn remove_row<E: Entity>(&self, row: &E) -> DbResult<bool> {
        let desc = self.descriptor::<E>().await?;
        let filter = Self::key_filter(row, &desc)?;
        let clause = filter.render_where(self.dialect);
        let params = self.bind_filter(&desc, &clause)?;
        let sql = format!("DELETE FROM {}{}", self.dialect.quote(desc.table()), clause.sql);

        let mut guard = self.pool.acquire().await?;
        let outcome = guard.connection()?.execute(&sql, &params).await?;
        Ok(outcome.rows_affected > 0)
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load every row matching `filter`.
    pub async fn load<E: Entity>(&self, filter: &QueryFilter) -> DbResult<Vec<E>> {
        let desc = self.descriptor::<E>().await?;
        Self::validate_filter(&desc, filter)?;

        let clause = filter.render_where(self.dialect);
        let sql = format!(
            "SELECT {} FROM {}{}{}",
            self.quoted_columns(desc.columns().iter()),
            self.dialect.quote(desc.table()),
            clause.sql,
            filter.render_tail(self.dialect)
        );
        let params = self.bind_filter(&desc, &clause)?;
        let shape: Vec<WireType> = desc
            .columns()
            .iter()
            .map(|c| self.dialect.storage_type(c))
            .collect();

        let rows = {
            let mut guard = self.pool.acquire().await?;
            guard.connection()?.query(&sql, &params, &shape).await?
        };
        rows.into_iter()
            .map(|wire| self.decode_row::<E>(&desc, wire))
            .collect()
    }

    pub async fn load_all<E: Entity>(&self) -> DbResult<Vec<E>> {
        self.load(&QueryFilter::new()).await
    }

    /// First row matching `filter`.
    pub async fn load_one<E: Entity>(&self, filter: &QueryFilter) -> DbResult<Option<E>> {
        let filter = filter.clone().limit(1);
        Ok(self.load(&filter).await?.into_iter().next())
    }

    /// Row with the lowest primary key. `None` for entities without one.
    pub async fn load_first<E: Entity>(&self) -> DbResult<Option<E>> {
        let desc = self.descriptor::<E>().await?;
        match desc.primary() {
            Some(pk) => self.load_one(&QueryFilter::new().asc(&pk.name)).await,
            None => Ok(None),
        }
    }

    /// Row with the highest primary key. `None` for entities without one.
    pub async fn load_last<E: Entity>(&self) -> DbResult<Option<E>> {
        let desc = self.descriptor::<E>().await?;
        match desc.primary() {
            Some(pk) => self.load_one(&QueryFilter::new().desc(&pk.name)).await,
            None => Ok(None),
        }
    }

    // =========================================================================
    // Probes
    // =========================================================================

    /// Whether a stored row matches this row's primary key, or all of its
    /// non-null columns when there is no primary key.
    pub async fn exists<E: Entity>(&self, row: &E) -> DbResult<bool> {
        let desc = self.descriptor::<E>().await?;
        let filter = match desc.primary() {
            Some(pk) => QueryFilter::new().equals(&pk.name, Self::row_value(row, &desc, pk)?),
            None => {
                let mut filter = QueryFilter::new();
                for column in desc.columns() {
                    let value = Self::row_value(row, &desc, column)?;
                    if !value.is_null() {
                        filter = filter.equals(&column.name, value);
                    }
                }
                filter
            }
        };
        if !filter.has_predicates() {
            return Ok(false);
        }

        let clause = filter.render_where(self.dialect);
        let sql = format!(
            "SELECT 1 FROM {}{} LIMIT 1",
            self.dialect.quote(desc.table()),
            clause.sql
        );
        let params = self.bind_filter(&desc, &clause)?;
        let mut guard = self.pool.acquire().await?;
        let rows = guard.connection()?.query(&sql, &params, &[]).await?;
        Ok(!rows.is_empty())
    }

    /// Number of rows matching `filter`.
    pub async fn count<E: Entity>(&self, filter: &QueryFilter) -> DbResult<u64> {
        let desc = self.descriptor::<E>().await?;
        Self::validate_filter(&desc, filter)?;

        let clause = filter.render_where(self.dialect);
        let sql = format!(
            "SELECT COUNT(*) AS elements FROM {}{}",
            self.dialect.quote(desc.table()),
            clause.sql
        );
        let params = self.bind_filter(&desc, &clause)?;
        let mut guard = self.pool.acquire().await?;
        let rows = guard
            .connection()?
            .query(&sql, &params, &[WireType::BigInt])
            .await?;
        let count = rows
            .first()
            .and_then(|row| row.first())
            .and_then(WireValue::as_i64)
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn tables(&self) -> DbResult<Vec<String>> {
        let mut guard = self.pool.acquire().await?;
        guard.connection()?.list_tables().await
    }

    pub async fn columns(&self, table: &str) -> DbResult<Vec<String>> {
        let mut guard = self.pool.acquire().await?;
        guard.connection()?.list_columns(table).await
    }

    /// Shut down the underlying pool.
    pub async fn shutdown(&self) -> PoolStatistics {
        self.pool.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::models::{ColumnDef, RowState};

    #[derive(Debug, Default)]
    struct Tag {
        id: i32,
        label: String,
        state: RowState,
    }

    impl_entity!(Tag, state, table = "tags", {
        id => ColumnDef::primary().auto_increment(),
        label => ColumnDef::unique(),
    });

    async fn memory_handler() -> DataHandler {
        let settings = PoolSettings {
            min_pool_size: Some(1),
            max_pool_size: Some(1),
            ..PoolSettings::default()
        };
        let config = ConnectionConfig::new("sqlite::memory:", settings).unwrap();
        DataHandler::connect(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_narrowed_key() {
        let handler = memory_handler().await;
        let mut tag = Tag {
            label: "red".into(),
            ..Tag::default()
        };
        handler.insert(&mut tag).await.unwrap();
        assert!(tag.is_loaded());
        assert_eq!(tag.id, 1);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_filter_column_rejected() {
        let handler = memory_handler().await;
        let filter = QueryFilter::new().equals("colour", "red");
        let err = handler.load::<Tag>(&filter).await.unwrap_err();
        assert!(matches!(err, DbError::UnknownColumn { .. }));
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_range_on_text_column_rejected() {
        let handler = memory_handler().await;
        let filter = QueryFilter::new().between("label", 1, 5).unwrap();
        let err = handler.count::<Tag>(&filter).await.unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFilter { .. }));

        let filter = QueryFilter::new().between("id", 1, 5).unwrap();
        assert_eq!(handler.count::<Tag>(&filter).await.unwrap(), 0);
        handler.shutdown().await;
    }

    #[tokio::test]
    async fn test_insert_sql_without_columns() {
        let handler = memory_handler().await;
        let desc = handler.register::<Tag>().await.unwrap();
        assert_eq!(handler.insert_sql(&desc, &[]), "INSERT INTO `tags` DEFAULT VALUES");
        let columns: Vec<&ColumnDescriptor> = desc.insertable_columns().collect();
        assert_eq!(
            handler.insert_sql(&desc, &columns),
            "INSERT INTO `tags` (`label`) VALUES (?)"
        );
        handler.shutdown().await;
    }
}
