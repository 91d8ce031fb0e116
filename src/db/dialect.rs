//! Dialect-specific SQL rendering.
//!
//! Identifier quoting, column types, DDL and the few places where the three
//! backends disagree on syntax.

use crate::db::schema::{ColumnDescriptor, EntityDescriptor};
use crate::models::{ColumnKind, ColumnRole, DatabaseType, Operator, UNORDERED, WireType};

impl DatabaseType {
    /// Quote an identifier. Postgres identifiers are left bare.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Self::MySQL | Self::SQLite => format!("`{}`", ident.replace('`', "``")),
            Self::PostgreSQL => ident.to_string(),
        }
    }

    /// SQL form of a comparison operator. ILIKE only exists in Postgres.
    pub fn operator_sql(&self, op: Operator) -> &'static str {
        match (self, op) {
            (Self::MySQL | Self::SQLite, Operator::ILike) => "LIKE",
            (_, op) => op.as_sql(),
        }
    }

    /// LIMIT value meaning "no limit", for an OFFSET without a LIMIT.
    pub fn unbounded_limit(&self) -> Option<&'static str> {
        match self {
            Self::MySQL => Some("18446744073709551615"),
            Self::SQLite => Some("-1"),
            Self::PostgreSQL => None,
        }
    }

    /// Wire type used to bind and read a column.
    pub fn storage_type(&self, column: &ColumnDescriptor) -> WireType {
        match &column.kind {
            ColumnKind::Boolean => WireType::Bool,
            ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int => match self {
                Self::SQLite => WireType::BigInt,
                Self::PostgreSQL if column.is_generated() => WireType::BigInt,
                _ => WireType::Int,
            },
            ColumnKind::Long => WireType::BigInt,
            ColumnKind::Float | ColumnKind::Double => WireType::Double,
            ColumnKind::Char | ColumnKind::Text | ColumnKind::Custom(_) => WireType::Text,
            ColumnKind::Timestamp => WireType::Timestamp,
        }
    }

    /// Wire type of a `LENGTH(column)` comparison operand.
    pub fn length_type(&self) -> WireType {
        match self {
            Self::SQLite => WireType::BigInt,
            Self::MySQL | Self::PostgreSQL => WireType::Int,
        }
    }

    /// Column type without constraints.
    pub fn column_sql_type(&self, column: &ColumnDescriptor) -> &'static str {
        match self {
            Self::MySQL => match &column.kind {
                ColumnKind::Boolean => "BOOLEAN",
                ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int => "INT",
                ColumnKind::Long => "BIGINT",
                ColumnKind::Float | ColumnKind::Double => "DOUBLE",
                ColumnKind::Char | ColumnKind::Text | ColumnKind::Custom(_) => {
                    if column.is_unique() {
                        "VARCHAR(255)"
                    } else {
                        "TEXT"
                    }
                }
                ColumnKind::Timestamp => "TIMESTAMP NULL",
            },
            Self::PostgreSQL => match &column.kind {
                _ if column.is_generated() => "BIGSERIAL",
                ColumnKind::Boolean => "BOOLEAN",
                ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int => "INTEGER",
                ColumnKind::Long => "BIGINT",
                ColumnKind::Float | ColumnKind::Double => "DOUBLE PRECISION",
                ColumnKind::Char | ColumnKind::Text | ColumnKind::Custom(_) => "TEXT",
                ColumnKind::Timestamp => "TIMESTAMP WITHOUT TIME ZONE",
            },
            Self::SQLite => match &column.kind {
                ColumnKind::Boolean => "BOOLEAN",
                ColumnKind::Byte | ColumnKind::Short | ColumnKind::Int | ColumnKind::Long => {
                    "INTEGER"
                }
                ColumnKind::Float | ColumnKind::Double => "REAL",
                ColumnKind::Char | ColumnKind::Text | ColumnKind::Custom(_) => "TEXT",
                ColumnKind::Timestamp => "TIMESTAMP",
            },
        }
    }

    /// Full column definition for CREATE TABLE.
    pub fn column_definition(&self, column: &ColumnDescriptor) -> String {
        let name = self.quote(&column.name);
        let ty = self.column_sql_type(column);
        let constraint = match (self, column.role) {
            (Self::MySQL, ColumnRole::Primary) => " PRIMARY KEY AUTO_INCREMENT",
            (Self::PostgreSQL, ColumnRole::Primary) => " PRIMARY KEY",
            (Self::SQLite, ColumnRole::Primary) => return format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            (_, ColumnRole::Unique) => " UNIQUE",
            // MySQL only allows AUTO_INCREMENT on a key
            (Self::MySQL, ColumnRole::Normal) if column.auto_increment => " AUTO_INCREMENT UNIQUE",
            (_, ColumnRole::Normal) => "",
        };
        format!("{name} {ty}{constraint}")
    }

    pub fn create_table_sql(&self, desc: &EntityDescriptor) -> String {
        let columns: Vec<String> = desc
            .columns()
            .iter()
            .map(|c| self.column_definition(c))
            .collect();
        let suffix = match self {
            Self::MySQL => " DEFAULT CHARSET=utf8mb4",
            Self::PostgreSQL | Self::SQLite => "",
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}){}",
            self.quote(desc.table()),
            columns.join(", "),
            suffix
        )
    }

    /// Statements adding one missing column to an existing table.
    ///
    /// Primary keys cannot be added to a populated table, so a missing
    /// primary column is added as a plain column.
    pub fn add_column_sql(&self, desc: &EntityDescriptor, column: &ColumnDescriptor) -> Vec<String> {
        let table = self.quote(desc.table());
        let name = self.quote(&column.name);
        let ty = self.column_sql_type(column);
        let position = match desc.position_of(&column.name) {
            _ if !self.supports_positional_alter() || column.order == UNORDERED => String::new(),
            Some(0) => " FIRST".to_string(),
            Some(idx) => format!(" AFTER {}", self.quote(&desc.columns()[idx - 1].name)),
            None => String::new(),
        };
        match self {
            Self::MySQL => {
                let unique = if column.is_unique() { " UNIQUE" } else { "" };
                vec![format!("ALTER TABLE {table} ADD {name} {ty}{unique}{position}")]
            }
            Self::PostgreSQL => {
                let unique = if column.is_unique() { " UNIQUE" } else { "" };
                vec![format!("ALTER TABLE {table} ADD COLUMN {name} {ty}{unique}")]
            }
            Self::SQLite => {
                let mut statements = vec![format!("ALTER TABLE {table} ADD COLUMN {name} {ty}")];
                if column.is_unique() {
                    statements.push(format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {table} ({name})",
                        self.quote(&format!("{}_{}_unique", desc.table(), column.name))
                    ));
                }
                statements
            }
        }
    }

    pub fn drop_column_sql(&self, table: &str, column: &str) -> String {
        match self {
            Self::MySQL => format!("ALTER TABLE {} DROP {}", self.quote(table), self.quote(column)),
            Self::PostgreSQL | Self::SQLite => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.quote(table),
                self.quote(column)
            ),
        }
    }

    /// Remove every row. SQLite has no TRUNCATE.
    pub fn truncate_sql(&self, table: &str) -> String {
        match self {
            Self::MySQL | Self::PostgreSQL => format!("TRUNCATE TABLE {}", self.quote(table)),
            Self::SQLite => format!("DELETE FROM {}", self.quote(table)),
        }
    }

    pub fn supports_positional_alter(&self) -> bool {
        matches!(self, Self::MySQL)
    }

    pub fn supports_bulk_copy(&self) -> bool {
        matches!(self, Self::PostgreSQL)
    }
}

/// Rewrite `?` placeholders to Postgres `$n`, skipping quoted text.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut n = 0;
    for ch in sql.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                out.push(ch);
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '?' => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(ch),
            },
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, EntityDeclaration};

    fn user() -> EntityDescriptor {
        EntityDescriptor::from_declaration(
            EntityDeclaration::new("User")
                .table("users")
                .column(ColumnDef::primary().auto_increment().bind("id", ColumnKind::Long))
                .column(ColumnDef::unique().bind("name", ColumnKind::Text))
                .column(ColumnDef::normal().position(3).bind("age", ColumnKind::Int))
                .column(ColumnDef::normal().bind("seen", ColumnKind::Timestamp)),
        )
        .unwrap()
    }

    #[test]
    fn test_quote() {
        assert_eq!(DatabaseType::MySQL.quote("name"), "`name`");
        assert_eq!(DatabaseType::SQLite.quote("na`me"), "`na``me`");
        assert_eq!(DatabaseType::PostgreSQL.quote("name"), "name");
    }

    #[test]
    fn test_ilike_outside_postgres() {
        assert_eq!(DatabaseType::PostgreSQL.operator_sql(Operator::ILike), "ILIKE");
        assert_eq!(DatabaseType::MySQL.operator_sql(Operator::ILike), "LIKE");
        assert_eq!(DatabaseType::SQLite.operator_sql(Operator::Greater), ">");
    }

    #[test]
    fn test_create_table_per_dialect() {
        let desc = user();
        assert_eq!(
            DatabaseType::MySQL.create_table_sql(&desc),
            "CREATE TABLE IF NOT EXISTS `users` (`id` BIGINT PRIMARY KEY AUTO_INCREMENT, \
             `name` VARCHAR(255) UNIQUE, `age` INT, `seen` TIMESTAMP NULL) DEFAULT CHARSET=utf8mb4"
        );
        assert_eq!(
            DatabaseType::PostgreSQL.create_table_sql(&desc),
            "CREATE TABLE IF NOT EXISTS users (id BIGSERIAL PRIMARY KEY, name TEXT UNIQUE, \
             age INTEGER, seen TIMESTAMP WITHOUT TIME ZONE)"
        );
        assert_eq!(
            DatabaseType::SQLite.create_table_sql(&desc),
            "CREATE TABLE IF NOT EXISTS `users` (`id` INTEGER PRIMARY KEY AUTOINCREMENT, \
             `name` TEXT UNIQUE, `age` INTEGER, `seen` TIMESTAMP)"
        );
    }

    #[test]
    fn test_add_column_positional_on_mysql() {
        let desc = user();
        let age = desc.column("age").unwrap();
        assert_eq!(
            DatabaseType::MySQL.add_column_sql(&desc, age),
            vec!["ALTER TABLE `users` ADD `age` INT AFTER `name`".to_string()]
        );
        let seen = desc.column("seen").unwrap();
        assert_eq!(
            DatabaseType::MySQL.add_column_sql(&desc, seen),
            vec!["ALTER TABLE `users` ADD `seen` TIMESTAMP NULL".to_string()]
        );
        // Position hints only matter where ALTER can place a column
        assert!(!DatabaseType::PostgreSQL.supports_positional_alter());
        assert_eq!(
            DatabaseType::PostgreSQL.add_column_sql(&desc, age),
            vec!["ALTER TABLE users ADD COLUMN age INTEGER".to_string()]
        );
    }

    #[test]
    fn test_bulk_copy_only_on_postgres() {
        assert!(DatabaseType::PostgreSQL.supports_bulk_copy());
        assert!(!DatabaseType::MySQL.supports_bulk_copy());
        assert!(!DatabaseType::SQLite.supports_bulk_copy());
    }

    #[test]
    fn test_add_unique_column_on_sqlite() {
        let desc = user();
        let name = desc.column("name").unwrap();
        assert_eq!(
            DatabaseType::SQLite.add_column_sql(&desc, name),
            vec![
                "ALTER TABLE `users` ADD COLUMN `name` TEXT".to_string(),
                "CREATE UNIQUE INDEX IF NOT EXISTS `users_name_unique` ON `users` (`name`)"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_storage_types() {
        let desc = user();
        let id = desc.column("id").unwrap();
        let age = desc.column("age").unwrap();
        assert_eq!(DatabaseType::PostgreSQL.storage_type(id), WireType::BigInt);
        assert_eq!(DatabaseType::PostgreSQL.storage_type(age), WireType::Int);
        assert_eq!(DatabaseType::SQLite.storage_type(age), WireType::BigInt);
        assert_eq!(
            DatabaseType::MySQL.storage_type(desc.column("name").unwrap()),
            WireType::Text
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(DatabaseType::SQLite.truncate_sql("t"), "DELETE FROM `t`");
        assert_eq!(DatabaseType::PostgreSQL.truncate_sql("t"), "TRUNCATE TABLE t");
    }

    #[test]
    fn test_number_placeholders_skips_literals() {
        assert_eq!(
            number_placeholders("SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = '?' AND c = $2"
        );
        assert_eq!(number_placeholders("VALUES ('it''s', ?)"), "VALUES ('it''s', $1)");
        assert_eq!(number_placeholders("no params"), "no params");
    }
}
