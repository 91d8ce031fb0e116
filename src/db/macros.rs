//! Macros for reducing code duplication.
//!
//! `impl_db_dispatch!` expands a match over the `DbConnection` variants so the
//! per-dialect submodules can be called with linear readability.
//! `impl_entity!` generates the [`Entity`](crate::models::Entity) impl for a
//! plain struct from its column list.

/// Macro for generating connection dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => mysql::ping(c).await,
///     Postgres(c) => postgres::ping(c).await,
///     SQLite(c) => sqlite::ping(c).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::connection::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

/// Implement [`Entity`](crate::models::Entity) for a struct.
///
/// Each listed field becomes a column; its kind is inferred from the field
/// type through [`ColumnValue`](crate::models::ColumnValue). The struct must
/// implement `Default` and hold a [`RowState`](crate::models::RowState) field.
///
/// `inherit field: Parent` embeds another entity: its columns come first and
/// lookups of columns not listed here are forwarded to that field.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Default)]
/// struct User {
///     id: i64,
///     name: String,
///     age: i32,
///     state: RowState,
/// }
///
/// impl_entity!(User, state, table = "users", {
///     id => ColumnDef::primary().auto_increment(),
///     name => ColumnDef::unique(),
///     age => ColumnDef::normal(),
/// });
///
/// #[derive(Debug, Default)]
/// struct Admin {
///     user: User,
///     level: i32,
///     state: RowState,
/// }
///
/// impl_entity!(Admin, state, table = "admins", inherit user: User, {
///     level => ColumnDef::normal(),
/// });
/// ```
#[macro_export]
macro_rules! impl_entity {
    ($ty:ident, $state:ident, table = $table:expr, inherit $parent:ident : $pty:ty,
     { $($field:ident => $def:expr),+ $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $state,
            $crate::models::EntityDeclaration::new(stringify!($ty))
                .table($table)
                .inherit(<$pty as $crate::models::Entity>::declare()),
            [$parent], { $($field => $def),+ });
    };
    ($ty:ident, $state:ident, inherit $parent:ident : $pty:ty,
     { $($field:ident => $def:expr),+ $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $state,
            $crate::models::EntityDeclaration::new(stringify!($ty))
                .inherit(<$pty as $crate::models::Entity>::declare()),
            [$parent], { $($field => $def),+ });
    };
    ($ty:ident, $state:ident, table = $table:expr, { $($field:ident => $def:expr),+ $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $state,
            $crate::models::EntityDeclaration::new(stringify!($ty)).table($table),
            [], { $($field => $def),+ });
    };
    ($ty:ident, $state:ident, { $($field:ident => $def:expr),+ $(,)? }) => {
        $crate::impl_entity!(@impl $ty, $state,
            $crate::models::EntityDeclaration::new(stringify!($ty)),
            [], { $($field => $def),+ });
    };
    (@get $self:ident, $name:ident, $parent:ident) => {
        $crate::models::Entity::column_value(&$self.$parent, $name)
    };
    (@get $self:ident, $name:ident,) => {
        None
    };
    (@set $self:ident, $name:ident, $value:ident, $ty:ident, $parent:ident) => {
        $crate::models::Entity::set_column_value(&mut $self.$parent, $name, $value)
    };
    (@set $self:ident, $name:ident, $value:ident, $ty:ident,) => {
        Err($crate::error::DbError::unknown_column($name, stringify!($ty)))
    };
    (@impl $ty:ident, $state:ident, $decl:expr, [$($parent:ident)?],
     { $($field:ident => $def:expr),+ }) => {
        impl $crate::models::Entity for $ty {
            fn declare() -> $crate::models::EntityDeclaration {
                $decl
                $(
                    .column(($def).bind(
                        stringify!($field),
                        $crate::models::kind_of(|row: &$ty| &row.$field),
                    ))
                )+
            }

            fn column_value(&self, field: &str) -> Option<$crate::models::Value> {
                match field {
                    $(
                        stringify!($field) => {
                            Some($crate::models::ColumnValue::to_value(&self.$field))
                        }
                    )+
                    _ => $crate::impl_entity!(@get self, field, $($parent)?),
                }
            }

            fn set_column_value(
                &mut self,
                field: &str,
                value: $crate::models::Value,
            ) -> $crate::error::DbResult<()> {
                match field {
                    $(
                        stringify!($field) => {
                            self.$field = $crate::models::ColumnValue::from_value(value)?;
                            Ok(())
                        }
                    )+
                    _ => $crate::impl_entity!(@set self, field, value, $ty, $($parent)?),
                }
            }

            fn row_state(&self) -> &$crate::models::RowState {
                &self.$state
            }

            fn row_state_mut(&mut self) -> &mut $crate::models::RowState {
                &mut self.$state
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::models::{ColumnDef, ColumnKind, ColumnRole, Entity, RowState, Value};

    #[derive(Debug, Default)]
    struct Gadget {
        id: i64,
        label: String,
        tags: Vec<String>,
        state: RowState,
    }

    impl_entity!(Gadget, state, table = "gadgets", {
        id => ColumnDef::primary().auto_increment(),
        label => ColumnDef::unique().named("gadget_label"),
        tags => ColumnDef::normal(),
    });

    #[derive(Debug, Default)]
    struct Plain {
        note: Option<String>,
        state: RowState,
    }

    impl_entity!(Plain, state, {
        note => ColumnDef::normal(),
    });

    #[derive(Debug, Default)]
    struct Widget {
        gadget: Gadget,
        weight: f64,
        state: RowState,
    }

    impl_entity!(Widget, state, table = "widgets", inherit gadget: Gadget, {
        weight => ColumnDef::normal(),
    });

    #[test]
    fn test_declaration_from_macro() {
        let decl = Gadget::declare();
        assert_eq!(decl.type_name(), "Gadget");
        assert_eq!(decl.explicit_table(), Some("gadgets"));
        let columns = decl.columns();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].role(), ColumnRole::Primary);
        assert_eq!(columns[1].explicit_name(), Some("gadget_label"));
        assert_eq!(columns[2].kind(), Some(&ColumnKind::list(ColumnKind::Text)));
        assert_eq!(Plain::declare().explicit_table(), None);
    }

    #[test]
    fn test_get_and_set_fields() {
        let mut gadget = Gadget::default();
        gadget
            .set_column_value("label", Value::Text("lamp".into()))
            .unwrap();
        gadget.set_column_value("id", Value::Long(9)).unwrap();
        assert_eq!(gadget.id, 9);
        assert_eq!(
            gadget.column_value("label"),
            Some(Value::Text("lamp".into()))
        );
        assert_eq!(gadget.column_value("nope"), None);
        assert!(gadget.set_column_value("nope", Value::Null).is_err());
        assert!(gadget.tags.is_empty());
        assert!(!gadget.is_loaded());
    }

    #[test]
    fn test_optional_field() {
        let mut plain = Plain::default();
        assert_eq!(plain.column_value("note"), Some(Value::Null));
        plain
            .set_column_value("note", Value::Text("hi".into()))
            .unwrap();
        assert_eq!(plain.note.as_deref(), Some("hi"));
    }

    #[test]
    fn test_inherited_columns_forward_to_parent() {
        let decl = Widget::declare();
        assert_eq!(decl.explicit_table(), Some("widgets"));
        let roles: Vec<ColumnRole> = decl.columns().iter().map(|c| c.role()).collect();
        assert_eq!(
            roles,
            vec![ColumnRole::Primary, ColumnRole::Unique, ColumnRole::Normal, ColumnRole::Normal]
        );

        let mut widget = Widget::default();
        widget.set_column_value("id", Value::Long(4)).unwrap();
        widget.set_column_value("weight", Value::Double(1.5)).unwrap();
        assert_eq!(widget.gadget.id, 4);
        assert_eq!(widget.column_value("label"), Some(Value::Text(String::new())));
        assert_eq!(widget.column_value("weight"), Some(Value::Double(1.5)));
        assert!(widget.set_column_value("nope", Value::Null).is_err());
    }
}
