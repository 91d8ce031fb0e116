//! Query filters.
//!
//! A [`QueryFilter`] accumulates predicates and sort/group/limit directives.
//! Rendering never mutates the filter, so the same filter always produces the
//! same SQL text and parameter order.

use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use crate::models::value::Value;
use serde::{Deserialize, Serialize};

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    NotEquals,
    Like,
    ILike,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::Greater => ">",
            Self::Less => "<",
            Self::GreaterOrEqual => ">=",
            Self::LessOrEqual => "<=",
            Self::NotEquals => "!=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
        }
    }

    /// Operators that make sense on a string length.
    pub fn is_length_safe(&self) -> bool {
        !matches!(self, Self::Like | Self::ILike)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// How a rendered parameter must be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamBinding {
    /// Coerced with the referenced column's kind.
    Column,
    /// An integer compared against `LENGTH(column)`.
    Length,
}

/// A bound parameter produced by rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParam {
    pub column: String,
    pub value: Value,
    pub binding: ParamBinding,
}

/// Rendered WHERE clause: SQL text with `?` placeholders and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedClause {
    pub sql: String,
    pub params: Vec<FilterParam>,
}

#[derive(Debug, Clone, PartialEq)]
struct Comparison {
    field: String,
    value: Value,
    op: Operator,
}

#[derive(Debug, Clone, PartialEq)]
struct LengthPredicate {
    field: String,
    length: i64,
    op: Operator,
}

#[derive(Debug, Clone, PartialEq)]
struct Range {
    field: String,
    start: Value,
    end: Value,
}

/// Accumulator of predicates plus sort, group, limit and offset directives.
///
/// Adding a second predicate of the same kind for a field replaces the first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    comparisons: Vec<Comparison>,
    lengths: Vec<LengthPredicate>,
    ranges: Vec<Range>,
    sorts: Vec<(String, SortOrder)>,
    group_by: Vec<String>,
    limit: u64,
    offset: u64,
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.compare(field, value, Operator::Equals)
    }

    pub fn like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.compare(field, pattern.into(), Operator::Like)
    }

    pub fn compare(mut self, field: impl Into<String>, value: impl Into<Value>, op: Operator) -> Self {
        let field = field.into();
        let predicate = Comparison {
            field: field.clone(),
            value: value.into(),
            op,
        };
        upsert(&mut self.comparisons, predicate, |c| c.field == field);
        self
    }

    /// `LENGTH(field) = length`.
    pub fn length(self, field: impl Into<String>, length: i64) -> Self {
        let mut filter = self;
        filter.push_length(field.into(), length, Operator::Equals);
        filter
    }

    /// `LENGTH(field) <op> length`. Pattern operators are rejected.
    pub fn length_with(mut self, field: impl Into<String>, length: i64, op: Operator) -> DbResult<Self> {
        let field = field.into();
        if !op.is_length_safe() {
            return Err(DbError::unsupported_filter(
                field,
                format!("{} cannot compare a length", op.as_sql()),
            ));
        }
        self.push_length(field, length, op);
        Ok(self)
    }

    fn push_length(&mut self, field: String, length: i64, op: Operator) {
        let predicate = LengthPredicate {
            field: field.clone(),
            length,
            op,
        };
        upsert(&mut self.lengths, predicate, |l| l.field == field);
    }

    /// `field BETWEEN start AND end`. Both bounds must be numeric or both timestamps.
    pub fn between(
        mut self,
        field: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> DbResult<Self> {
        let field = field.into();
        let (start, end) = (start.into(), end.into());
        let numeric = start.is_numeric() && end.is_numeric();
        let temporal = start.is_timestamp() && end.is_timestamp();
        if !numeric && !temporal {
            return Err(DbError::unsupported_filter(
                field,
                format!(
                    "BETWEEN needs two numbers or two timestamps, got {} and {}",
                    start.type_name(),
                    end.type_name()
                ),
            ));
        }
        let range = Range {
            field: field.clone(),
            start,
            end,
        };
        upsert(&mut self.ranges, range, |r| r.field == field);
        Ok(self)
    }

    /// Sort directive; sorts apply in insertion order.
    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        let field = field.into();
        match self.sorts.iter_mut().find(|(f, _)| *f == field) {
            Some(existing) => existing.1 = order,
            None => self.sorts.push((field, order)),
        }
        self
    }

    pub fn asc(self, field: impl Into<String>) -> Self {
        self.order_by(field, SortOrder::Asc)
    }

    pub fn desc(self, field: impl Into<String>) -> Self {
        self.order_by(field, SortOrder::Desc)
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.group_by.contains(&field) {
            self.group_by.push(field);
        }
        self
    }

    /// Row limit; 0 means unlimited.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn page(self, limit: u64, offset: u64) -> Self {
        self.limit(limit).offset(offset)
    }

    pub fn limit_value(&self) -> u64 {
        self.limit
    }

    pub fn offset_value(&self) -> u64 {
        self.offset
    }

    /// True when no predicate of any kind has been added.
    pub fn has_predicates(&self) -> bool {
        !(self.comparisons.is_empty() && self.lengths.is_empty() && self.ranges.is_empty())
    }

    /// Every field referenced by a predicate, sort or grouping.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.comparisons
            .iter()
            .map(|c| c.field.as_str())
            .chain(self.lengths.iter().map(|l| l.field.as_str()))
            .chain(self.ranges.iter().map(|r| r.field.as_str()))
            .chain(self.sorts.iter().map(|(f, _)| f.as_str()))
            .chain(self.group_by.iter().map(String::as_str))
    }

    /// Fields constrained by a BETWEEN range.
    pub fn range_fields(&self) -> impl Iterator<Item = &str> {
        self.ranges.iter().map(|r| r.field.as_str())
    }

    /// Render the WHERE clause (with a leading space) or an empty string.
    pub fn render_where(&self, dialect: DatabaseType) -> RenderedClause {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        for c in &self.comparisons {
            let column = dialect.quote(&c.field);
            match (&c.value, c.op) {
                (Value::Null, Operator::Equals) => clauses.push(format!("{column} IS NULL")),
                (Value::Null, Operator::NotEquals) => {
                    clauses.push(format!("{column} IS NOT NULL"))
                }
                _ => {
                    clauses.push(format!("{column} {} ?", dialect.operator_sql(c.op)));
                    params.push(FilterParam {
                        column: c.field.clone(),
                        value: c.value.clone(),
                        binding: ParamBinding::Column,
                    });
                }
            }
        }

        for l in &self.lengths {
            clauses.push(format!(
                "LENGTH({}) {} ?",
                dialect.quote(&l.field),
                l.op.as_sql()
            ));
            params.push(FilterParam {
                column: l.field.clone(),
                value: Value::Long(l.length),
                binding: ParamBinding::Length,
            });
        }

        for r in &self.ranges {
            clauses.push(format!("{} BETWEEN ? AND ?", dialect.quote(&r.field)));
            for bound in [&r.start, &r.end] {
                params.push(FilterParam {
                    column: r.field.clone(),
                    value: bound.clone(),
                    binding: ParamBinding::Column,
                });
            }
        }

        if clauses.is_empty() {
            return RenderedClause::default();
        }
        RenderedClause {
            sql: format!(" WHERE {}", clauses.join(" AND ")),
            params,
        }
    }

    /// Render GROUP BY, ORDER BY, LIMIT and OFFSET (with a leading space when non-empty).
    pub fn render_tail(&self, dialect: DatabaseType) -> String {
        let mut sql = String::new();

        if !self.group_by.is_empty() {
            let fields: Vec<String> = self.group_by.iter().map(|f| dialect.quote(f)).collect();
            sql.push_str(&format!(" GROUP BY {}", fields.join(", ")));
        }

        if !self.sorts.is_empty() {
            let sorts: Vec<String> = self
                .sorts
                .iter()
                .map(|(f, order)| format!("{} {}", dialect.quote(f), order.as_sql()))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", sorts.join(", ")));
        }

        if self.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", self.limit));
        } else if self.offset > 0 {
            if let Some(unbounded) = dialect.unbounded_limit() {
                sql.push_str(&format!(" LIMIT {unbounded}"));
            }
        }

        if self.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", self.offset));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryFilter {
        QueryFilter::new()
            .equals("name", "alice")
            .compare("age", 18, Operator::GreaterOrEqual)
            .length_with("name", 3, Operator::Greater)
            .unwrap()
            .between("score", 1.5, 9.5)
            .unwrap()
    }

    #[test]
    fn test_clause_order_comparison_length_between() {
        let rendered = sample().render_where(DatabaseType::MySQL);
        assert_eq!(
            rendered.sql,
            " WHERE `name` = ? AND `age` >= ? AND LENGTH(`name`) > ? AND `score` BETWEEN ? AND ?"
        );
        let values: Vec<&Value> = rendered.params.iter().map(|p| &p.value).collect();
        assert_eq!(
            values,
            vec![
                &Value::Text("alice".into()),
                &Value::Int(18),
                &Value::Long(3),
                &Value::Double(1.5),
                &Value::Double(9.5)
            ]
        );
        assert_eq!(rendered.params[2].binding, ParamBinding::Length);
    }

    #[test]
    fn test_render_is_deterministic() {
        let filter = sample().asc("name").desc("age").limit(5);
        let first = filter.render_where(DatabaseType::PostgreSQL);
        let second = filter.render_where(DatabaseType::PostgreSQL);
        assert_eq!(first, second);
        assert_eq!(
            filter.render_tail(DatabaseType::PostgreSQL),
            filter.render_tail(DatabaseType::PostgreSQL)
        );
    }

    #[test]
    fn test_postgres_does_not_quote() {
        let rendered = QueryFilter::new()
            .equals("name", "a")
            .render_where(DatabaseType::PostgreSQL);
        assert_eq!(rendered.sql, " WHERE name = ?");
    }

    #[test]
    fn test_empty_filter_renders_nothing() {
        let filter = QueryFilter::new();
        assert!(!filter.has_predicates());
        assert_eq!(filter.render_where(DatabaseType::SQLite), RenderedClause::default());
        assert_eq!(filter.render_tail(DatabaseType::SQLite), "");
    }

    #[test]
    fn test_length_rejects_pattern_operators() {
        let err = QueryFilter::new()
            .length_with("name", 3, Operator::Like)
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedFilter { .. }));
        assert!(QueryFilter::new().length_with("name", 3, Operator::ILike).is_err());
    }

    #[test]
    fn test_between_rejects_text() {
        assert!(QueryFilter::new().between("name", "a", "z").is_err());
        assert!(QueryFilter::new().between("age", 1, "z").is_err());
    }

    #[test]
    fn test_same_field_replaces_predicate() {
        let rendered = QueryFilter::new()
            .equals("age", 1)
            .equals("name", "x")
            .equals("age", 2)
            .render_where(DatabaseType::SQLite);
        assert_eq!(rendered.sql, " WHERE `age` = ? AND `name` = ?");
        assert_eq!(rendered.params[0].value, Value::Int(2));
    }

    #[test]
    fn test_null_comparison_renders_is_null() {
        let rendered = QueryFilter::new()
            .equals("deleted_at", Value::Null)
            .compare("name", Value::Null, Operator::NotEquals)
            .render_where(DatabaseType::SQLite);
        assert_eq!(
            rendered.sql,
            " WHERE `deleted_at` IS NULL AND `name` IS NOT NULL"
        );
        assert!(rendered.params.is_empty());
    }

    #[test]
    fn test_ilike_outside_postgres() {
        let filter = QueryFilter::new().compare("name", "a%", Operator::ILike);
        assert_eq!(
            filter.render_where(DatabaseType::PostgreSQL).sql,
            " WHERE name ILIKE ?"
        );
        assert_eq!(filter.render_where(DatabaseType::MySQL).sql, " WHERE `name` LIKE ?");
    }

    #[test]
    fn test_tail_order() {
        let filter = QueryFilter::new()
            .group_by("age")
            .desc("id")
            .asc("name")
            .page(10, 20);
        assert_eq!(
            filter.render_tail(DatabaseType::MySQL),
            " GROUP BY `age` ORDER BY `id` DESC, `name` ASC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_offset_without_limit() {
        let filter = QueryFilter::new().offset(5);
        assert_eq!(filter.render_tail(DatabaseType::PostgreSQL), " OFFSET 5");
        assert_eq!(filter.render_tail(DatabaseType::SQLite), " LIMIT -1 OFFSET 5");
        assert_eq!(
            filter.render_tail(DatabaseType::MySQL),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
    }

    #[test]
    fn test_fields_lists_everything() {
        let filter = sample().asc("id").group_by("age");
        let fields: Vec<&str> = filter.fields().collect();
        assert_eq!(fields, vec!["name", "age", "name", "score", "id", "age"]);
    }
}
