use serde::{Deserialize, Serialize};

use super::{quote_ident, quote_literal, QualifiedName};

/// A literal value. Trigger DDL cannot carry bound parameters, so literals
/// are quoted into the rendered body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn to_sql(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Text(v) => quote_literal(v),
            SqlValue::Bool(true) => "TRUE".to_string(),
            SqlValue::Bool(false) => "FALSE".to_string(),
        }
    }
}

/// Which row image a trigger body reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowVersion {
    New,
    Old,
}

impl RowVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            RowVersion::New => "NEW",
            RowVersion::Old => "OLD",
        }
    }
}

/// A value position inside a trigger action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueExpr {
    Literal(SqlValue),
    /// Column of the table the enclosing statement reads from
    Column(String),
    /// `NEW.col` / `OLD.col`
    Row(RowVersion, String),
    /// Emitted verbatim
    Raw(String),
    Select(Box<NestedSelect>),
}

impl ValueExpr {
    pub fn text(value: &str) -> Self {
        ValueExpr::Literal(SqlValue::Text(value.to_string()))
    }

    pub fn column(name: &str) -> Self {
        ValueExpr::Column(name.to_string())
    }

    pub fn new_row(column: &str) -> Self {
        ValueExpr::Row(RowVersion::New, column.to_string())
    }

    pub fn old_row(column: &str) -> Self {
        ValueExpr::Row(RowVersion::Old, column.to_string())
    }

    pub fn raw(sql: &str) -> Self {
        ValueExpr::Raw(sql.to_string())
    }

    /// `COALESCE(first, second)`
    pub fn coalesce(first: ValueExpr, second: ValueExpr) -> Self {
        ValueExpr::Raw(format!("COALESCE({}, {})", first.to_sql(), second.to_sql()))
    }

    /// `<expr> IS NOT NULL`, usable as an action guard
    pub fn is_not_null(&self) -> Self {
        ValueExpr::Raw(format!("{} IS NOT NULL", self.to_sql()))
    }

    pub fn to_sql(&self) -> String {
        match self {
            ValueExpr::Literal(value) => value.to_sql(),
            ValueExpr::Column(name) => quote_ident(name),
            ValueExpr::Row(version, name) => format!("{}.{}", version.as_str(), quote_ident(name)),
            ValueExpr::Raw(sql) => sql.clone(),
            ValueExpr::Select(select) => format!("({})", select.to_sql()),
        }
    }
}

impl From<SqlValue> for ValueExpr {
    fn from(value: SqlValue) -> Self {
        ValueExpr::Literal(value)
    }
}

impl From<NestedSelect> for ValueExpr {
    fn from(select: NestedSelect) -> Self {
        ValueExpr::Select(Box::new(select))
    }
}

/// An inline select mapping a changed row to related rows:
/// `SELECT [DISTINCT] <columns> FROM <table> WHERE a = x AND b = y`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NestedSelect {
    pub table: QualifiedName,
    pub columns: Vec<ValueExpr>,
    pub filters: Vec<(String, ValueExpr)>,
    pub distinct: bool,
}

impl NestedSelect {
    pub fn new(table: QualifiedName, columns: Vec<ValueExpr>) -> Self {
        Self {
            table,
            columns,
            filters: Vec::new(),
            distinct: false,
        }
    }

    /// Add an equality condition `column = value`
    pub fn filter(mut self, column: &str, value: ValueExpr) -> Self {
        self.filters.push((column.to_string(), value));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Number of projected expressions
    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn to_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(ValueExpr::to_sql)
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if self.distinct { "DISTINCT " } else { "" },
            columns,
            self.table.to_sql()
        );

        if !self.filters.is_empty() {
            let conditions = self
                .filters
                .iter()
                .map(|(column, value)| format!("{} = {}", quote_ident(column), value.to_sql()))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&conditions);
        }

        sql
    }
}
