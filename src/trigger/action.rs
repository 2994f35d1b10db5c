use serde::{Deserialize, Serialize};

use crate::error::{DenormError, DenormResult};
use crate::sql::{quote_ident, NestedSelect, QualifiedName, ValueExpr};

/// Row source of an INSERT action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsertSource {
    Values(Vec<ValueExpr>),
    Select(NestedSelect),
}

impl InsertSource {
    fn arity(&self) -> usize {
        match self {
            InsertSource::Values(values) => values.len(),
            InsertSource::Select(select) => select.arity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Statement {
    Insert {
        table: QualifiedName,
        columns: Vec<String>,
        source: InsertSource,
        ignore_conflicts: bool,
    },
    Update {
        table: QualifiedName,
        columns: Vec<String>,
        values: Vec<ValueExpr>,
        filters: Vec<(String, ValueExpr)>,
    },
}

/// One statement of a trigger body.
///
/// Column and value lists always have the same length; the constructors
/// refuse anything else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerAction {
    statement: Statement,
    guard: Option<ValueExpr>,
}

impl TriggerAction {
    /// `INSERT INTO table (columns) VALUES (values)`
    pub fn insert(table: QualifiedName, columns: &[&str], values: Vec<ValueExpr>) -> DenormResult<Self> {
        Self::insert_from(table, columns, InsertSource::Values(values))
    }

    /// `INSERT INTO table (columns) SELECT ...`
    pub fn insert_select(table: QualifiedName, columns: &[&str], select: NestedSelect) -> DenormResult<Self> {
        Self::insert_from(table, columns, InsertSource::Select(select))
    }

    fn insert_from(table: QualifiedName, columns: &[&str], source: InsertSource) -> DenormResult<Self> {
        check_shape(&table, columns.len(), source.arity())?;
        Ok(Self {
            statement: Statement::Insert {
                table,
                columns: columns.iter().map(|c| c.to_string()).collect(),
                source,
                ignore_conflicts: false,
            },
            guard: None,
        })
    }

    /// `UPDATE table SET c1 = v1, ... WHERE f1 = x AND ...`
    pub fn update(
        table: QualifiedName,
        columns: &[&str],
        values: Vec<ValueExpr>,
        filters: Vec<(String, ValueExpr)>,
    ) -> DenormResult<Self> {
        check_shape(&table, columns.len(), values.len())?;
        Ok(Self {
            statement: Statement::Update {
                table,
                columns: columns.iter().map(|c| c.to_string()).collect(),
                values,
                filters,
            },
            guard: None,
        })
    }

    /// Append `ON CONFLICT DO NOTHING` to an INSERT. No effect on updates.
    pub fn ignore_conflicts(mut self) -> Self {
        if let Statement::Insert { ignore_conflicts, .. } = &mut self.statement {
            *ignore_conflicts = true;
        }
        self
    }

    /// Only run the statement when `condition` holds
    pub fn only_if(mut self, condition: ValueExpr) -> Self {
        self.guard = Some(condition);
        self
    }

    pub fn table(&self) -> &QualifiedName {
        match &self.statement {
            Statement::Insert { table, .. } | Statement::Update { table, .. } => table,
        }
    }

    /// Render as a PL/pgSQL statement, terminated by `;`
    pub fn to_sql(&self) -> String {
        let statement = match &self.statement {
            Statement::Insert { table, columns, source, ignore_conflicts } => {
                let columns = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
                let rows = match source {
                    InsertSource::Values(values) => format!(
                        "VALUES ({})",
                        values.iter().map(ValueExpr::to_sql).collect::<Vec<_>>().join(", ")
                    ),
                    InsertSource::Select(select) => select.to_sql(),
                };
                format!(
                    "INSERT INTO {} ({}) {}{};",
                    table.to_sql(),
                    columns,
                    rows,
                    if *ignore_conflicts { " ON CONFLICT DO NOTHING" } else { "" }
                )
            }
            Statement::Update { table, columns, values, filters } => {
                let assignments = columns
                    .iter()
                    .zip(values)
                    .map(|(column, value)| format!("{} = {}", quote_ident(column), value.to_sql()))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut sql = format!("UPDATE {} SET {}", table.to_sql(), assignments);
                if !filters.is_empty() {
                    let conditions = filters
                        .iter()
                        .map(|(column, value)| format!("{} = {}", quote_ident(column), value.to_sql()))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    sql.push_str(" WHERE ");
                    sql.push_str(&conditions);
                }
                sql.push(';');
                sql
            }
        };

        match &self.guard {
            Some(condition) => format!("IF {} THEN {} END IF;", condition.to_sql(), statement),
            None => statement,
        }
    }
}

fn check_shape(table: &QualifiedName, columns: usize, values: usize) -> DenormResult<()> {
    if columns != values {
        return Err(DenormError::ActionShapeMismatch {
            table: table.to_string(),
            columns,
            values,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_sqlstate;
    use crate::sql::SqlValue;

    fn queue() -> QualifiedName {
        QualifiedName::new("public", "denorm_dirty_instance")
    }

    #[test]
    fn test_insert_values() {
        let action = TriggerAction::insert(
            queue(),
            &["content_type", "object_id", "old_object_id"],
            vec![ValueExpr::text("public.author"), ValueExpr::new_row("author_id"), ValueExpr::new_row("author_id")],
        )
        .unwrap()
        .ignore_conflicts();

        assert_eq!(
            action.to_sql(),
            "INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id) \
             VALUES ('public.author', NEW.author_id, NEW.author_id) ON CONFLICT DO NOTHING;"
        );
    }

    #[test]
    fn test_insert_select() {
        let select = NestedSelect::new(
            QualifiedName::new("public", "post"),
            vec![ValueExpr::text("public.post"), ValueExpr::column("id"), ValueExpr::column("id")],
        )
        .filter("author_id", ValueExpr::old_row("id"))
        .distinct();

        let action = TriggerAction::insert_select(queue(), &["content_type", "object_id", "old_object_id"], select).unwrap();

        assert_eq!(
            action.to_sql(),
            "INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id) \
             SELECT DISTINCT 'public.post', id, id FROM public.post WHERE author_id = OLD.id;"
        );
    }

    #[test]
    fn test_guarded_insert() {
        let action = TriggerAction::insert(queue(), &["object_id"], vec![ValueExpr::new_row("owner_id")])
            .unwrap()
            .only_if(ValueExpr::new_row("owner_id").is_not_null());

        assert_eq!(
            action.to_sql(),
            "IF NEW.owner_id IS NOT NULL THEN \
             INSERT INTO public.denorm_dirty_instance (object_id) VALUES (NEW.owner_id); END IF;"
        );
    }

    #[test]
    fn test_update_with_where() {
        let action = TriggerAction::update(
            QualifiedName::new("public", "author"),
            &["post_count", "stale"],
            vec![ValueExpr::raw("post_count + 1"), SqlValue::Bool(true).into()],
            vec![("id".to_string(), ValueExpr::new_row("author_id"))],
        )
        .unwrap();

        assert_eq!(action.table().to_string(), "public.author");
        assert_eq!(
            action.to_sql(),
            "UPDATE public.author SET post_count = post_count + 1, stale = TRUE WHERE id = NEW.author_id;"
        );
    }

    #[test]
    fn test_ignore_conflicts_is_insert_only() {
        let action = TriggerAction::update(
            QualifiedName::unqualified("author"),
            &["stale"],
            vec![SqlValue::Bool(true).into()],
            Vec::new(),
        )
        .unwrap()
        .ignore_conflicts();

        assert_eq!(action.to_sql(), "UPDATE author SET stale = TRUE;");
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert_error_sqlstate(
            TriggerAction::insert(queue(), &["content_type", "object_id"], vec![ValueExpr::text("x")]),
            "42601",
        );

        let select = NestedSelect::new(QualifiedName::unqualified("post"), vec![ValueExpr::column("id")]);
        assert_error_sqlstate(
            TriggerAction::insert_select(queue(), &["content_type", "object_id"], select),
            "42601",
        );
    }
}
