//! Dirty Queue (`denorm_dirty_instance`)
//!
//! Trigger bodies write one row per entity whose denormalized values must
//! be recomputed: the owner's content type (`schema.table`), its id, and
//! the id it had before the change. An external worker consumes the rows.

use pgrx::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{DIRTY_QUEUE_TABLE, EXTENSION_SCHEMA};
use crate::error::{DenormError, DenormResult};
use crate::sql::{NestedSelect, QualifiedName, ValueExpr};
use crate::trigger::TriggerAction;

const QUEUE_COLUMNS: [&str; 3] = ["content_type", "object_id", "old_object_id"];

pub fn queue_table() -> QualifiedName {
    QualifiedName::new(EXTENSION_SCHEMA, DIRTY_QUEUE_TABLE)
}

/// `INSERT INTO <queue> VALUES (content_type, object_id, old_object_id)`.
/// Rows already pending are left alone.
pub fn enqueue(content_type: &str, object_id: ValueExpr, old_object_id: ValueExpr) -> DenormResult<TriggerAction> {
    Ok(TriggerAction::insert(
        queue_table(),
        &QUEUE_COLUMNS,
        vec![ValueExpr::text(content_type), object_id, old_object_id],
    )?
    .ignore_conflicts())
}

/// `INSERT INTO <queue> SELECT ...`; the select projects the three queue
/// columns
pub fn enqueue_select(select: NestedSelect) -> DenormResult<TriggerAction> {
    Ok(TriggerAction::insert_select(queue_table(), &QUEUE_COLUMNS, select)?.ignore_conflicts())
}

/// One pending row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyRecord {
    pub id: i64,
    pub content_type: String,
    pub object_id: String,
    pub old_object_id: Option<String>,
    pub created_at: String,
}

/// Number of rows waiting for recomputation
pub fn pending_count() -> DenormResult<i64> {
    let query = format!("SELECT count(*) FROM {}", queue_table().to_sql());
    Spi::get_one::<i64>(&query)
        .map(|count| count.unwrap_or(0))
        .map_err(|e| DenormError::SpiError {
            query,
            error: e.to_string(),
        })
}

/// The oldest pending rows, at most `limit`
pub fn pending(limit: i64) -> DenormResult<Vec<DirtyRecord>> {
    let query = format!(
        "SELECT id, content_type, object_id, old_object_id, created_at::text AS created_at
         FROM {}
         ORDER BY id
         LIMIT {}",
        queue_table().to_sql(),
        limit.max(0)
    );

    Spi::connect(|client| {
        let rows = client.select(&query, None, None)?;
        let mut records = Vec::new();

        for row in rows {
            records.push(DirtyRecord {
                id: row["id"].value()?.unwrap_or_default(),
                content_type: row["content_type"].value()?.unwrap_or_default(),
                object_id: row["object_id"].value()?.unwrap_or_default(),
                old_object_id: row["old_object_id"].value()?,
                created_at: row["created_at"].value()?.unwrap_or_default(),
            });
        }

        Ok(records)
    })
    .map_err(|e: pgrx::spi::Error| DenormError::SpiError {
        query: query.clone(),
        error: e.to_string(),
    })
}


#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod pg_tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_pending_rows() {
        assert_eq!(pending_count(), Ok(0));

        Spi::run(
            "INSERT INTO public.denorm_dirty_instance (content_type, object_id, old_object_id)
             VALUES ('public.post', '1', NULL), ('public.post', '2', '1')",
        )
        .unwrap();

        assert_eq!(pending_count(), Ok(2));
        let rows = pending(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].object_id, "1");
        assert_eq!(rows[0].old_object_id, None);
        assert_eq!(rows[1].old_object_id.as_deref(), Some("1"));
        assert_eq!(pending(1).unwrap().len(), 1);
    }
}
