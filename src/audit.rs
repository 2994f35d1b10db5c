use pgrx::prelude::*;

use crate::config::{AUDIT_TABLE, EXTENSION_SCHEMA};
use crate::error::{DenormError, DenormResult};
use crate::sql::quote_literal;
use crate::trigger_set::ReconcileReport;

fn insert(operation: &str, details: &serde_json::Value) -> DenormResult<()> {
    let current_user = crate::utils::current_user();

    let query = format!(
        "INSERT INTO {}.{} (operation, performed_by, details)
         VALUES ({}, {}, {}::jsonb)",
        EXTENSION_SCHEMA,
        AUDIT_TABLE,
        quote_literal(operation),
        quote_literal(&current_user),
        quote_literal(&details.to_string())
    );

    Spi::run(&query).map_err(|e| DenormError::SpiError {
        query,
        error: e.to_string(),
    })
}

/// Record a reconciliation run, unless `pg_denorm.audit` is off
pub fn log_reconcile(operation: &str, report: &ReconcileReport) -> DenormResult<()> {
    if !crate::config::audit_enabled() {
        return Ok(());
    }

    let mut details = serde_json::to_value(report)?;
    if let Some(object) = details.as_object_mut() {
        object.insert("version".to_string(), env!("CARGO_PKG_VERSION").into());
    }
    insert(operation, &details)
}

/// Record a full teardown
pub fn log_drop(dropped: &[String]) -> DenormResult<()> {
    if !crate::config::audit_enabled() {
        return Ok(());
    }

    insert(
        "DROP",
        &serde_json::json!({
            "dropped": dropped,
            "version": env!("CARGO_PKG_VERSION")
        }),
    )
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_reconcile_is_recorded() {
        let report = ReconcileReport {
            installed: vec!["denorm_after_row_insert_on_post".to_string()],
            finished_at: "2026-01-01T00:00:00+00:00".to_string(),
            ..ReconcileReport::default()
        };
        log_reconcile("RECONCILE", &report).unwrap();

        let installed = Spi::get_one::<String>(
            "SELECT details->'installed'->>0 FROM public.denorm_audit_log WHERE operation = 'RECONCILE'",
        )
        .unwrap();
        assert_eq!(installed.as_deref(), Some("denorm_after_row_insert_on_post"));
    }

    #[pg_test]
    fn test_audit_can_be_disabled() {
        Spi::run("SET LOCAL pg_denorm.audit = off").unwrap();
        log_drop(&["denorm_after_row_delete_on_post".to_string()]).unwrap();

        let count = Spi::get_one::<i64>("SELECT count(*) FROM public.denorm_audit_log").unwrap();
        assert_eq!(count, Some(0));
    }
}
