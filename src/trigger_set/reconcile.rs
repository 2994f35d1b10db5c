//! Applying a [`TriggerSet`] to the live catalog
//!
//! Two phases, each one atomic unit (see [`crate::xact::atomic`]):
//!
//! 1. `drop_unneeded`: drop installed triggers no declaration requires
//! 2. `install`: create missing triggers, refresh stale function bodies
//!
//! Triggers that already match are never touched, so a converged schema
//! sees no DDL at all.

use pgrx::prelude::*;
use serde::{Deserialize, Serialize};

use super::{installed_triggers, InstalledTrigger, TriggerSet};
use crate::error::{DenormError, DenormResult};
use crate::sql::QualifiedName;
use crate::trigger::drop_statements;
use crate::xact;

/// Outcome of the install phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub installed: Vec<String>,
    pub refreshed: Vec<String>,
}

/// Outcome of a full reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub dropped: Vec<String>,
    pub installed: Vec<String>,
    pub refreshed: Vec<String>,
    pub finished_at: String,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.dropped.is_empty() && self.installed.is_empty() && self.refreshed.is_empty()
    }
}

/// Execute DDL for one trigger, attributing any failure to it
fn run_ddl(trigger: &str, table: &QualifiedName, operation: &str, statements: &[String]) -> DenormResult<()> {
    for sql in statements {
        let pg_error = match xact::guarded(|| Spi::run(sql)) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(message) => message,
        };

        return Err(DenormError::TriggerDdlFailed {
            trigger: trigger.to_string(),
            table: table.to_string(),
            operation: operation.to_string(),
            pg_error,
        });
    }
    Ok(())
}

fn drop_installed(trigger: &InstalledTrigger) -> DenormResult<()> {
    run_ddl(&trigger.name, &trigger.table, "drop", &drop_statements(&trigger.name, &trigger.table))?;
    info!("pg_denorm: dropped trigger {} on {}", trigger.name, trigger.table);
    Ok(())
}

impl TriggerSet {
    /// Drop every installed trigger of the family this set does not
    /// require. Returns the dropped names.
    pub fn drop_unneeded(&self) -> DenormResult<Vec<String>> {
        xact::atomic(|| {
            let plan = self.plan(&installed_triggers()?);
            for trigger in &plan.drops {
                drop_installed(trigger)?;
            }
            Ok(plan.drops.into_iter().map(|t| t.name).collect())
        })
    }

    /// Create every required trigger that is not installed and refresh
    /// the function of those whose body drifted.
    pub fn install(&self) -> DenormResult<InstallOutcome> {
        xact::atomic(|| {
            let plan = self.plan(&installed_triggers()?);
            let mut outcome = InstallOutcome::default();

            for name in &plan.refreshes {
                let Some(trigger) = self.get(name) else { continue };
                run_ddl(name, &trigger.subject, "refresh", &[trigger.function_sql()])?;
                info!("pg_denorm: refreshed trigger function {}", trigger.function_name());
                outcome.refreshed.push(name.clone());
            }

            for name in &plan.installs {
                let Some(trigger) = self.get(name) else { continue };
                run_ddl(name, &trigger.subject, "install", &trigger.sql())?;
                info!("pg_denorm: installed trigger {} on {}", name, trigger.subject);
                outcome.installed.push(name.clone());
            }

            Ok(outcome)
        })
    }

    /// Drop every installed trigger of the family, required or not
    pub fn drop_all() -> DenormResult<Vec<String>> {
        xact::atomic(|| {
            let installed = installed_triggers()?;
            for trigger in &installed {
                drop_installed(trigger)?;
            }
            Ok(installed.into_iter().map(|t| t.name).collect())
        })
    }

    /// `drop_unneeded` followed by `install`
    pub fn smart_refresh(&self) -> DenormResult<ReconcileReport> {
        let dropped = self.drop_unneeded()?;
        let outcome = self.install()?;

        let report = ReconcileReport {
            dropped,
            installed: outcome.installed,
            refreshed: outcome.refreshed,
            finished_at: chrono::Utc::now().to_rfc3339(),
        };

        if report.is_noop() {
            info!("pg_denorm: {} triggers already up to date", self.len());
        } else {
            info!(
                "pg_denorm: reconciled triggers: {} installed, {} refreshed, {} dropped",
                report.installed.len(),
                report.refreshed.len(),
                report.dropped.len()
            );
        }

        Ok(report)
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::sql::ValueExpr;
    use crate::trigger::{Trigger, TriggerAction, TriggerEvent, TriggerTiming};

    fn counting_trigger(table: &str, event: TriggerEvent) -> Trigger {
        Trigger::new(QualifiedName::new("public", table), TriggerTiming::After, event).with_action(
            TriggerAction::update(
                QualifiedName::new("public", "rc_counter"),
                &["hits"],
                vec![ValueExpr::raw("hits + 1")],
                Vec::new(),
            )
            .unwrap(),
        )
    }

    fn setup() {
        Spi::run("CREATE TABLE rc_counter (hits INT NOT NULL)").unwrap();
        Spi::run("INSERT INTO rc_counter VALUES (0)").unwrap();
        Spi::run("CREATE TABLE rc_item (id INT PRIMARY KEY, label TEXT)").unwrap();
        Spi::run("CREATE TABLE rc_other (id INT PRIMARY KEY)").unwrap();
    }

    fn hits() -> i32 {
        Spi::get_one::<i32>("SELECT hits FROM rc_counter").unwrap().unwrap_or(-1)
    }

    fn ours() -> Vec<String> {
        installed_triggers()
            .unwrap()
            .into_iter()
            .filter(|t| t.table.name.starts_with("rc_"))
            .map(|t| t.name)
            .collect()
    }

    #[pg_test]
    fn test_install_then_idempotent() {
        setup();
        let mut set = TriggerSet::new();
        set.append(counting_trigger("rc_item", TriggerEvent::Insert)).unwrap();

        let first = set.smart_refresh().unwrap();
        assert_eq!(first.installed, vec!["denorm_after_row_insert_on_rc_item".to_string()]);

        Spi::run("INSERT INTO rc_item VALUES (1, 'a')").unwrap();
        assert_eq!(hits(), 1);

        let second = set.smart_refresh().unwrap();
        assert!(second.is_noop());
    }

    #[pg_test]
    fn test_reconcile_diff() {
        setup();
        let t1 = counting_trigger("rc_item", TriggerEvent::Insert);
        let t2 = counting_trigger("rc_item", TriggerEvent::Delete);
        let t3 = counting_trigger("rc_other", TriggerEvent::Insert);

        let mut before = TriggerSet::new();
        before.append(t1.clone()).unwrap();
        before.append(t2.clone()).unwrap();
        before.smart_refresh().unwrap();

        let mut after = TriggerSet::new();
        after.append(t2.clone()).unwrap();
        after.append(t3.clone()).unwrap();
        let report = after.smart_refresh().unwrap();

        assert_eq!(report.dropped, vec![t1.name()]);
        assert_eq!(report.installed, vec![t3.name()]);
        assert!(report.refreshed.is_empty());

        let mut installed = ours();
        installed.sort();
        assert_eq!(installed, vec![t2.name(), t3.name()]);
    }

    #[pg_test]
    fn test_drifted_body_is_refreshed_in_place() {
        setup();
        let mut set = TriggerSet::new();
        set.append(counting_trigger("rc_item", TriggerEvent::Insert)).unwrap();
        set.smart_refresh().unwrap();

        let oid_before = Spi::get_one::<pg_sys::Oid>(
            "SELECT oid FROM pg_trigger WHERE tgname = 'denorm_after_row_insert_on_rc_item'",
        )
        .unwrap();

        let mut changed = set.clone();
        changed.append(counting_trigger("rc_item", TriggerEvent::Insert).with_action(
            TriggerAction::update(
                QualifiedName::new("public", "rc_counter"),
                &["hits"],
                vec![ValueExpr::raw("hits + 10")],
                Vec::new(),
            )
            .unwrap(),
        ))
        .unwrap();

        let report = changed.smart_refresh().unwrap();
        assert_eq!(report.refreshed, vec!["denorm_after_row_insert_on_rc_item".to_string()]);
        assert!(report.installed.is_empty());

        let oid_after = Spi::get_one::<pg_sys::Oid>(
            "SELECT oid FROM pg_trigger WHERE tgname = 'denorm_after_row_insert_on_rc_item'",
        )
        .unwrap();
        assert_eq!(oid_before, oid_after);

        Spi::run("INSERT INTO rc_item VALUES (1, 'a')").unwrap();
        assert_eq!(hits(), 11);
    }

    #[pg_test]
    fn test_failed_install_leaves_nothing() {
        setup();
        let mut set = TriggerSet::new();
        set.append(counting_trigger("rc_item", TriggerEvent::Insert)).unwrap();
        set.append(counting_trigger("rc_missing", TriggerEvent::Insert)).unwrap();

        let result = set.install();
        match result {
            Err(DenormError::TriggerDdlFailed { trigger, operation, .. }) => {
                assert_eq!(trigger, "denorm_after_row_insert_on_rc_missing");
                assert_eq!(operation, "install");
            }
            other => panic!("expected DDL failure, got {:?}", other),
        }
        assert!(ours().is_empty());
    }

    #[pg_test]
    fn test_drop_all_removes_family_only() {
        setup();
        Spi::run(
            "CREATE FUNCTION rc_noop() RETURNS TRIGGER AS $$ BEGIN RETURN NULL; END; $$ LANGUAGE plpgsql",
        )
        .unwrap();
        Spi::run("CREATE TRIGGER rc_audit AFTER INSERT ON rc_item FOR EACH ROW EXECUTE PROCEDURE rc_noop()")
            .unwrap();

        let mut set = TriggerSet::new();
        set.append(counting_trigger("rc_item", TriggerEvent::Update)).unwrap();
        set.smart_refresh().unwrap();

        let dropped = TriggerSet::drop_all().unwrap();
        assert!(dropped.contains(&"denorm_after_row_update_on_rc_item".to_string()));
        assert!(ours().is_empty());

        let foreign = Spi::get_one::<i64>("SELECT count(*) FROM pg_trigger WHERE tgname = 'rc_audit'")
            .unwrap()
            .unwrap_or(0);
        assert_eq!(foreign, 1);

        let function = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_proc WHERE proname = 'func_denorm_after_row_update_on_rc_item'",
        )
        .unwrap()
        .unwrap_or(0);
        assert_eq!(function, 0);
    }

    #[pg_test]
    fn test_prefixed_user_trigger_is_left_alone() {
        setup();
        Spi::run(
            "CREATE FUNCTION func_denorm_audit_rc_item() RETURNS TRIGGER AS $$ BEGIN RETURN NULL; END; $$ \
             LANGUAGE plpgsql",
        )
        .unwrap();
        Spi::run(
            "CREATE TRIGGER denorm_audit_rc_item AFTER INSERT ON rc_item \
             FOR EACH ROW EXECUTE PROCEDURE func_denorm_audit_rc_item()",
        )
        .unwrap();

        let mut set = TriggerSet::new();
        set.append(counting_trigger("rc_item", TriggerEvent::Insert)).unwrap();
        let report = set.smart_refresh().unwrap();
        assert!(report.dropped.is_empty());

        let dropped = TriggerSet::drop_all().unwrap();
        assert_eq!(dropped, vec!["denorm_after_row_insert_on_rc_item".to_string()]);

        let survivors = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_trigger t JOIN pg_proc p ON p.oid = t.tgfoid
             WHERE t.tgname = 'denorm_audit_rc_item' AND p.proname = 'func_denorm_audit_rc_item'",
        )
        .unwrap();
        assert_eq!(survivors, Some(1));
    }

    #[pg_test]
    fn test_failed_drop_restores_every_trigger() {
        setup();
        let mut before = TriggerSet::new();
        before.append(counting_trigger("rc_item", TriggerEvent::Delete)).unwrap();
        before.append(counting_trigger("rc_other", TriggerEvent::Insert)).unwrap();
        before.smart_refresh().unwrap();

        // a second user of the function blocks DROP FUNCTION
        Spi::run(
            "CREATE TRIGGER rc_pinned AFTER UPDATE ON rc_other \
             FOR EACH ROW EXECUTE PROCEDURE public.func_denorm_after_row_insert_on_rc_other()",
        )
        .unwrap();

        match TriggerSet::new().drop_unneeded() {
            Err(DenormError::TriggerDdlFailed { trigger, operation, .. }) => {
                assert_eq!(trigger, "denorm_after_row_insert_on_rc_other");
                assert_eq!(operation, "drop");
            }
            other => panic!("expected DDL failure, got {:?}", other),
        }

        let mut installed = ours();
        installed.sort();
        assert_eq!(
            installed,
            vec![
                "denorm_after_row_delete_on_rc_item".to_string(),
                "denorm_after_row_insert_on_rc_other".to_string(),
            ]
        );
    }
}
