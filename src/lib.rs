use pgrx::prelude::*;

mod audit;
mod utils;
mod xact;
pub mod catalog;
pub mod config;
pub mod dependency;
pub mod dirty;
pub mod error;
pub mod metadata;
pub mod model;
pub mod sql;
pub mod trigger;
pub mod trigger_set;
pub mod validation;

pub use error::{DenormError, DenormResult};

use dependency::{cache, DependencyDeclaration};
use trigger_set::{installed_triggers, ReconcileReport, TriggerSet};

pg_module_magic!();

/// Get the version of the pg_denorm extension
#[pg_extern]
fn pg_denorm_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Initialize the extension
#[pg_guard]
extern "C" fn _PG_init() {
    config::register_gucs();
}

/// Resolve every stored declaration against the current catalog.
///
/// This is the finalize phase: all referenced tables must exist now.
pub fn resolved_dependencies() -> DenormResult<Vec<dependency::ResolvedDependency>> {
    let registry = catalog::load_registry()?;
    let references = registry.references();
    let models = model::load_models(references.iter().map(String::as_str))?;
    cache::finalize_cached(&registry, &models)
}

/// The trigger set the stored declarations require
pub fn required_triggers() -> DenormResult<TriggerSet> {
    TriggerSet::from_dependencies(&resolved_dependencies()?)
}

/// Declare that rows of `owner` must be recomputed when rows of `source`
/// change. `source` may be `'self'`. Changes limited to the `skip` columns
/// of `source` are ignored. Returns false if already declared as given.
#[pg_extern]
fn denorm_depend_on_related(
    owner: &str,
    source: &str,
    foreign_key: default!(Option<&str>, "NULL"),
    skip: default!(Option<Vec<String>>, "NULL"),
) -> Result<bool, DenormError> {
    let declaration = DependencyDeclaration::new(owner, source, foreign_key).with_skip(skip.unwrap_or_default());
    catalog::register(&declaration)
}

/// Remove a declaration. Installed triggers stay until the next reconcile.
#[pg_extern]
fn denorm_forget_dependency(
    owner: &str,
    source: &str,
    foreign_key: default!(Option<&str>, "NULL"),
) -> Result<bool, DenormError> {
    catalog::forget(&DependencyDeclaration::new(owner, source, foreign_key))
}

/// Show how every declaration resolves
#[pg_extern]
fn denorm_dependencies() -> Result<
    TableIterator<
        'static,
        (
            name!(owner, String),
            name!(source, String),
            name!(foreign_key, Option<String>),
            name!(direction, String),
            name!(fk_column, String),
            name!(skip, Vec<String>),
        ),
    >,
    DenormError,
> {
    let rows = resolved_dependencies()?
        .into_iter()
        .map(|resolved| {
            let fk_column = format!("{}.{}", resolved.holder().name, resolved.foreign_key.column);
            (
                resolved.owner.name.to_string(),
                resolved.source.name.to_string(),
                resolved.declaration.foreign_key,
                resolved.direction.as_str().to_string(),
                fk_column,
                resolved.declaration.skip,
            )
        })
        .collect::<Vec<_>>();

    Ok(TableIterator::new(rows))
}

/// Show the triggers the declarations require, with their DDL
#[pg_extern]
fn denorm_required_triggers() -> Result<
    TableIterator<'static, (name!(name, String), name!(table_name, String), name!(definition, String))>,
    DenormError,
> {
    let rows = required_triggers()?
        .iter()
        .map(|trigger| (trigger.name(), trigger.subject.to_string(), trigger.sql().join(";\n")))
        .collect::<Vec<_>>();

    Ok(TableIterator::new(rows))
}

/// Show the triggers of the family currently installed
#[pg_extern]
fn denorm_installed_triggers(
) -> Result<TableIterator<'static, (name!(name, String), name!(table_name, String))>, DenormError> {
    let rows = installed_triggers()?
        .into_iter()
        .map(|trigger| (trigger.name, trigger.table.to_string()))
        .collect::<Vec<_>>();

    Ok(TableIterator::new(rows))
}

/// Reconciliation phase one: drop triggers no declaration requires
#[pg_extern]
fn denorm_drop_unneeded() -> Result<SetOfIterator<'static, String>, DenormError> {
    let dropped = required_triggers()?.drop_unneeded()?;
    audit::log_reconcile(
        "DROP_UNNEEDED",
        &ReconcileReport {
            dropped: dropped.clone(),
            finished_at: chrono::Utc::now().to_rfc3339(),
            ..ReconcileReport::default()
        },
    )?;
    Ok(SetOfIterator::new(dropped))
}

/// Reconciliation phase two: install missing triggers, refresh stale ones.
/// Returns the newly installed names.
#[pg_extern]
fn denorm_install() -> Result<SetOfIterator<'static, String>, DenormError> {
    let outcome = required_triggers()?.install()?;
    audit::log_reconcile(
        "INSTALL",
        &ReconcileReport {
            installed: outcome.installed.clone(),
            refreshed: outcome.refreshed,
            finished_at: chrono::Utc::now().to_rfc3339(),
            ..ReconcileReport::default()
        },
    )?;
    Ok(SetOfIterator::new(outcome.installed))
}

/// Drop every trigger of the family
#[pg_extern]
fn denorm_drop() -> Result<SetOfIterator<'static, String>, DenormError> {
    let dropped = TriggerSet::drop_all()?;
    audit::log_drop(&dropped)?;
    Ok(SetOfIterator::new(dropped))
}

/// Full reconciliation inside the caller's transaction.
/// Returns the newly installed trigger names.
#[pg_extern]
fn denorm_reconcile() -> Result<SetOfIterator<'static, String>, DenormError> {
    let report = required_triggers()?.smart_refresh()?;
    audit::log_reconcile("RECONCILE", &report)?;
    Ok(SetOfIterator::new(report.installed))
}

/// Rows waiting in the dirty queue
#[pg_extern]
fn denorm_pending_count() -> Result<i64, DenormError> {
    dirty::pending_count()
}

/// The oldest rows of the dirty queue
#[pg_extern]
fn denorm_pending(
    max_rows: default!(i64, 100),
) -> Result<
    TableIterator<
        'static,
        (
            name!(id, i64),
            name!(content_type, String),
            name!(object_id, String),
            name!(old_object_id, Option<String>),
            name!(created_at, String),
        ),
    >,
    DenormError,
> {
    let rows = dirty::pending(max_rows)?
        .into_iter()
        .map(|record| (record.id, record.content_type, record.object_id, record.old_object_id, record.created_at))
        .collect::<Vec<_>>();

    Ok(TableIterator::new(rows))
}

// Reconciliation committing between its two phases
extension_sql!(
    r"
    CREATE OR REPLACE PROCEDURE denorm_smart_refresh()
    LANGUAGE plpgsql AS $$
    BEGIN
        PERFORM denorm_drop_unneeded();
        COMMIT;
        PERFORM denorm_install();
        COMMIT;
    END;
    $$;
    ",
    name = "create_smart_refresh_procedure",
    requires = [denorm_drop_unneeded, denorm_install],
);

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use crate::DenormError;

    fn create_blog() {
        Spi::run("CREATE TABLE e2e_author (id BIGSERIAL PRIMARY KEY, name TEXT, bio JSON)").unwrap();
        Spi::run(
            "CREATE TABLE e2e_post (
                id BIGSERIAL PRIMARY KEY,
                author_id BIGINT REFERENCES e2e_author (id),
                title TEXT
            )",
        )
        .unwrap();
        Spi::run("CREATE TABLE e2e_tag (id BIGSERIAL PRIMARY KEY, label TEXT)").unwrap();
    }

    fn count(query: &str) -> i64 {
        Spi::get_one::<i64>(query).unwrap().unwrap_or(-1)
    }

    #[pg_test]
    fn test_version_callable_from_sql() {
        let version = Spi::get_one::<String>("SELECT pg_denorm_version()").unwrap();
        assert_eq!(version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[pg_test]
    fn test_reconcile_installs_once() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author')").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_author', 'e2e_post')").unwrap();

        assert_eq!(count("SELECT count(*) FROM denorm_reconcile()"), 6);
        assert_eq!(count("SELECT count(*) FROM denorm_reconcile()"), 0);
        assert_eq!(count("SELECT count(*) FROM denorm_installed_triggers()"), 6);
        assert_eq!(
            count("SELECT count(*) FROM denorm_audit_log WHERE operation = 'RECONCILE'"),
            2
        );
    }

    #[pg_test]
    fn test_dependencies_report_directions() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author')").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_author', 'e2e_post', 'author')").unwrap();

        let forward = Spi::get_one::<String>(
            "SELECT direction FROM denorm_dependencies() WHERE owner = 'public.e2e_post'",
        )
        .unwrap();
        let backward = Spi::get_one::<String>(
            "SELECT fk_column FROM denorm_dependencies() WHERE direction = 'backward'",
        )
        .unwrap();

        assert_eq!(forward.as_deref(), Some("forward"));
        assert_eq!(backward.as_deref(), Some("public.e2e_post.author_id"));
    }

    #[pg_test]
    fn test_writes_enqueue_owners() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author')").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_author', 'e2e_post')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();

        Spi::run("INSERT INTO e2e_author (id, name) VALUES (1, 'Ada')").unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), 0);

        Spi::run("INSERT INTO e2e_post (id, author_id, title) VALUES (10, 1, 'Notes')").unwrap();
        assert_eq!(
            count(
                "SELECT count(*) FROM denorm_dirty_instance
                 WHERE content_type = 'public.e2e_author' AND object_id = '1' AND old_object_id = '1'"
            ),
            1
        );

        Spi::run("UPDATE e2e_author SET name = 'Ada L.' WHERE id = 1").unwrap();
        assert_eq!(
            count(
                "SELECT count(*) FROM denorm_dirty_instance
                 WHERE content_type = 'public.e2e_post' AND object_id = '10'"
            ),
            1
        );

        // no column changed: the update trigger body is skipped
        let before = count("SELECT denorm_pending_count()");
        Spi::run("UPDATE e2e_author SET name = name WHERE id = 1").unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), before);

        Spi::run("INSERT INTO e2e_post (id, author_id, title) VALUES (11, NULL, 'Orphan')").unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), before);
    }

    #[pg_test]
    fn test_backward_update_records_previous_owner() {
        create_blog();
        Spi::run("INSERT INTO e2e_author (id, name) VALUES (1, 'Ada'), (2, 'Grace')").unwrap();
        Spi::run("INSERT INTO e2e_post (id, author_id, title) VALUES (10, 1, 'Notes')").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_author', 'e2e_post')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();

        Spi::run("UPDATE e2e_post SET author_id = 2 WHERE id = 10").unwrap();
        assert_eq!(
            count(
                "SELECT count(*) FROM denorm_dirty_instance
                 WHERE content_type = 'public.e2e_author' AND object_id = '2' AND old_object_id = '1'"
            ),
            1
        );

        Spi::run("DELETE FROM e2e_post WHERE id = 10").unwrap();
        assert_eq!(
            count(
                "SELECT count(*) FROM denorm_dirty_instance
                 WHERE object_id = '2' AND old_object_id = '2'"
            ),
            1
        );
    }

    #[pg_test]
    fn test_pending_lists_oldest_first() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_author', 'e2e_post')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();
        Spi::run("INSERT INTO e2e_author (id, name) VALUES (1, 'Ada'), (2, 'Grace')").unwrap();
        Spi::run("INSERT INTO e2e_post (id, author_id, title) VALUES (10, 2, 'Notes'), (11, 1, 'Letters')").unwrap();

        assert_eq!(count("SELECT count(*) FROM denorm_pending()"), 2);
        let oldest = Spi::get_one::<String>("SELECT object_id FROM denorm_pending(1)").unwrap();
        assert_eq!(oldest.as_deref(), Some("2"));
        let content_type = Spi::get_one::<String>("SELECT DISTINCT content_type FROM denorm_pending()").unwrap();
        assert_eq!(content_type.as_deref(), Some("public.e2e_author"));
    }

    #[pg_test]
    fn test_skipped_column_changes_enqueue_nothing() {
        create_blog();
        Spi::run("ALTER TABLE e2e_author ADD COLUMN post_count INT NOT NULL DEFAULT 0").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author', skip => ARRAY['post_count'])").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();

        let skip = Spi::get_one::<String>("SELECT array_to_string(skip, ',') FROM denorm_dependencies()").unwrap();
        assert_eq!(skip.as_deref(), Some("post_count"));

        Spi::run("INSERT INTO e2e_author (id, name) VALUES (1, 'Ada')").unwrap();
        Spi::run("INSERT INTO e2e_post (id, author_id, title) VALUES (10, 1, 'Notes')").unwrap();

        Spi::run("UPDATE e2e_author SET post_count = 1 WHERE id = 1").unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), 0);

        Spi::run("UPDATE e2e_author SET name = 'Ada L.', post_count = 2 WHERE id = 1").unwrap();
        assert_eq!(
            count("SELECT count(*) FROM denorm_dirty_instance WHERE content_type = 'public.e2e_post' AND object_id = '10'"),
            1
        );
    }

    #[pg_test]
    fn test_updates_on_columns_without_equality() {
        Spi::run("CREATE DOMAIN e2e_doc AS JSON").unwrap();
        Spi::run("CREATE TABLE e2e_route (id BIGSERIAL PRIMARY KEY, path JSONPATH, doc e2e_doc)").unwrap();
        Spi::run("CREATE TABLE e2e_stop (id BIGSERIAL PRIMARY KEY, route_id BIGINT REFERENCES e2e_route (id))").unwrap();
        Spi::run("SELECT denorm_depend_on_related('e2e_stop', 'e2e_route')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();

        Spi::run(r#"INSERT INTO e2e_route (id, path, doc) VALUES (1, '$.a', '{"a": 1}')"#).unwrap();
        Spi::run("INSERT INTO e2e_stop (id, route_id) VALUES (5, 1)").unwrap();

        Spi::run("UPDATE e2e_route SET path = '$.b' WHERE id = 1").unwrap();
        assert_eq!(
            count("SELECT count(*) FROM denorm_dirty_instance WHERE content_type = 'public.e2e_stop' AND object_id = '5'"),
            1
        );

        Spi::run("DELETE FROM denorm_dirty_instance").unwrap();
        Spi::run(r#"UPDATE e2e_route SET doc = '{"a": 2}' WHERE id = 1"#).unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), 1);

        Spi::run("DELETE FROM denorm_dirty_instance").unwrap();
        Spi::run("UPDATE e2e_route SET doc = doc WHERE id = 1").unwrap();
        assert_eq!(count("SELECT denorm_pending_count()"), 0);
    }

    #[pg_test]
    fn test_declared_before_tables_exist() {
        Spi::run("SELECT denorm_depend_on_related('late_post', 'late_author')").unwrap();
        assert_eq!(count("SELECT count(*) FROM denorm_dependency"), 1);

        Spi::run("CREATE TABLE late_author (id BIGSERIAL PRIMARY KEY, name TEXT)").unwrap();
        Spi::run("CREATE TABLE late_post (id BIGSERIAL PRIMARY KEY, author_id BIGINT REFERENCES late_author (id))")
            .unwrap();

        assert_eq!(count("SELECT count(*) FROM denorm_reconcile()"), 3);
        let table = Spi::get_one::<String>("SELECT DISTINCT table_name FROM denorm_installed_triggers()").unwrap();
        assert_eq!(table.as_deref(), Some("public.late_author"));
    }

    #[pg_test]
    fn test_forgotten_dependency_is_dropped() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();
        assert_eq!(count("SELECT count(*) FROM denorm_installed_triggers()"), 3);

        Spi::run("SELECT denorm_forget_dependency('e2e_post', 'e2e_author')").unwrap();
        assert_eq!(count("SELECT count(*) FROM denorm_reconcile()"), 0);
        assert_eq!(count("SELECT count(*) FROM denorm_installed_triggers()"), 0);
    }

    #[pg_test]
    fn test_drop_removes_everything() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_author')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_install()").unwrap();

        assert_eq!(count("SELECT count(*) FROM denorm_drop()"), 3);
        assert_eq!(count("SELECT count(*) FROM denorm_installed_triggers()"), 0);
        assert_eq!(count("SELECT count(*) FROM denorm_required_triggers()"), 3);
    }

    #[pg_test]
    #[should_panic(expected = "cannot auto-resolve")]
    fn test_unrelated_tables_fail_reconcile() {
        create_blog();
        Spi::run("SELECT denorm_depend_on_related('e2e_post', 'e2e_tag')").unwrap();
        Spi::run("SELECT count(*) FROM denorm_reconcile()").unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "does not exist")]
    fn test_error_propagates_to_postgres() {
        Err::<(), _>(DenormError::UnknownModel {
            name: "missing".to_string(),
        })
        .unwrap();
    }
}

/// This module is required by `cargo pgrx test` invocations.
/// It must be visible at the root of your extension crate.
#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {
        // perform one-off initialization when the pg_test framework starts
    }

    #[must_use]
    pub fn postgresql_conf_options() -> Vec<&'static str> {
        // return any postgresql.conf settings that are required for your tests
        vec![]
    }
}
