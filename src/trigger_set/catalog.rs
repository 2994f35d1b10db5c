use pgrx::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::TRIGGER_PREFIX;
use crate::error::{DenormError, DenormResult};
use crate::sql::QualifiedName;
use crate::trigger::TriggerIdentity;

/// A trigger of the `denorm_` family as found in `pg_trigger`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledTrigger {
    pub name: String,
    pub table: QualifiedName,
    /// `prosrc` of the trigger function
    pub body: String,
}

impl InstalledTrigger {
    /// Generated by this extension: the name parses back to an identity
    /// naming the table the trigger sits on
    pub fn is_generated(&self) -> DenormResult<bool> {
        Ok(TriggerIdentity::parse(&self.name)?.is_some_and(|identity| identity.table == self.table.name))
    }
}

/// Read every installed trigger bearing the naming convention.
///
/// Internal triggers (foreign key enforcement) are skipped, and so are
/// user triggers that merely share the `denorm_` prefix. Pure read.
pub fn installed_triggers() -> DenormResult<Vec<InstalledTrigger>> {
    let query = format!(
        "SELECT t.tgname::text AS name,
                n.nspname::text AS schema_name,
                c.relname::text AS table_name,
                p.prosrc AS body
         FROM pg_trigger t
         JOIN pg_class c ON c.oid = t.tgrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         JOIN pg_proc p ON p.oid = t.tgfoid
         WHERE NOT t.tgisinternal
           AND t.tgname LIKE '{}\\_%'
         ORDER BY t.tgname, n.nspname, c.relname",
        TRIGGER_PREFIX
    );

    let candidates = Spi::connect(|client| {
        let rows = client.select(&query, None, None)?;
        let mut triggers = Vec::new();

        for row in rows {
            let name: String = row["name"].value()?.unwrap_or_default();
            let schema: String = row["schema_name"].value()?.unwrap_or_default();
            let table: String = row["table_name"].value()?.unwrap_or_default();
            let body: String = row["body"].value()?.unwrap_or_default();

            triggers.push(InstalledTrigger {
                name,
                table: QualifiedName::new(&schema, &table),
                body,
            });
        }

        Ok(triggers)
    })
    .map_err(|e: pgrx::spi::Error| DenormError::CatalogError {
        operation: "List installed triggers".to_string(),
        pg_error: e.to_string(),
    })?;

    let mut generated = Vec::with_capacity(candidates.len());
    for trigger in candidates {
        if trigger.is_generated()? {
            generated.push(trigger);
        }
    }
    Ok(generated)
}


#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod pg_tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_only_denorm_family_is_listed() {
        Spi::run("CREATE TABLE it_item (id INT PRIMARY KEY, parent_id INT REFERENCES it_item (id))").unwrap();
        Spi::run(
            "CREATE FUNCTION it_noop() RETURNS TRIGGER AS $$ BEGIN RETURN NULL; END; $$ LANGUAGE plpgsql",
        )
        .unwrap();
        Spi::run("CREATE TRIGGER audit_it_item AFTER INSERT ON it_item FOR EACH ROW EXECUTE PROCEDURE it_noop()")
            .unwrap();
        Spi::run(
            "CREATE TRIGGER denorm_after_row_insert_on_it_item AFTER INSERT ON it_item \
             FOR EACH ROW EXECUTE PROCEDURE it_noop()",
        )
        .unwrap();

        Spi::run("CREATE TRIGGER denorm_audit_it_item AFTER INSERT ON it_item FOR EACH ROW EXECUTE PROCEDURE it_noop()")
            .unwrap();
        Spi::run(
            "CREATE TRIGGER denorm_after_row_update_on_it_other AFTER UPDATE ON it_item \
             FOR EACH ROW EXECUTE PROCEDURE it_noop()",
        )
        .unwrap();

        let installed = installed_triggers().unwrap();
        let ours: Vec<_> = installed.iter().filter(|t| t.table.name == "it_item").collect();

        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].name, "denorm_after_row_insert_on_it_item");
        assert_eq!(ours[0].table, QualifiedName::new("public", "it_item"));
        assert_eq!(ours[0].body, " BEGIN RETURN NULL; END; ");
    }
}
