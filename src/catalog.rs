//! Persisted dependency declarations (`denorm_dependency`)
//!
//! The registration phase of the resolver, made durable: declarations
//! survive across sessions and are loaded into a [`DependencyRegistry`]
//! whenever triggers are reconciled.

use pgrx::prelude::*;

use crate::config::{DEPENDENCY_TABLE, EXTENSION_SCHEMA};
use crate::dependency::{cache, Dependency, DependencyDeclaration, DependencyRegistry};
use crate::error::{DenormError, DenormResult};
use crate::utils::{text_arg, text_array_arg};
use crate::validation::{validate_column_name, validate_source_reference, validate_table_reference};

fn table() -> String {
    format!("{}.{}", EXTENSION_SCHEMA, DEPENDENCY_TABLE)
}

fn validate(declaration: &DependencyDeclaration) -> DenormResult<()> {
    validate_table_reference(&declaration.owner, "owner")?;
    validate_source_reference(&declaration.source.to_string(), "source")?;
    if let Some(fk) = &declaration.foreign_key {
        validate_column_name(fk, "foreign_key")?;
    }
    for column in &declaration.skip {
        validate_column_name(column, "skip")?;
    }
    Ok(())
}

fn is_registered(declaration: &DependencyDeclaration) -> DenormResult<bool> {
    let query = format!(
        "SELECT EXISTS (
            SELECT 1 FROM {}
            WHERE owner_table = $1 AND source_table = $2
              AND COALESCE(foreign_key, '') = COALESCE($3, '')
        )",
        table()
    );
    let source = declaration.source.to_string();

    Spi::get_one_with_args::<bool>(
        &query,
        vec![
            text_arg(Some(&declaration.owner)),
            text_arg(Some(&source)),
            text_arg(declaration.foreign_key.as_deref()),
        ],
    )
    .map(|exists| exists.unwrap_or(false))
    .map_err(|e| DenormError::CatalogError {
        operation: format!("Look up dependency {}", declaration),
        pg_error: e.to_string(),
    })
}

/// Store a declaration. Returns false when it was already registered
/// with the same skip list; a different skip list replaces the stored one.
///
/// Only the reference syntax is checked here; the tables may not exist
/// yet and are resolved at reconciliation time.
pub fn register(declaration: &DependencyDeclaration) -> DenormResult<bool> {
    validate(declaration)?;

    if is_registered(declaration)? {
        if !replace_skip(declaration)? {
            return Ok(false);
        }
        cache::invalidate();
        info!("pg_denorm: updated dependency {}", declaration);
        return Ok(true);
    }

    let source = declaration.source.to_string();
    Spi::run_with_args(
        &format!(
            "INSERT INTO {} (owner_table, source_table, foreign_key, skip) VALUES ($1, $2, $3, $4)",
            table()
        ),
        Some(vec![
            text_arg(Some(&declaration.owner)),
            text_arg(Some(&source)),
            text_arg(declaration.foreign_key.as_deref()),
            text_array_arg(&declaration.skip),
        ]),
    )
    .map_err(|e| DenormError::CatalogError {
        operation: format!("Register dependency {}", declaration),
        pg_error: e.to_string(),
    })?;

    cache::invalidate();
    info!("pg_denorm: registered dependency {}", declaration);
    Ok(true)
}

/// Overwrite the stored skip list; false when it already matched
fn replace_skip(declaration: &DependencyDeclaration) -> DenormResult<bool> {
    let query = format!(
        "UPDATE {}
         SET skip = $4
         WHERE owner_table = $1 AND source_table = $2
           AND COALESCE(foreign_key, '') = COALESCE($3, '')
           AND skip IS DISTINCT FROM $4
         RETURNING id",
        table()
    );
    let source = declaration.source.to_string();

    Spi::connect(|mut client| {
        let updated = client.update(
            &query,
            None,
            Some(vec![
                text_arg(Some(&declaration.owner)),
                text_arg(Some(&source)),
                text_arg(declaration.foreign_key.as_deref()),
                text_array_arg(&declaration.skip),
            ]),
        )?;
        Ok(!updated.is_empty())
    })
    .map_err(|e: pgrx::spi::Error| DenormError::CatalogError {
        operation: format!("Update dependency {}", declaration),
        pg_error: e.to_string(),
    })
}

/// Remove a declaration. Returns false when it was not registered.
pub fn forget(declaration: &DependencyDeclaration) -> DenormResult<bool> {
    validate(declaration)?;

    if !is_registered(declaration)? {
        return Ok(false);
    }

    let source = declaration.source.to_string();
    Spi::run_with_args(
        &format!(
            "DELETE FROM {}
             WHERE owner_table = $1 AND source_table = $2
               AND COALESCE(foreign_key, '') = COALESCE($3, '')",
            table()
        ),
        Some(vec![
            text_arg(Some(&declaration.owner)),
            text_arg(Some(&source)),
            text_arg(declaration.foreign_key.as_deref()),
        ]),
    )
    .map_err(|e| DenormError::CatalogError {
        operation: format!("Forget dependency {}", declaration),
        pg_error: e.to_string(),
    })?;

    cache::invalidate();
    info!("pg_denorm: removed dependency {}", declaration);
    Ok(true)
}

/// Every stored declaration, in registration order
pub fn load_registry() -> DenormResult<DependencyRegistry> {
    let query = format!(
        "SELECT owner_table, source_table, foreign_key, skip FROM {} ORDER BY id",
        table()
    );

    let declarations = Spi::connect(|client| {
        let rows = client.select(&query, None, None)?;
        let mut declarations = Vec::new();

        for row in rows {
            let owner: String = row["owner_table"].value()?.unwrap_or_default();
            let source: String = row["source_table"].value()?.unwrap_or_default();
            let foreign_key: Option<String> = row["foreign_key"].value()?;
            let skip: Vec<String> = row["skip"].value()?.unwrap_or_default();
            declarations.push(DependencyDeclaration::new(&owner, &source, foreign_key.as_deref()).with_skip(skip));
        }

        Ok(declarations)
    })
    .map_err(|e: pgrx::spi::Error| DenormError::CatalogError {
        operation: "Load dependencies".to_string(),
        pg_error: e.to_string(),
    })?;

    let mut registry = DependencyRegistry::new();
    for declaration in declarations {
        registry.register(Dependency::Related(declaration));
    }
    Ok(registry)
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::dependency::SourceRef;
    use crate::error::testing::assert_error_sqlstate;

    #[pg_test]
    fn test_register_and_load() {
        let first = DependencyDeclaration::new("post", "author", None);
        let second = DependencyDeclaration::new("category", "self", Some("parent"));

        assert_eq!(register(&first), Ok(true));
        assert_eq!(register(&first), Ok(false));
        assert_eq!(register(&second), Ok(true));

        let registry = load_registry().unwrap();
        let loaded: Vec<_> = registry.iter().map(|d| d.declaration().clone()).collect();
        assert_eq!(loaded, vec![first, second.clone()]);
        assert_eq!(loaded[1].source, SourceRef::SelfRef);
        assert_eq!(loaded[1].foreign_key.as_deref(), Some("parent"));
    }

    #[pg_test]
    fn test_register_replaces_skip_list() {
        let plain = DependencyDeclaration::new("post", "author", None);
        let skipping = plain.clone().with_skip(["post_count"]);

        assert_eq!(register(&plain), Ok(true));
        assert_eq!(register(&skipping), Ok(true));
        assert_eq!(register(&skipping), Ok(false));

        let registry = load_registry().unwrap();
        let loaded: Vec<_> = registry.iter().map(|d| d.declaration().clone()).collect();
        assert_eq!(loaded, vec![skipping.clone()]);

        assert_eq!(forget(&plain), Ok(true));
        assert!(load_registry().unwrap().is_empty());
    }

    #[pg_test]
    fn test_forget() {
        let declaration = DependencyDeclaration::new("post", "author", Some("author_id"));
        register(&declaration).unwrap();

        assert_eq!(forget(&DependencyDeclaration::new("post", "author", None)), Ok(false));
        assert_eq!(forget(&declaration), Ok(true));
        assert!(load_registry().unwrap().is_empty());
    }

    #[pg_test]
    fn test_register_rejects_bad_references() {
        assert_error_sqlstate(register(&DependencyDeclaration::new("post; DROP TABLE x", "author", None)), "22023");
        assert_error_sqlstate(register(&DependencyDeclaration::new("post", "author", Some("a-b"))), "22023");
        assert_error_sqlstate(
            register(&DependencyDeclaration::new("post", "author", None).with_skip(["name; --"])),
            "22023",
        );
    }
}
