use super::{DependencyDeclaration, Direction, ResolvedDependency};
use crate::error::{DenormError, DenormResult};
use crate::model::{ForeignKey, Model, ModelRegistry};

/// Decide the direction of a foreign-key dependency.
///
/// ALGORITHM:
/// 1. `self` sources stand for the owner's own table
/// 2. Owner has a matching foreign key to the source → forward
/// 3. Source has a matching foreign key to the owner → backward
/// 4. Neither → `UnresolvableDependency`
///
/// A search matching several foreign keys is `AmbiguousDependency`, never
/// first-match. For self relations both searches look at the same table, so
/// a self-referential key always resolves forward.
///
/// # Errors
/// Configuration errors only; nothing here touches the database.
pub fn resolve_related(
    declaration: &DependencyDeclaration,
    models: &ModelRegistry,
) -> DenormResult<ResolvedDependency> {
    let owner = models.lookup(&declaration.owner)?;
    let source = models.lookup(declaration.source_reference())?;
    let explicit = declaration.foreign_key.as_deref();

    let (direction, foreign_key) = if let Some(fk) = find_foreign_key(owner, source, explicit)? {
        (Direction::Forward, fk)
    } else if let Some(fk) = find_foreign_key(source, owner, explicit)? {
        (Direction::Backward, fk)
    } else {
        return Err(DenormError::UnresolvableDependency {
            owner: owner.name.to_string(),
            source: source.name.to_string(),
        });
    };

    if direction == Direction::Forward {
        owner.require_primary_key()?;
    }
    check_skip(declaration, source)?;

    Ok(ResolvedDependency {
        declaration: declaration.clone(),
        owner: owner.clone(),
        source: source.clone(),
        direction,
        foreign_key: foreign_key.clone(),
    })
}

/// Skipped columns must belong to the source, and at least one source
/// column has to stay watched
fn check_skip(declaration: &DependencyDeclaration, source: &Model) -> DenormResult<()> {
    if declaration.skip.is_empty() {
        return Ok(());
    }
    let invalid = |reason: String| DenormError::InvalidInput {
        parameter: "skip".to_string(),
        value: declaration.skip.join(", "),
        reason,
    };

    let is_source_column = |name: &&String| source.columns.iter().any(|column| &column.name == *name);
    if let Some(unknown) = declaration.skip.iter().find(|name| !is_source_column(name)) {
        return Err(invalid(format!("{} has no column {}", source.name, unknown)));
    }
    if source.columns.iter().all(|column| declaration.skip.contains(&column.name)) {
        return Err(invalid(format!("every column of {} would be skipped", source.name)));
    }
    Ok(())
}

/// Foreign key of `from` pointing at `to`, optionally restricted to an
/// explicit field
fn find_foreign_key<'a>(
    from: &'a Model,
    to: &'a Model,
    explicit: Option<&str>,
) -> DenormResult<Option<&'a ForeignKey>> {
    let candidates: Vec<&ForeignKey> = from
        .foreign_keys_to(&to.name)
        .filter(|fk| explicit.map_or(true, |field| fk.matches_field(field)))
        .collect();

    match candidates.as_slice() {
        [] => Ok(None),
        [fk] => Ok(Some(fk)),
        _ => Err(DenormError::AmbiguousDependency {
            owner: from.name.to_string(),
            source: to.name.to_string(),
            candidates: candidates.iter().map(|fk| fk.column.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Dependency;
    use crate::error::testing::{assert_configuration_error, assert_error_contains, assert_error_sqlstate};
    use crate::model::RelationKind;
    use crate::sql::QualifiedName;

    fn name(table: &str) -> QualifiedName {
        QualifiedName::new("public", table)
    }

    fn models() -> ModelRegistry {
        ModelRegistry::new()
            .with(Model::new("public", "b").primary_key("id").column("title", "text"))
            .with(Model::new("public", "a").primary_key("id").foreign_key("b_id", &name("b"), "id"))
            .with(Model::new("public", "c").primary_key("id"))
            .with(
                Model::new("public", "category")
                    .primary_key("id")
                    .foreign_key("parent_id", &name("category"), "id"),
            )
            .with(
                Model::new("public", "post")
                    .primary_key("id")
                    .foreign_key("author_id", &name("person"), "id")
                    .foreign_key("editor_id", &name("person"), "id"),
            )
            .with(Model::new("public", "person").primary_key("id"))
    }

    #[test]
    fn test_owner_holding_fk_is_forward() {
        let resolved = Dependency::related("a", "b", None).resolve(&models()).unwrap();
        assert_eq!(resolved.direction, Direction::Forward);
        assert_eq!(resolved.foreign_key.column, "b_id");
        assert_eq!(resolved.holder().table(), "a");
    }

    #[test]
    fn test_source_holding_fk_is_backward() {
        let resolved = Dependency::related("b", "a", None).resolve(&models()).unwrap();
        assert_eq!(resolved.direction, Direction::Backward);
        assert_eq!(resolved.foreign_key.column, "b_id");
        assert_eq!(resolved.owner.table(), "b");
        assert_eq!(resolved.source.table(), "a");
    }

    #[test]
    fn test_self_relation_substitutes_owner() {
        let resolved = Dependency::related("category", "self", None).resolve(&models()).unwrap();
        assert_eq!(resolved.source.name, name("category"));
        assert_eq!(resolved.direction, Direction::Forward);
        assert_eq!(resolved.foreign_key.column, "parent_id");
    }

    #[test]
    fn test_unrelated_tables_are_unresolvable() {
        let result = Dependency::related("a", "c", None).resolve(&models());
        assert_error_sqlstate(result.clone(), "55000");
        assert_configuration_error(result.clone());
        assert_error_contains(result, "public.c");
    }

    #[test]
    fn test_multiple_candidates_are_ambiguous() {
        let result = Dependency::related("post", "person", None).resolve(&models());
        assert_error_sqlstate(result.clone(), "42702");
        assert_error_contains(result, "author_id, editor_id");
    }

    #[test]
    fn test_explicit_field_disambiguates() {
        let by_field = Dependency::related("post", "person", Some("editor")).resolve(&models()).unwrap();
        assert_eq!(by_field.foreign_key.column, "editor_id");

        let by_column = Dependency::related("post", "person", Some("author_id")).resolve(&models()).unwrap();
        assert_eq!(by_column.foreign_key.column, "author_id");

        assert_error_sqlstate(
            Dependency::related("post", "person", Some("reviewer")).resolve(&models()),
            "55000",
        );
    }

    #[test]
    fn test_forward_owner_needs_primary_key() {
        let registry = ModelRegistry::new()
            .with(Model::new("public", "b").primary_key("id"))
            .with(Model::new("public", "log").foreign_key("b_id", &name("b"), "id"));

        assert_error_sqlstate(Dependency::related("log", "b", None).resolve(&registry), "42P10");
    }

    #[test]
    fn test_unknown_table_is_reported() {
        assert_error_sqlstate(Dependency::related("a", "missing", None).resolve(&models()), "42P01");
    }

    #[test]
    fn test_skip_names_source_columns() {
        let skipping = |skip: &[&str]| {
            Dependency::Related(DependencyDeclaration::new("a", "b", None).with_skip(skip.iter().copied()))
                .resolve(&models())
        };

        assert_eq!(skipping(&["title"]).unwrap().declaration.skip, vec!["title"]);

        let unknown = skipping(&["b_id"]);
        assert_error_sqlstate(unknown.clone(), "22023");
        assert_error_contains(unknown, "public.b has no column b_id");

        assert_error_contains(skipping(&["id", "title"]), "every column of public.b");
    }

    #[test]
    fn test_view_source_resolves_but_kind_is_kept() {
        let registry = models().with(
            Model::new("public", "b_summary")
                .kind(RelationKind::View)
                .foreign_key("b_id", &name("b"), "id"),
        );
        let resolved = Dependency::related("b", "b_summary", None).resolve(&registry).unwrap();
        assert_eq!(resolved.source.kind, RelationKind::View);
    }
}
