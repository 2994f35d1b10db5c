use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use pgrx::prelude::*;

use super::{Dependency, DependencyRegistry, ResolvedDependency};
use crate::error::DenormResult;
use crate::model::ModelRegistry;

/// Resolutions already computed in this backend, keyed by declaration
static RESOLVED_CACHE: LazyLock<Mutex<HashMap<Dependency, ResolvedDependency>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Resolve one dependency, reusing an earlier resolution when the
/// `pg_denorm.resolution_cache` GUC is on
pub fn resolve_cached(dependency: &Dependency, models: &ModelRegistry) -> DenormResult<ResolvedDependency> {
    if !crate::config::resolution_cache_enabled() {
        return dependency.resolve(models);
    }

    if let Some(resolved) = lookup(dependency).filter(|r| is_current(r, models)) {
        return Ok(resolved);
    }

    let resolved = dependency.resolve(models)?;
    debug1!(
        "pg_denorm: resolved {} as {} via {}.{}",
        dependency.declaration(),
        resolved.direction.as_str(),
        resolved.holder().name,
        resolved.foreign_key.column
    );

    RESOLVED_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(dependency.clone(), resolved.clone());
    Ok(resolved)
}

/// `DependencyRegistry::finalize` through the cache
pub fn finalize_cached(registry: &DependencyRegistry, models: &ModelRegistry) -> DenormResult<Vec<ResolvedDependency>> {
    registry.iter().map(|d| resolve_cached(d, models)).collect()
}

/// A cached resolution is reused only while both tables look the same
fn is_current(resolved: &ResolvedDependency, models: &ModelRegistry) -> bool {
    models.get(&resolved.owner.name) == Some(&resolved.owner)
        && models.get(&resolved.source.name) == Some(&resolved.source)
}

fn lookup(dependency: &Dependency) -> Option<ResolvedDependency> {
    RESOLVED_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(dependency)
        .cloned()
}

/// Forget every cached resolution.
/// Called whenever declarations are registered or removed.
pub fn invalidate() {
    RESOLVED_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::sql::QualifiedName;

    #[test]
    fn test_invalidate_clears_cache() {
        let author = QualifiedName::new("public", "author");
        let models = ModelRegistry::new()
            .with(Model::new("public", "author").primary_key("id"))
            .with(Model::new("public", "post").primary_key("id").foreign_key("author_id", &author, "id"));
        let dependency = Dependency::related("post", "author", None);
        let resolved = dependency.resolve(&models).unwrap();

        RESOLVED_CACHE.lock().unwrap().insert(dependency.clone(), resolved.clone());
        assert_eq!(lookup(&dependency), Some(resolved));

        invalidate();
        assert_eq!(lookup(&dependency), None);
    }

    #[test]
    fn test_changed_table_is_not_current() {
        let author = QualifiedName::new("public", "author");
        let post = Model::new("public", "post").primary_key("id").foreign_key("author_id", &author, "id");
        let models = ModelRegistry::new()
            .with(Model::new("public", "author").primary_key("id"))
            .with(post.clone());
        let resolved = Dependency::related("post", "author", None).resolve(&models).unwrap();
        assert!(is_current(&resolved, &models));

        let altered = ModelRegistry::new()
            .with(Model::new("public", "author").primary_key("id").column("bio", "text"))
            .with(post);
        assert!(!is_current(&resolved, &altered));
    }
}
