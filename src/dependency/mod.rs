//! Dependency Resolver
//!
//! A declaration says "rows of `owner` must be recomputed when rows of
//! `source` change". Resolution decides which side holds the foreign key:
//!
//! - **forward**: the owner holds the foreign key to the source. A changed
//!   source row maps to zero or more owners through a nested select.
//! - **backward**: the source holds the foreign key to the owner. A changed
//!   source row names its owner directly.
//!
//! Setup is two-phase. Declarations are registered first, possibly before
//! the tables they mention exist; [`DependencyRegistry::finalize`] resolves
//! all of them once a [`ModelRegistry`] covering every reference is loaded.

pub mod cache;
pub mod resolve;
pub mod triggers;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::config::SELF_REFERENCE;
use crate::error::DenormResult;
use crate::model::{ForeignKey, Model, ModelRegistry};

/// Which table a declaration depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceRef {
    /// The owner depends on other rows of its own table
    SelfRef,
    Table(String),
}

impl SourceRef {
    pub fn parse(reference: &str) -> Self {
        if reference == SELF_REFERENCE {
            SourceRef::SelfRef
        } else {
            SourceRef::Table(reference.to_string())
        }
    }

    /// The table reference this source stands for, given its owner
    pub fn resolve<'a>(&'a self, owner: &'a str) -> &'a str {
        match self {
            SourceRef::SelfRef => owner,
            SourceRef::Table(table) => table,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::SelfRef => write!(f, "{}", SELF_REFERENCE),
            SourceRef::Table(table) => write!(f, "{}", table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub owner: String,
    pub source: SourceRef,
    /// Explicit foreign key, as a column (`author_id`) or field (`author`)
    pub foreign_key: Option<String>,
    /// Source columns whose changes never make the owner dirty, typically
    /// the denormalized columns themselves. Sorted, without duplicates.
    #[serde(default)]
    pub skip: Vec<String>,
}

impl DependencyDeclaration {
    pub fn new(owner: &str, source: &str, foreign_key: Option<&str>) -> Self {
        Self {
            owner: owner.to_string(),
            source: SourceRef::parse(source),
            foreign_key: foreign_key.map(str::to_string),
            skip: Vec::new(),
        }
    }

    pub fn with_skip<S: AsRef<str>>(mut self, skip: impl IntoIterator<Item = S>) -> Self {
        let columns: BTreeSet<String> = skip.into_iter().map(|c| c.as_ref().to_string()).collect();
        self.skip = columns.into_iter().collect();
        self
    }

    pub fn source_reference(&self) -> &str {
        self.source.resolve(&self.owner)
    }
}

impl fmt::Display for DependencyDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.owner, self.source)?;
        if let Some(fk) = &self.foreign_key {
            write!(f, " via {}", fk)?;
        }
        if !self.skip.is_empty() {
            write!(f, " skipping {}", self.skip.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Owner holds the foreign key
    Forward,
    /// Source holds the foreign key
    Backward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Every kind of dependency the engine understands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    /// Related through a single-column foreign key, in either direction
    Related(DependencyDeclaration),
}

impl Dependency {
    pub fn related(owner: &str, source: &str, foreign_key: Option<&str>) -> Self {
        Dependency::Related(DependencyDeclaration::new(owner, source, foreign_key))
    }

    pub fn declaration(&self) -> &DependencyDeclaration {
        match self {
            Dependency::Related(declaration) => declaration,
        }
    }

    pub fn resolve(&self, models: &ModelRegistry) -> DenormResult<ResolvedDependency> {
        match self {
            Dependency::Related(declaration) => resolve::resolve_related(declaration, models),
        }
    }
}

/// A declaration with its direction decided. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub declaration: DependencyDeclaration,
    pub owner: Model,
    pub source: Model,
    pub direction: Direction,
    pub foreign_key: ForeignKey,
}

impl ResolvedDependency {
    /// Table holding the foreign key column
    pub fn holder(&self) -> &Model {
        match self.direction {
            Direction::Forward => &self.owner,
            Direction::Backward => &self.source,
        }
    }
}

/// Registration phase of the setup; see the module docs
#[derive(Debug, Clone, Default)]
pub struct DependencyRegistry {
    dependencies: Vec<Dependency>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the same dependency was already registered
    pub fn register(&mut self, dependency: Dependency) -> bool {
        if self.dependencies.contains(&dependency) {
            return false;
        }
        self.dependencies.push(dependency);
        true
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter()
    }

    /// Every table reference the registered declarations mention. The
    /// model registry passed to `finalize` must cover all of them.
    pub fn references(&self) -> BTreeSet<String> {
        let mut references = BTreeSet::new();
        for dependency in &self.dependencies {
            let declaration = dependency.declaration();
            references.insert(declaration.owner.clone());
            references.insert(declaration.source_reference().to_string());
        }
        references
    }

    /// Resolve every declaration, in registration order. The first
    /// configuration error aborts.
    pub fn finalize(&self, models: &ModelRegistry) -> DenormResult<Vec<ResolvedDependency>> {
        self.dependencies.iter().map(|d| d.resolve(models)).collect()
    }
}
