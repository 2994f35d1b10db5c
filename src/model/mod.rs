//! Model Registry: read-only entity metadata
//!
//! A model is one relation: its schema-qualified name, relation kind,
//! columns with their SQL types, single-column primary key and
//! single-column foreign keys. The dependency resolver only ever reads
//! from here.
//!
//! Registries are built two ways:
//! - in memory, through the [`Model`] builder (unit tests, callers that
//!   already know their schema)
//! - from the PostgreSQL catalog, through [`loader::load_models`]

pub mod loader;

pub use loader::load_models;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DenormError, DenormResult};
use crate::sql::QualifiedName;

/// A column participating in a trigger body
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: String,
    /// No default btree equality for the (base) type; `IS DISTINCT FROM`
    /// has to go through the text representation
    pub compare_as_text: bool,
}

impl Column {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            compare_as_text: false,
        }
    }

    /// A column whose type cannot be compared directly (`json`, `jsonpath`,
    /// domains and composites over them, ...)
    pub fn text_compared(name: &str, sql_type: &str) -> Self {
        Self {
            compare_as_text: true,
            ..Self::new(name, sql_type)
        }
    }

    pub fn compares_as_text(&self) -> bool {
        self.compare_as_text
    }
}

/// `pg_class.relkind`, reduced to what the trigger engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    Table,
    PartitionedTable,
    ForeignTable,
    View,
    MaterializedView,
    Other(char),
}

impl RelationKind {
    pub fn from_relkind(relkind: char) -> Self {
        match relkind {
            'r' => RelationKind::Table,
            'p' => RelationKind::PartitionedTable,
            'f' => RelationKind::ForeignTable,
            'v' => RelationKind::View,
            'm' => RelationKind::MaterializedView,
            other => RelationKind::Other(other),
        }
    }

    /// AFTER ... FOR EACH ROW triggers are only accepted on these
    pub fn supports_row_triggers(self) -> bool {
        matches!(
            self,
            RelationKind::Table | RelationKind::PartitionedTable | RelationKind::ForeignTable
        )
    }

    pub fn describe(self) -> String {
        match self {
            RelationKind::Table => "table".to_string(),
            RelationKind::PartitionedTable => "partitioned table".to_string(),
            RelationKind::ForeignTable => "foreign table".to_string(),
            RelationKind::View => "view".to_string(),
            RelationKind::MaterializedView => "materialized view".to_string(),
            RelationKind::Other(c) => format!("relkind '{}'", c),
        }
    }
}

/// `column REFERENCES target (target_column)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub target: QualifiedName,
    pub target_column: String,
}

impl ForeignKey {
    /// Matches an explicit field reference, given either as the column
    /// (`author_id`) or as the field it backs (`author`)
    pub fn matches_field(&self, field: &str) -> bool {
        self.column == field || self.column == format!("{}_id", field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: QualifiedName,
    pub kind: RelationKind,
    pub columns: Vec<Column>,
    pub primary_key: Option<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl Model {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            name: QualifiedName::new(schema, table),
            kind: RelationKind::Table,
            columns: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    pub fn kind(mut self, kind: RelationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn column(mut self, name: &str, sql_type: &str) -> Self {
        self.columns.push(Column::new(name, sql_type));
        self
    }

    /// A column without a usable equality operator
    pub fn text_column(mut self, name: &str, sql_type: &str) -> Self {
        self.columns.push(Column::text_compared(name, sql_type));
        self
    }

    /// Declare a `bigint` primary key column
    pub fn primary_key(mut self, name: &str) -> Self {
        if !self.columns.iter().any(|c| c.name == name) {
            self.columns.push(Column::new(name, "bigint"));
        }
        self.primary_key = Some(name.to_string());
        self
    }

    /// Declare a `bigint` foreign key column referencing `target.target_column`
    pub fn foreign_key(mut self, column: &str, target: &QualifiedName, target_column: &str) -> Self {
        if !self.columns.iter().any(|c| c.name == column) {
            self.columns.push(Column::new(column, "bigint"));
        }
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            target: target.clone(),
            target_column: target_column.to_string(),
        });
        self
    }

    /// Identifier written to the dirty queue's `content_type` column
    pub fn content_type(&self) -> String {
        self.name.to_string()
    }

    pub fn table(&self) -> &str {
        &self.name.name
    }

    pub fn schema(&self) -> &str {
        self.name.schema.as_deref().unwrap_or(crate::config::EXTENSION_SCHEMA)
    }

    /// Foreign keys of this model pointing at `target`
    pub fn foreign_keys_to<'a>(&'a self, target: &'a QualifiedName) -> impl Iterator<Item = &'a ForeignKey> + 'a {
        self.foreign_keys.iter().filter(move |fk| &fk.target == target)
    }

    pub fn require_primary_key(&self) -> DenormResult<&str> {
        self.primary_key
            .as_deref()
            .ok_or_else(|| DenormError::MissingPrimaryKey {
                table: self.name.to_string(),
            })
    }
}

/// All models a reconciliation run needs, keyed by qualified name.
///
/// References written by users (`post`, `blog.post`) are kept as aliases
/// so lookups agree with how the catalog resolved them.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<QualifiedName, Model>,
    aliases: BTreeMap<String, QualifiedName>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: Model) {
        self.models.insert(model.name.clone(), model);
    }

    pub fn with(mut self, model: Model) -> Self {
        self.insert(model);
        self
    }

    /// Remember that `reference` resolved to `name`
    pub fn alias(&mut self, reference: &str, name: QualifiedName) {
        self.aliases.insert(reference.to_string(), name);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, name: &QualifiedName) -> Option<&Model> {
        self.models.get(name)
    }

    /// Resolve a user-written table reference
    pub fn lookup(&self, reference: &str) -> DenormResult<&Model> {
        if let Some(model) = self.aliases.get(reference).and_then(|name| self.models.get(name)) {
            return Ok(model);
        }

        let parsed = QualifiedName::parse(reference);
        if parsed.schema.is_some() {
            return self.models.get(&parsed).ok_or_else(|| DenormError::UnknownModel {
                name: reference.to_string(),
            });
        }

        let mut matches = self.models.values().filter(|m| m.name.name == parsed.name);
        match (matches.next(), matches.next()) {
            (Some(model), None) => Ok(model),
            (Some(first), Some(second)) => Err(DenormError::InvalidInput {
                parameter: "table reference".to_string(),
                value: reference.to_string(),
                reason: format!("matches both {} and {}; qualify it with a schema", first.name, second.name),
            }),
            (None, _) => Err(DenormError::UnknownModel {
                name: reference.to_string(),
            }),
        }
    }
}
