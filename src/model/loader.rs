use pgrx::prelude::*;

use super::{Column, ForeignKey, Model, ModelRegistry, RelationKind};
use crate::error::{DenormError, DenormResult};
use crate::sql::{quote_literal, QualifiedName};

/// Build a registry from the catalog for every table reference given.
///
/// References are resolved with `to_regclass`, i.e. through the caller's
/// `search_path`. A reference that does not resolve is a configuration
/// error: every table a declaration names must exist by the time triggers
/// are synthesized.
pub fn load_models<'a>(references: impl IntoIterator<Item = &'a str>) -> DenormResult<ModelRegistry> {
    let mut registry = ModelRegistry::new();

    for reference in references {
        crate::validation::validate_table_reference(reference, "table")?;

        let model = load_model(reference)?.ok_or_else(|| DenormError::UnknownModel {
            name: reference.to_string(),
        })?;

        registry.alias(reference, model.name.clone());
        registry.insert(model);
    }

    Ok(registry)
}

/// Load one relation, or `None` when the reference does not resolve
pub fn load_model(reference: &str) -> DenormResult<Option<Model>> {
    let regclass = format!("to_regclass({})", quote_literal(reference));

    let Some((schema, table, relkind)) = load_relation(&regclass)? else {
        return Ok(None);
    };

    let mut model = Model::new(&schema, &table).kind(RelationKind::from_relkind(relkind));
    model.columns = load_columns(&regclass)?;
    model.primary_key = load_primary_key(&regclass)?;
    model.foreign_keys = load_foreign_keys(&regclass)?;

    Ok(Some(model))
}

fn load_relation(regclass: &str) -> DenormResult<Option<(String, String, char)>> {
    let query = format!(
        "SELECT n.nspname::text AS schema_name, c.relname::text AS table_name, c.relkind::text AS relkind
         FROM pg_class c
         JOIN pg_namespace n ON n.oid = c.relnamespace
         WHERE c.oid = {regclass}"
    );

    Spi::connect(|client| {
        let mut rows = client.select(&query, None, None)?;

        if let Some(row) = rows.next() {
            let schema: String = row["schema_name"].value()?.unwrap_or_default();
            let table: String = row["table_name"].value()?.unwrap_or_default();
            let relkind: String = row["relkind"].value()?.unwrap_or_default();
            Ok(Some((schema, table, relkind.chars().next().unwrap_or('r'))))
        } else {
            Ok(None)
        }
    })
    .map_err(|e: pgrx::spi::Error| DenormError::SpiError {
        query: query.clone(),
        error: e.to_string(),
    })
}

/// Columns in attribute order. Domains are followed down to their base
/// type; a base type without a default btree operator class has no `=` to
/// compare with, so the column is compared as text.
fn load_columns(regclass: &str) -> DenormResult<Vec<Column>> {
    let query = format!(
        "WITH RECURSIVE col AS (
            SELECT a.attnum,
                   a.attname::text AS name,
                   format_type(a.atttypid, a.atttypmod) AS sql_type,
                   a.atttypid AS typid
            FROM pg_attribute a
            WHERE a.attrelid = {regclass}
              AND a.attnum > 0
              AND NOT a.attisdropped
            UNION ALL
            SELECT col.attnum, col.name, col.sql_type, t.typbasetype
            FROM col
            JOIN pg_type t ON t.oid = col.typid
            WHERE t.typtype = 'd'
         )
         SELECT col.name,
                col.sql_type,
                NOT EXISTS (
                    SELECT 1
                    FROM pg_opclass oc
                    JOIN pg_am am ON am.oid = oc.opcmethod
                    WHERE am.amname = 'btree'
                      AND oc.opcdefault
                      AND oc.opcintype = col.typid
                ) AS compare_as_text
         FROM col
         JOIN pg_type t ON t.oid = col.typid
         WHERE t.typtype <> 'd'
         ORDER BY col.attnum"
    );

    Spi::connect(|client| {
        let rows = client.select(&query, None, None)?;
        let mut columns = Vec::new();

        for row in rows {
            let name: String = row["name"].value()?.unwrap_or_default();
            let sql_type: String = row["sql_type"].value()?.unwrap_or_default();
            let compare_as_text: bool = row["compare_as_text"].value()?.unwrap_or(true);
            columns.push(Column {
                name,
                sql_type,
                compare_as_text,
            });
        }

        Ok(columns)
    })
    .map_err(|e: pgrx::spi::Error| DenormError::SpiError {
        query: query.clone(),
        error: e.to_string(),
    })
}

/// Single-column primary keys only; composite keys cannot be written to
/// the dirty queue's scalar `object_id`.
fn load_primary_key(regclass: &str) -> DenormResult<Option<String>> {
    let query = format!(
        "SELECT (
            SELECT a.attname::text
            FROM pg_constraint con
            JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = con.conkey[1]
            WHERE con.conrelid = {regclass}
              AND con.contype = 'p'
              AND array_length(con.conkey, 1) = 1
        )"
    );

    Spi::get_one::<String>(&query).map_err(|e| DenormError::CatalogError {
        operation: format!("Load primary key ({regclass})"),
        pg_error: e.to_string(),
    })
}

fn load_foreign_keys(regclass: &str) -> DenormResult<Vec<ForeignKey>> {
    let query = format!(
        "SELECT a.attname::text AS column_name,
                tn.nspname::text AS target_schema,
                t.relname::text AS target_table,
                ta.attname::text AS target_column
         FROM pg_constraint con
         JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = con.conkey[1]
         JOIN pg_class t ON t.oid = con.confrelid
         JOIN pg_namespace tn ON tn.oid = t.relnamespace
         JOIN pg_attribute ta ON ta.attrelid = con.confrelid AND ta.attnum = con.confkey[1]
         WHERE con.conrelid = {regclass}
           AND con.contype = 'f'
           AND array_length(con.conkey, 1) = 1
         ORDER BY con.conname"
    );

    Spi::connect(|client| {
        let rows = client.select(&query, None, None)?;
        let mut foreign_keys = Vec::new();

        for row in rows {
            let column: String = row["column_name"].value()?.unwrap_or_default();
            let target_schema: String = row["target_schema"].value()?.unwrap_or_default();
            let target_table: String = row["target_table"].value()?.unwrap_or_default();
            let target_column: String = row["target_column"].value()?.unwrap_or_default();

            foreign_keys.push(ForeignKey {
                column,
                target: QualifiedName::new(&target_schema, &target_table),
                target_column,
            });
        }

        Ok(foreign_keys)
    })
    .map_err(|e: pgrx::spi::Error| DenormError::SpiError {
        query: query.clone(),
        error: e.to_string(),
    })
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_load_model_reads_keys() {
        Spi::run("CREATE TABLE ld_author (id BIGSERIAL PRIMARY KEY, name TEXT, profile JSON)").unwrap();
        Spi::run(
            "CREATE TABLE ld_post (
                id BIGSERIAL PRIMARY KEY,
                author_id BIGINT REFERENCES ld_author (id),
                title TEXT
            )",
        )
        .unwrap();

        let post = load_model("ld_post").unwrap().expect("ld_post exists");
        assert_eq!(post.name, QualifiedName::new("public", "ld_post"));
        assert_eq!(post.kind, RelationKind::Table);
        assert_eq!(post.primary_key.as_deref(), Some("id"));
        assert_eq!(post.columns.len(), 3);
        assert_eq!(post.foreign_keys.len(), 1);
        assert_eq!(post.foreign_keys[0].column, "author_id");
        assert_eq!(post.foreign_keys[0].target, QualifiedName::new("public", "ld_author"));
        assert_eq!(post.foreign_keys[0].target_column, "id");

        let author = load_model("public.ld_author").unwrap().expect("ld_author exists");
        assert!(author.columns.iter().any(|c| c.name == "profile" && c.compares_as_text()));
        assert!(author.columns.iter().any(|c| c.name == "name" && !c.compares_as_text()));
    }

    #[pg_test]
    fn test_incomparable_types_found_through_catalog() {
        Spi::run("CREATE DOMAIN ld_doc AS json").unwrap();
        Spi::run("CREATE DOMAIN ld_label AS text").unwrap();
        Spi::run("CREATE TYPE ld_pair AS (doc json, n int)").unwrap();
        Spi::run(
            "CREATE TABLE ld_typed (
                id INT PRIMARY KEY,
                path JSONPATH,
                doc ld_doc,
                label ld_label,
                pair ld_pair,
                meta JSONB
            )",
        )
        .unwrap();

        let model = load_model("ld_typed").unwrap().expect("ld_typed exists");
        let as_text: Vec<_> = model
            .columns
            .iter()
            .filter(|c| c.compares_as_text())
            .map(|c| c.name.as_str())
            .collect();

        assert_eq!(as_text, vec!["path", "doc", "pair"]);
        assert_eq!(model.columns[2].sql_type, "ld_doc");
    }

    #[pg_test]
    fn test_load_models_missing_table() {
        let result = load_models(["ld_missing"]);
        assert!(matches!(result, Err(DenormError::UnknownModel { .. })));
    }

    #[pg_test]
    fn test_view_kind_detected() {
        Spi::run("CREATE TABLE ld_base (id INT PRIMARY KEY)").unwrap();
        Spi::run("CREATE VIEW ld_view AS SELECT * FROM ld_base").unwrap();

        let view = load_model("ld_view").unwrap().expect("ld_view exists");
        assert_eq!(view.kind, RelationKind::View);
        assert_eq!(view.primary_key, None);
    }
}
