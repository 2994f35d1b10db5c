//! SQL Fragment Model
//!
//! The leaf of the trigger engine: a small PostgreSQL AST that trigger
//! actions are built from. Nothing here talks to the database, so every
//! node renders deterministically and can be tested without a backend.
//!
//! - [`QualifiedName`]: `schema.table` with identifier quoting
//! - [`ValueExpr`]: literals, row references (`NEW.col`), raw tokens and
//!   nested selects
//! - [`quote_ident`] / [`quote_literal`]: pure equivalents of the
//!   PostgreSQL functions of the same name

pub mod expr;

pub use expr::{NestedSelect, RowVersion, SqlValue, ValueExpr};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved words that must be quoted even when they look like plain identifiers
const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
    "fetch", "for", "foreign", "from", "grant", "group", "having", "in", "initially",
    "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "table", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Quote an identifier the way `quote_ident()` does: bare when it is a plain
/// lower-case identifier, double-quoted otherwise.
pub fn quote_ident(name: &str) -> String {
    if is_plain_identifier(name) && !RESERVED_WORDS.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
}

/// Quote a text literal the way `quote_literal()` does under
/// `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// A relation name with an optional schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub name: String,
}

impl QualifiedName {
    pub fn new(schema: &str, name: &str) -> Self {
        Self {
            schema: Some(schema.to_string()),
            name: name.to_string(),
        }
    }

    pub fn unqualified(name: &str) -> Self {
        Self {
            schema: None,
            name: name.to_string(),
        }
    }

    /// Parse `schema.table` or `table`. Quoted identifiers are not supported
    /// here; references are validated before they reach this point.
    pub fn parse(reference: &str) -> Self {
        match reference.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::unqualified(reference),
        }
    }

    /// Rendered for SQL text: each part passed through [`quote_ident`]
    pub fn to_sql(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain_names_stay_bare() {
        assert_eq!(quote_ident("author_id"), "author_id");
        assert_eq!(quote_ident("_private"), "_private");
    }

    #[test]
    fn test_quote_ident_quotes_when_needed() {
        assert_eq!(quote_ident("User"), "\"User\"");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("2fa"), "\"2fa\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("public.post"), "'public.post'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_qualified_name_parse_and_render() {
        let name = QualifiedName::parse("blog.post");
        assert_eq!(name.schema.as_deref(), Some("blog"));
        assert_eq!(name.to_sql(), "blog.post");
        assert_eq!(name.to_string(), "blog.post");

        let bare = QualifiedName::parse("order");
        assert_eq!(bare.schema, None);
        assert_eq!(bare.to_sql(), "\"order\"");
    }
}
