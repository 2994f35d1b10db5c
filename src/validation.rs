//! Input Validation Module
//!
//! Table and column references arrive as text from SQL callers and end up
//! inside generated DDL. Everything is checked here before it is stored in
//! `denorm_dependency` or looked up in the catalog.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crate::validation::{validate_column_name, validate_table_reference};
//!
//! validate_table_reference("blog.post", "owner")?;
//! validate_column_name("author_id", "foreign_key")?;
//! ```

use crate::config::{MAX_IDENTIFIER_LEN, SELF_REFERENCE};
use crate::error::{DenormError, DenormResult};

/// Validate one `PostgreSQL` identifier (table, column, schema name)
///
/// Allows alphanumeric characters and underscores, not starting with a
/// digit, at most 63 bytes. Rejects quotes, semicolons, dashes, spaces.
///
/// ```rust,ignore
/// validate_sql_identifier("author_id", "column")?;         // ✓
/// validate_sql_identifier("post; DROP TABLE", "table")?;  // ✗
/// validate_sql_identifier("2fa", "column")?;               // ✗
/// ```
pub fn validate_sql_identifier(identifier: &str, param_name: &str) -> DenormResult<()> {
    let invalid = |reason: &str| DenormError::InvalidInput {
        parameter: param_name.to_string(),
        value: sanitize_for_logging(identifier),
        reason: reason.to_string(),
    };

    let Some(first) = identifier.chars().next() else {
        return Err(invalid("Identifier cannot be empty"));
    };

    let dangerous_chars = [';', '-', '\'', '"', '/', '*', '\\', '\0', '.'];
    if let Some(ch) = dangerous_chars.iter().find(|ch| identifier.contains(**ch)) {
        return Err(invalid(&format!("Identifier contains forbidden character: '{}'", ch)));
    }

    if !identifier.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(invalid(
            "Identifier must contain only alphanumeric characters and underscores",
        ));
    }

    if first.is_numeric() {
        return Err(invalid("Identifier cannot start with a digit"));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(invalid(&format!(
            "Identifier too long ({} bytes, max {})",
            identifier.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    Ok(())
}

/// Validate `table` or `schema.table`
pub fn validate_table_reference(reference: &str, param_name: &str) -> DenormResult<()> {
    let parts: Vec<&str> = reference.split('.').collect();
    if parts.len() > 2 {
        return Err(DenormError::InvalidInput {
            parameter: param_name.to_string(),
            value: sanitize_for_logging(reference),
            reason: "Expected 'table' or 'schema.table'".to_string(),
        });
    }

    for part in parts {
        validate_sql_identifier(part, param_name)?;
    }
    Ok(())
}

/// A dependency source: a table reference or the `self` marker
pub fn validate_source_reference(reference: &str, param_name: &str) -> DenormResult<()> {
    if reference == SELF_REFERENCE {
        return Ok(());
    }
    validate_table_reference(reference, param_name)
}

/// Validate column name (alias for identifier)
pub fn validate_column_name(name: &str, param_name: &str) -> DenormResult<()> {
    validate_sql_identifier(name, param_name)
}

/// Sanitize string for logging (truncate, escape control characters)
fn sanitize_for_logging(s: &str) -> String {
    let max_len = 50;
    let truncated = if s.chars().count() > max_len {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    } else {
        s.to_string()
    };

    truncated
        .replace('\0', "\\0")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_contains;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_sql_identifier("post", "test").is_ok());
        assert!(validate_sql_identifier("author_id", "test").is_ok());
        assert!(validate_sql_identifier("Order2", "test").is_ok());
        assert!(validate_sql_identifier("_hidden", "test").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(validate_sql_identifier("", "test").is_err());
        assert!(validate_sql_identifier("post; DROP", "test").is_err());
        assert!(validate_sql_identifier("user-data", "test").is_err());
        assert!(validate_sql_identifier("my table", "test").is_err());
        assert!(validate_sql_identifier("'admin'", "test").is_err());
        assert!(validate_sql_identifier("123table", "test").is_err());
        assert!(validate_sql_identifier(&"a".repeat(64), "test").is_err());
    }

    #[test]
    fn test_table_references() {
        assert!(validate_table_reference("post", "owner").is_ok());
        assert!(validate_table_reference("blog.post", "owner").is_ok());
        assert!(validate_table_reference("a.b.c", "owner").is_err());
        assert!(validate_table_reference("blog.", "owner").is_err());
        assert_error_contains(validate_table_reference(".post", "owner"), "cannot be empty");
    }

    #[test]
    fn test_source_accepts_self_marker() {
        assert!(validate_source_reference("self", "source").is_ok());
        assert!(validate_source_reference("blog.author", "source").is_ok());
        assert!(validate_source_reference("self; --", "source").is_err());
    }

    #[test]
    fn test_error_value_is_truncated() {
        let long = format!("{};", "x".repeat(80));
        match validate_sql_identifier(&long, "column") {
            Err(DenormError::InvalidInput { value, parameter, .. }) => {
                assert_eq!(parameter, "column");
                assert!(value.ends_with("..."));
                assert_eq!(value.chars().count(), 53);
            }
            other => panic!("expected invalid input, got {:?}", other),
        }
    }
}
