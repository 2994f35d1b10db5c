use std::fmt;

pub mod testing;

/// Main error type for the pg_denorm extension
#[derive(Debug, Clone, PartialEq)]
pub enum DenormError {
    // ============ Configuration Errors (raised before any SQL is generated) ============
    /// Neither side of a declared dependency holds a foreign key to the other
    UnresolvableDependency {
        owner: String,
        source: String,
    },

    /// More than one foreign key matches and no explicit field was given
    AmbiguousDependency {
        owner: String,
        source: String,
        candidates: Vec<String>,
    },

    /// Row triggers cannot be placed on this kind of relation
    UnsupportedSubjectType {
        table: String,
        kind: String,
    },

    /// A declaration references a table that does not exist (yet)
    UnknownModel {
        name: String,
    },

    /// Forward dependencies select the owner's id, which needs a single-column primary key
    MissingPrimaryKey {
        table: String,
    },

    /// Derived trigger or function name does not fit in a PostgreSQL identifier
    TriggerNameTooLong {
        name: String,
        max_len: usize,
    },

    /// Column list and value list of an action differ in length
    ActionShapeMismatch {
        table: String,
        columns: usize,
        values: usize,
    },

    /// Invalid user input (table or column reference)
    InvalidInput {
        parameter: String,
        value: String,
        reason: String,
    },

    // ============ Catalog / Execution Errors ============
    /// PostgreSQL catalog operation failed
    CatalogError {
        operation: String,
        pg_error: String,
    },

    /// SPI operation failed
    SpiError {
        query: String,
        error: String,
    },

    /// Creating, replacing or dropping one trigger failed
    TriggerDdlFailed {
        trigger: String,
        table: String,
        operation: String,
        pg_error: String,
    },

    // ============ Internal Errors ============
    /// Serialization/deserialization failed
    SerializationError {
        message: String,
    },

    /// Internal error (bug in extension)
    InternalError {
        message: String,
        file: &'static str,
        line: u32,
    },
}

impl DenormError {
    /// Get PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use DenormError::*;
        match self {
            UnresolvableDependency { .. } => "55000", // Object not in prerequisite state
            AmbiguousDependency { .. } => "42702", // Ambiguous column
            UnsupportedSubjectType { .. } => "42809", // Wrong object type
            UnknownModel { .. } => "42P01", // Undefined table
            MissingPrimaryKey { .. } => "42P10", // Invalid column reference
            TriggerNameTooLong { .. } => "42622", // Name too long
            ActionShapeMismatch { .. } => "42601", // Syntax error
            InvalidInput { .. } => "22023", // Invalid parameter value

            CatalogError { .. } => "XX000",
            SpiError { .. } => "XX000",
            TriggerDdlFailed { .. } => "XX000",

            SerializationError { .. } => "XX000",
            InternalError { .. } => "XX000",
        }
    }

    /// Configuration errors point at the declarations, not at the database.
    /// They are fatal at setup time and re-running will not help.
    pub fn is_configuration_error(&self) -> bool {
        use DenormError::*;
        matches!(
            self,
            UnresolvableDependency { .. }
                | AmbiguousDependency { .. }
                | UnsupportedSubjectType { .. }
                | UnknownModel { .. }
                | MissingPrimaryKey { .. }
                | TriggerNameTooLong { .. }
                | ActionShapeMismatch { .. }
                | InvalidInput { .. }
        )
    }

    /// Create internal error with file/line info
    pub fn internal(message: String, file: &'static str, line: u32) -> Self {
        DenormError::InternalError { message, file, line }
    }
}

impl fmt::Display for DenormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DenormError::*;
        match self {
            UnresolvableDependency { owner, source } => {
                write!(
                    f,
                    "{} has no foreign keys to {} (or reverse); cannot auto-resolve",
                    owner, source
                )
            }
            AmbiguousDependency { owner, source, candidates } => {
                write!(
                    f,
                    "Dependency of {} on {} is ambiguous: candidate foreign keys {}; name one explicitly",
                    owner,
                    source,
                    candidates.join(", ")
                )
            }
            UnsupportedSubjectType { table, kind } => {
                write!(f, "Cannot install row triggers on '{}' ({})", table, kind)
            }
            UnknownModel { name } => {
                write!(f, "Table '{}' referenced by a dependency does not exist", name)
            }
            MissingPrimaryKey { table } => {
                write!(f, "Table '{}' has no single-column primary key", table)
            }
            TriggerNameTooLong { name, max_len } => {
                write!(
                    f,
                    "Trigger name '{}' is {} bytes long, maximum is {}",
                    name,
                    name.len(),
                    max_len
                )
            }
            ActionShapeMismatch { table, columns, values } => {
                write!(
                    f,
                    "Trigger action on '{}' has {} columns but {} values",
                    table, columns, values
                )
            }
            InvalidInput { parameter, value, reason } => {
                write!(f, "Invalid {} '{}': {}", parameter, value, reason)
            }
            CatalogError { operation, pg_error } => {
                write!(f, "Catalog operation '{}' failed: {}", operation, pg_error)
            }
            SpiError { query, error } => {
                let shown: String = query.chars().take(100).collect();
                write!(f, "SPI query failed: {}\nQuery: {}", error, shown)
            }
            TriggerDdlFailed { trigger, table, operation, pg_error } => {
                write!(
                    f,
                    "Failed to {} trigger {} on {}: {}",
                    operation, trigger, table, pg_error
                )
            }
            SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            InternalError { message, file, line } => {
                write!(f, "Internal error at {}:{}: {}\nPlease report this bug.",
                       file, line, message)
            }
        }
    }
}

impl std::error::Error for DenormError {}

/// Result type for pg_denorm operations
pub type DenormResult<T> = Result<T, DenormError>;

/// Convert SpiError to DenormError
impl From<pgrx::spi::Error> for DenormError {
    fn from(e: pgrx::spi::Error) -> Self {
        DenormError::SpiError {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to DenormError
impl From<serde_json::Error> for DenormError {
    fn from(e: serde_json::Error) -> Self {
        DenormError::SerializationError {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

/// Helper macro for creating internal errors with automatic file/line
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::DenormError::internal($msg.to_string(), file!(), line!())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DenormError::internal(format!($fmt, $($arg)*), file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolvable_names_both_tables() {
        let err = DenormError::UnresolvableDependency {
            owner: "public.author".to_string(),
            source: "public.tag".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("public.author"));
        assert!(msg.contains("public.tag"));
        assert_eq!(err.sqlstate(), "55000");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = DenormError::AmbiguousDependency {
            owner: "public.post".to_string(),
            source: "public.person".to_string(),
            candidates: vec!["author_id".to_string(), "editor_id".to_string()],
        };

        assert!(err.to_string().contains("author_id, editor_id"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_ddl_failure_carries_trigger_and_table() {
        let err = DenormError::TriggerDdlFailed {
            trigger: "denorm_after_row_insert_on_post".to_string(),
            table: "public.post".to_string(),
            operation: "install".to_string(),
            pg_error: "permission denied".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("denorm_after_row_insert_on_post"));
        assert!(msg.contains("public.post"));
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_internal_error_macro() {
        let err = internal_error!("Test error at {}", "location");

        match err {
            DenormError::InternalError { message, file, line } => {
                assert!(message.contains("Test error"));
                assert!(file.ends_with("mod.rs"));
                assert!(line > 0);
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_name_too_long_reports_length() {
        let name = "x".repeat(70);
        let err = DenormError::TriggerNameTooLong { name, max_len: 63 };
        assert!(err.to_string().contains("70 bytes"));
        assert_eq!(err.sqlstate(), "42622");
    }

    #[test]
    fn test_spi_error_truncates_on_char_boundary() {
        let query = format!("INSERT INTO log VALUES ('{}')", "é".repeat(120));
        let err = DenormError::SpiError {
            query,
            error: "boom".to_string(),
        };

        let msg = err.to_string();
        let shown = msg.split("Query: ").nth(1).unwrap();
        assert_eq!(shown.chars().count(), 100);
        assert!(shown.ends_with('é'));
    }
}
