use pgrx::prelude::*;
use pgrx::IntoDatum;

/// Run a query returning a single text value
pub fn spi_get_string(query: &str) -> spi::Result<Option<String>> {
    Spi::get_one::<String>(query)
}

/// The role running the current statement
pub fn current_user() -> String {
    spi_get_string("SELECT current_user::text")
        .ok()
        .flatten()
        .unwrap_or_else(|| "unknown".to_string())
}

/// A nullable `text` argument for the `*_with_args` SPI calls
pub fn text_arg(value: Option<&str>) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTOID), value.into_datum())
}

/// A `text[]` argument for the `*_with_args` SPI calls
pub fn text_array_arg(values: &[String]) -> (PgOid, Option<pg_sys::Datum>) {
    (PgOid::BuiltIn(PgBuiltInOids::TEXTARRAYOID), values.to_vec().into_datum())
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;

    #[pg_test]
    fn test_current_user_is_known() {
        assert_ne!(current_user(), "unknown");
    }

    #[pg_test]
    fn test_text_arg_binds_null() {
        let is_null = Spi::get_one_with_args::<bool>("SELECT $1 IS NULL", vec![text_arg(None)]).unwrap();
        assert_eq!(is_null, Some(true));

        let echoed = Spi::get_one_with_args::<String>("SELECT $1", vec![text_arg(Some("post"))]).unwrap();
        assert_eq!(echoed.as_deref(), Some("post"));
    }

    #[pg_test]
    fn test_text_array_arg_binds_empty_array() {
        let length = Spi::get_one_with_args::<i32>(
            "SELECT cardinality($1)",
            vec![text_array_arg(&[])],
        )
        .unwrap();
        assert_eq!(length, Some(0));

        let values = vec!["a".to_string(), "b".to_string()];
        let joined = Spi::get_one_with_args::<String>("SELECT array_to_string($1, ',')", vec![text_array_arg(&values)]).unwrap();
        assert_eq!(joined.as_deref(), Some("a,b"));
    }
}
