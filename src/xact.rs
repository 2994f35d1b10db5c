use std::panic::AssertUnwindSafe;

use pgrx::pg_sys::panic::CaughtError;
use pgrx::prelude::*;

use crate::error::DenormResult;

/// Run `f` as one atomic unit inside an internal subtransaction.
///
/// The subtransaction is released when `f` returns `Ok` and rolled back
/// when it returns `Err`, so a failed phase leaves nothing behind while
/// the caller's transaction stays usable. Work done by `f` only becomes
/// durable when the enclosing transaction commits.
pub fn atomic<T>(f: impl FnOnce() -> DenormResult<T>) -> DenormResult<T> {
    // SAFETY: plain reads of backend globals, restored below exactly as
    // PL/pgSQL exception blocks do
    let (memory_context, resource_owner) =
        unsafe { (pg_sys::CurrentMemoryContext, pg_sys::CurrentResourceOwner) };

    unsafe {
        pg_sys::BeginInternalSubTransaction(std::ptr::null());
        pg_sys::CurrentMemoryContext = memory_context;
    }

    let result = f();

    unsafe {
        match &result {
            Ok(_) => pg_sys::ReleaseCurrentSubTransaction(),
            Err(_) => pg_sys::RollbackAndReleaseCurrentSubTransaction(),
        }
        pg_sys::CurrentMemoryContext = memory_context;
        pg_sys::CurrentResourceOwner = resource_owner;
    }

    result
}

/// Turn a PostgreSQL ERROR raised by `f` into an `Err` carrying its message.
///
/// Only sound inside [`atomic`]: the caller must return the error so the
/// subtransaction is rolled back.
pub fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    PgTryBuilder::new(AssertUnwindSafe(|| Ok(f())))
        .catch_others(|error| Err(describe(&error)))
        .execute()
}

fn describe(error: &CaughtError) -> String {
    match error {
        CaughtError::PostgresError(report) | CaughtError::ErrorReport(report) => report.message().to_string(),
        CaughtError::RustPanic { ereport, .. } => ereport.message().to_string(),
    }
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use super::*;
    use crate::error::DenormError;

    fn table_exists(name: &str) -> bool {
        Spi::get_one::<bool>(&format!("SELECT to_regclass('{}') IS NOT NULL", name))
            .unwrap()
            .unwrap_or(false)
    }

    #[pg_test]
    fn test_atomic_commits_on_ok() {
        let result = atomic(|| {
            Spi::run("CREATE TABLE xa_kept (id INT)")?;
            Ok(1)
        });

        assert_eq!(result.unwrap(), 1);
        assert!(table_exists("xa_kept"));
    }

    #[pg_test]
    fn test_atomic_rolls_back_on_err() {
        let result: Result<(), _> = atomic(|| {
            Spi::run("CREATE TABLE xa_first (id INT)")?;
            Spi::run("CREATE TABLE xa_second (id INT)")?;
            Err(crate::internal_error!("phase failed"))
        });

        assert!(matches!(result, Err(DenormError::InternalError { .. })));
        assert!(!table_exists("xa_first"));
        assert!(!table_exists("xa_second"));
    }

    #[pg_test]
    fn test_guarded_reports_postgres_errors() {
        let result = atomic(|| {
            Spi::run("CREATE TABLE xa_dup (id INT)")?;
            match guarded(|| Spi::run("CREATE TABLE xa_dup (id INT)")) {
                Ok(_) => Ok(()),
                Err(message) => Err(DenormError::CatalogError {
                    operation: "create".to_string(),
                    pg_error: message,
                }),
            }
        });

        match result {
            Err(DenormError::CatalogError { pg_error, .. }) => assert!(pg_error.contains("already exists")),
            other => panic!("expected catalog error, got {:?}", other),
        }
        assert!(!table_exists("xa_dup"));
        assert!(Spi::get_one::<i32>("SELECT 1").unwrap() == Some(1));
    }
}
