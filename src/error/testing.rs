//! Assertions on `DenormResult` shared by unit and `pg_test` tests

#![cfg(any(test, feature = "pg_test"))]

use super::DenormError;
use crate::DenormResult;

/// # Panics
/// Panics if the result is `Ok`.
fn expect_failure<T: std::fmt::Debug>(result: DenormResult<T>, expected: &str) -> DenormError {
    match result {
        Err(e) => e,
        Ok(value) => panic!("Expected {expected}, got Ok({value:?})"),
    }
}

/// # Panics
/// Panics unless the result is an error with the given SQLSTATE.
pub fn assert_error_sqlstate<T: std::fmt::Debug>(result: DenormResult<T>, expected_sqlstate: &str) {
    let e = expect_failure(result, &format!("SQLSTATE {expected_sqlstate}"));
    assert_eq!(
        e.sqlstate(),
        expected_sqlstate,
        "Expected SQLSTATE {expected_sqlstate}, got {}: {e}",
        e.sqlstate()
    );
}

/// # Panics
/// Panics unless the result is an error whose message contains `expected_substring`.
pub fn assert_error_contains<T: std::fmt::Debug>(result: DenormResult<T>, expected_substring: &str) {
    let message = expect_failure(result, &format!("an error containing '{expected_substring}'")).to_string();
    assert!(
        message.contains(expected_substring),
        "'{message}' does not contain '{expected_substring}'"
    );
}

/// # Panics
/// Panics unless the result is a configuration error.
pub fn assert_configuration_error<T: std::fmt::Debug>(result: DenormResult<T>) {
    let e = expect_failure(result, "a configuration error");
    assert!(e.is_configuration_error(), "{e} is not a configuration error");
}
