//! Conflict classification
//!
//! Each backend adapter picks one [`ConflictClassifier`] at construction time.
//! The retry driver asks it whether a failed attempt is worth another try; the
//! classifier looks through the whole error chain for the backend's driver
//! error and matches it against that backend's conflict signature.
//!
//! [`kind_of`] is the coarse mapping used when a driver error first enters the
//! system. It knows every supported backend's codes so the category survives
//! even when the error is inspected far away from the adapter that raised it.

use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;

use crate::services::error::{Error, ErrorKind};

/// PostgreSQL `serialization_failure`
pub const PG_SERIALIZATION_FAILURE: &str = "40001";
/// PostgreSQL `deadlock_detected`
pub const PG_DEADLOCK_DETECTED: &str = "40P01";
/// PostgreSQL `lock_not_available`
pub const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// MySQL `ER_LOCK_DEADLOCK`
pub const MYSQL_LOCK_DEADLOCK: u16 = 1213;
/// MySQL `ER_LOCK_WAIT_TIMEOUT`
pub const MYSQL_LOCK_WAIT_TIMEOUT: u16 = 1205;

const PG_CONFLICT_CODES: [&str; 3] = [
    PG_SERIALIZATION_FAILURE,
    PG_LOCK_NOT_AVAILABLE,
    PG_DEADLOCK_DETECTED,
];

pub trait ConflictClassifier: Send + Sync {
    /// Whether a single driver error matches this backend's conflict signature.
    fn is_conflict(&self, err: &(dyn DatabaseError + 'static)) -> bool;

    /// Whether a failed attempt should be retried. Cancellation and not-found
    /// are never retried, whatever they wrap.
    fn is_retryable(&self, err: &Error) -> bool {
        if err.is(ErrorKind::Canceled) || err.is(ErrorKind::NotFound) {
            return false;
        }
        driver_errors(err).any(|db| self.is_conflict(db))
    }
}

/// Driver errors found anywhere in `err`'s source chain.
pub fn driver_errors(err: &Error) -> impl Iterator<Item = &(dyn DatabaseError + 'static)> {
    err.chain()
        .filter_map(|e| match e.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::Database(db)) => Some(&**db),
            _ => None,
        })
}

/// Serialization failure, lock timeout or deadlock.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConflicts;

impl ConflictClassifier for PostgresConflicts {
    fn is_conflict(&self, err: &(dyn DatabaseError + 'static)) -> bool {
        err.code()
            .is_some_and(|code| PG_CONFLICT_CODES.iter().any(|c| code == *c))
    }
}

/// Deadlock only. MySQL reports its SQLSTATE through `code()`, so the match is on
/// the numeric error instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConflicts;

impl MySqlConflicts {
    /// Whether a MySQL error number is worth another attempt.
    pub fn is_conflict_number(number: u16) -> bool {
        number == MYSQL_LOCK_DEADLOCK
    }
}

impl ConflictClassifier for MySqlConflicts {
    fn is_conflict(&self, err: &(dyn DatabaseError + 'static)) -> bool {
        err.try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| Self::is_conflict_number(e.number()))
    }
}

/// For backends whose own client owns conflict retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl ConflictClassifier for Never {
    fn is_conflict(&self, _err: &(dyn DatabaseError + 'static)) -> bool {
        false
    }

    fn is_retryable(&self, _err: &Error) -> bool {
        false
    }
}

/// Category of a driver error as it enters the system.
pub fn kind_of(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db) if is_known_conflict(&**db) => ErrorKind::Conflict,
        _ => ErrorKind::Internal,
    }
}

fn is_known_conflict(err: &(dyn DatabaseError + 'static)) -> bool {
    if let Some(mysql) = err.try_downcast_ref::<MySqlDatabaseError>() {
        return matches!(mysql.number(), MYSQL_LOCK_DEADLOCK | MYSQL_LOCK_WAIT_TIMEOUT);
    }
    PostgresConflicts.is_conflict(err)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    use sqlx::error::{DatabaseError, ErrorKind as DbErrorKind};

    /// Driver error carrying only a SQLSTATE, for classifier tests.
    #[derive(Debug)]
    pub struct SqlState(pub &'static str);

    impl fmt::Display for SqlState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "error returned from database: sqlstate {}", self.0)
        }
    }

    impl StdError for SqlState {}

    impl DatabaseError for SqlState {
        fn message(&self) -> &str {
            "fake database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> DbErrorKind {
            DbErrorKind::Other
        }
    }

    pub fn sqlstate(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlState(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::fake::sqlstate;
    use super::*;
    use crate::services::context::Cancellation;

    #[test]
    fn test_postgres_conflict_codes() {
        for code in ["40001", "55P03", "40P01"] {
            let err = Error::from(sqlstate(code));
            assert_eq!(err.kind(), ErrorKind::Conflict, "code {code}");
            assert!(PostgresConflicts.is_retryable(&err), "code {code}");
        }

        // unique_violation
        let err = Error::from(sqlstate("23505"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!PostgresConflicts.is_retryable(&err));
    }

    #[test]
    fn test_signature_survives_wrapping() {
        let err = Error::internal("commit failed", Error::from(sqlstate("40001")));
        assert!(PostgresConflicts.is_retryable(&err));
        assert_eq!(driver_errors(&err).count(), 1);
    }

    #[test]
    fn test_cancellation_is_never_retryable() {
        let err = Error::canceled_during(Cancellation::Canceled, Error::from(sqlstate("40P01")));
        assert!(!PostgresConflicts.is_retryable(&err));
    }

    #[test]
    fn test_application_and_not_found_are_not_retryable() {
        assert!(!PostgresConflicts.is_retryable(&Error::application("insufficient funds")));
        assert!(!PostgresConflicts.is_retryable(&Error::from(sqlx::Error::RowNotFound)));
        assert!(!PostgresConflicts.is_retryable(&Error::conflict("no driver error attached")));
    }

    #[test]
    fn test_mysql_deadlock_number_is_retried() {
        assert!(MySqlConflicts::is_conflict_number(1213));
        // lock wait timeout and duplicate key
        assert!(!MySqlConflicts::is_conflict_number(1205));
        assert!(!MySqlConflicts::is_conflict_number(1062));
    }

    #[test]
    fn test_mysql_classifier_ignores_sqlstate() {
        // MySQL deadlocks also report 40001; only the error number counts.
        let err = Error::from(sqlstate("40001"));
        assert!(!MySqlConflicts.is_retryable(&err));
        assert!(!Never.is_retryable(&err));
    }
}
