//! Error envelope and error handling utilities for route handlers
//!
//! Every failure crossing the transaction core is an [`Error`]: a category tag,
//! a message and the original cause. Conflict classification looks through the
//! whole source chain, so wrapping an error never hides the driver error that
//! decides whether an attempt is retried.

use std::fmt;

use axum::http::StatusCode;

use super::context::Cancellation;
use super::db::classify;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller's context was canceled or its deadline passed.
    Canceled,
    /// Deadlock, serialization failure or lock timeout reported by the store.
    Conflict,
    NotFound,
    /// Returned on purpose by a unit of work.
    Application,
    /// Commit/rollback plumbing failures and unexpected driver errors.
    Internal,
    /// A programming or configuration bug. Never retried.
    Misconfigured,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Canceled => "canceled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not found",
            ErrorKind::Application => "application",
            ErrorKind::Internal => "internal",
            ErrorKind::Misconfigured => "misconfigured",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn canceled(reason: Cancellation) -> Self {
        Self::new(ErrorKind::Canceled, reason.to_string())
    }

    /// Cancellation observed while `cause` was being produced.
    pub fn canceled_during(reason: Cancellation, cause: Error) -> Self {
        Self::with_source(ErrorKind::Canceled, reason.to_string(), cause)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Wrap an error raised by business logic. The message is the cause's own.
    pub fn application(cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        Self {
            kind: ErrorKind::Application,
            message: cause.to_string(),
            source: Some(cause),
        }
    }

    pub fn internal(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::with_source(ErrorKind::Internal, message, cause)
    }

    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misconfigured, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this error, or any `Error` it wraps, carries `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.chain()
            .filter_map(|e| e.downcast_ref::<Error>())
            .any(|e| e.kind == kind)
    }

    /// This error followed by its sources, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &(dyn std::error::Error + 'static)> {
        std::iter::successors(
            Some(self as &(dyn std::error::Error + 'static)),
            |e| e.source(),
        )
    }

    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Canceled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Application => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal | ErrorKind::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = classify::kind_of(&err);
        Self {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Extension trait for logging errors and converting to StatusCode
pub trait LogErr<T> {
    /// Log error with context and return INTERNAL_SERVER_ERROR
    fn log_500(self, context: &str) -> Result<T, StatusCode>;

    /// Log error with context and return a custom StatusCode
    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode>;
}

impl<T, E: fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            log::error!("{}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }

    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode> {
        self.map_err(|e| {
            log::warn!("{}: {}", context, e);
            status
        })
    }
}

/// Log an [`Error`] and map it to the status code of its category
pub trait LogKind<T> {
    fn log_kind(self, context: &str) -> Result<T, StatusCode>;
}

impl<T> LogKind<T> for Result<T, Error> {
    fn log_kind(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            let status = e.status();
            if status.is_server_error() {
                log::error!("{}: {}", context, e);
            } else {
                log::debug!("{}: {}", context, e);
            }
            status
        })
    }
}
