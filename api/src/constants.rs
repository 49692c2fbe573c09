//! Application constants

use std::time::Duration;

/// Attempts per transaction before a conflict is surfaced to the caller
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Backoff after attempt `n` is `n` times this unit
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_millis(100);

/// In-place restarts allowed inside one CockroachDB transaction
pub const DEFAULT_CRDB_MAX_RESTARTS: u32 = 10;

/// Pause after in-place CockroachDB restart `n` is `n` times this unit
pub const DEFAULT_CRDB_RESTART_BACKOFF: Duration = Duration::from_millis(10);

/// Savepoint name CockroachDB recognises for its client-side retry protocol
pub const CRDB_RESTART_SAVEPOINT: &str = "cockroach_restart";

/// Default connection pool size
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Deadline applied to every inbound request's context
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Access token lifetime (10 minutes)
pub const ACCESS_TOKEN_EXPIRY_MINUTES: i64 = 10;

/// Refresh token lifetime (30 days)
pub const REFRESH_TOKEN_EXPIRY_DAYS: i64 = 30;

/// How often expired refresh tokens are purged
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
