//! CockroachDB adapter
//!
//! Read-write transactions follow CockroachDB's client-side restart protocol:
//! a `cockroach_restart` savepoint is taken right after `BEGIN`, a retry error
//! (SQLSTATE 40001) rewinds to it and the unit of work runs again on the same
//! transaction, and the savepoint is released just before `COMMIT`. The local
//! retry driver gets a single attempt so it never stacks a second loop on top.
//!
//! Read-only transactions take a consistent snapshot and perform no writes,
//! so they are never restarted.

use std::time::Duration;

use sqlx::{Executor as _, PgPool, Postgres, Transaction};

use super::classify::{self, ConflictClassifier, Never, PG_SERIALIZATION_FAILURE};
use super::{Backend, PoolSource, RetryPolicy, TxMode};
use crate::constants::{
    CRDB_RESTART_SAVEPOINT, DEFAULT_CRDB_MAX_RESTARTS, DEFAULT_CRDB_RESTART_BACKOFF,
};
use crate::services::error::{Error, Result};

pub struct CockroachBackend {
    pool: PgPool,
    max_restarts: u32,
    restart_backoff: Duration,
    follower_reads: bool,
}

impl CockroachBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_restarts: DEFAULT_CRDB_MAX_RESTARTS,
            restart_backoff: DEFAULT_CRDB_RESTART_BACKOFF,
            follower_reads: false,
        }
    }

    /// In-place restarts allowed per transaction before the retry error is
    /// returned to the caller.
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Linear pause between in-place restarts: restart `n` waits `n * unit`.
    pub fn with_restart_backoff(mut self, unit: Duration) -> Self {
        self.restart_backoff = unit;
        self
    }

    /// Serve read-only transactions from the nearest replica at a slightly
    /// stale timestamp.
    pub fn with_follower_reads(mut self, enabled: bool) -> Self {
        self.follower_reads = enabled;
        self
    }

    fn read_only_statement(&self) -> &'static str {
        if self.follower_reads {
            "SET TRANSACTION AS OF SYSTEM TIME follower_read_timestamp()"
        } else {
            "SET TRANSACTION READ ONLY"
        }
    }

    fn wants_restart(&self, mode: TxMode, err: &Error, restarts: u32) -> bool {
        mode == TxMode::ReadWrite
            && restarts < self.max_restarts
            && classify::driver_errors(err)
                .any(|db| db.code().is_some_and(|code| code == PG_SERIALIZATION_FAILURE))
    }
}

impl PoolSource for CockroachBackend {
    type Db = Postgres;

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Backend for CockroachBackend {
    type Conn = Transaction<'static, Postgres>;

    fn name(&self) -> &'static str {
        "cockroach"
    }

    fn supports_read_only(&self) -> bool {
        true
    }

    fn classifier(&self) -> &dyn ConflictClassifier {
        &Never
    }

    fn retry_policy(&self, _mode: TxMode) -> RetryPolicy {
        RetryPolicy::single()
    }

    async fn begin(&self, mode: TxMode) -> Result<Self::Conn> {
        let mut tx = self.pool.begin().await?;
        match mode {
            TxMode::ReadWrite => {
                (&mut *tx)
                    .execute(format!("SAVEPOINT {}", CRDB_RESTART_SAVEPOINT).as_str())
                    .await?;
            }
            TxMode::ReadOnly => {
                (&mut *tx).execute(self.read_only_statement()).await?;
            }
        }
        Ok(tx)
    }

    async fn commit(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.commit().await?)
    }

    async fn rollback(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.rollback().await?)
    }

    async fn before_commit(&self, mode: TxMode, conn: &mut Self::Conn) -> Result<()> {
        if mode == TxMode::ReadWrite {
            (&mut **conn)
                .execute(format!("RELEASE SAVEPOINT {}", CRDB_RESTART_SAVEPOINT).as_str())
                .await?;
        }
        Ok(())
    }

    async fn restart(
        &self,
        mode: TxMode,
        conn: &mut Self::Conn,
        err: &Error,
        restarts: u32,
    ) -> Result<bool> {
        if !self.wants_restart(mode, err, restarts) {
            return Ok(false);
        }
        (&mut **conn)
            .execute(format!("ROLLBACK TO SAVEPOINT {}", CRDB_RESTART_SAVEPOINT).as_str())
            .await?;
        Ok(true)
    }

    fn restart_backoff(&self, restarts: u32) -> Duration {
        self.restart_backoff.saturating_mul(restarts)
    }
}
