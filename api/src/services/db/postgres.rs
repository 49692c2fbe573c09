//! PostgreSQL adapter
//!
//! Retries serialization failures (40001), lock timeouts (55P03) and deadlocks
//! (40P01) through the local retry driver. Read-only transactions are plain
//! `READ ONLY` transactions at the configured isolation level.

use std::fmt;
use std::str::FromStr;

use sqlx::{Executor as _, PgPool, Postgres, Transaction};

use super::classify::{ConflictClassifier, PostgresConflicts};
use super::{Backend, PoolSource, RetryPolicy, TxMode};
use crate::services::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn statement(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "read committed"),
            IsolationLevel::RepeatableRead => write!(f, "repeatable read"),
            IsolationLevel::Serializable => write!(f, "serializable"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], " ").as_str() {
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(Error::misconfigured(format!(
                "unknown isolation level: {}",
                other
            ))),
        }
    }
}

pub struct PostgresBackend {
    pool: PgPool,
    policy: RetryPolicy,
    isolation: Option<IsolationLevel>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            isolation: None,
        }
    }

    /// Isolation level applied to every transaction. Without one the server
    /// default is used.
    pub fn with_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.isolation = isolation;
        self
    }
}

impl PoolSource for PostgresBackend {
    type Db = Postgres;

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Backend for PostgresBackend {
    type Conn = Transaction<'static, Postgres>;

    fn name(&self) -> &'static str {
        "postgres"
    }

    fn supports_read_only(&self) -> bool {
        true
    }

    fn classifier(&self) -> &dyn ConflictClassifier {
        &PostgresConflicts
    }

    fn retry_policy(&self, _mode: TxMode) -> RetryPolicy {
        self.policy
    }

    async fn begin(&self, mode: TxMode) -> Result<Self::Conn> {
        let mut tx = self.pool.begin().await?;
        // SET TRANSACTION must precede every other statement in the transaction
        if let Some(isolation) = self.isolation {
            (&mut *tx).execute(isolation.statement()).await?;
        }
        if mode == TxMode::ReadOnly {
            (&mut *tx).execute("SET TRANSACTION READ ONLY").await?;
        }
        Ok(tx)
    }

    async fn commit(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.commit().await?)
    }

    async fn rollback(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.rollback().await?)
    }
}
