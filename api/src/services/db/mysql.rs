//! MySQL adapter
//!
//! Deadlocks (error 1213) are retried through the local retry driver. Lock wait
//! timeouts are reported as conflicts but not retried. There are no read-only
//! transactions on this backend.

use sqlx::{MySql, MySqlPool, Transaction};

use super::classify::{ConflictClassifier, MySqlConflicts};
use super::{Backend, PoolSource, RetryPolicy, TxMode};
use crate::services::error::Result;

pub struct MySqlBackend {
    pool: MySqlPool,
    policy: RetryPolicy,
}

impl MySqlBackend {
    pub fn new(pool: MySqlPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }
}

impl PoolSource for MySqlBackend {
    type Db = MySql;

    fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

impl Backend for MySqlBackend {
    type Conn = Transaction<'static, MySql>;

    fn name(&self) -> &'static str {
        "mysql"
    }

    fn classifier(&self) -> &dyn ConflictClassifier {
        &MySqlConflicts
    }

    fn retry_policy(&self, _mode: TxMode) -> RetryPolicy {
        self.policy
    }

    async fn begin(&self, _mode: TxMode) -> Result<Self::Conn> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.commit().await?)
    }

    async fn rollback(&self, conn: Self::Conn) -> Result<()> {
        Ok(conn.rollback().await?)
    }
}
