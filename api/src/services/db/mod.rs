//! Transactional execution core
//!
//! Business logic runs inside a database transaction through [`Store::rw_tx`]
//! (or [`Store::ro_tx`] where the backend has read-only transactions). The
//! active transaction travels implicitly in the [`Context`]; domain functions
//! ask [`Store::executor`] for somewhere to run their statements and get the
//! bound transaction when there is one, the shared pool otherwise.
//!
//! Transient conflicts (deadlocks, serialization failures, lock timeouts) are
//! retried with linear backoff. What counts as a conflict, and whether the local
//! retry loop is used at all, is decided by each [`Backend`] adapter.
//!
//! # Usage Pattern
//!
//! ```ignore
//! pub async fn rename_user(ctx: &Context, store: &Store<PostgresBackend>, id: i64, name: &str)
//!     -> Result<()>
//! {
//!     store
//!         .rw_tx(ctx, |ctx| {
//!             let store = store.clone();
//!             let name = name.to_string();
//!             async move {
//!                 let db = store.executor(&ctx);
//!                 users::lock_user(&db, id).await?;
//!                 users::set_username(&db, id, &name).await
//!             }
//!         })
//!         .await
//! }
//! ```
//!
//! Calling `rw_tx` again inside the unit of work joins the transaction that is
//! already active instead of opening a nested one.

pub mod classify;
pub mod cockroach;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod retry;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use sqlx::{Database, Pool, Postgres, Transaction};

use crate::services::context::Context;
use crate::services::error::{Error, Result};
use classify::ConflictClassifier;
pub use cockroach::CockroachBackend;
pub use mysql::MySqlBackend;
pub use postgres::{IsolationLevel, PostgresBackend};
pub use registry::{Executor, Ping, TxHandle};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadWrite,
    /// Snapshot-consistent, no writes.
    ReadOnly,
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxMode::ReadWrite => write!(f, "read-write"),
            TxMode::ReadOnly => write!(f, "read-only"),
        }
    }
}

/// Transaction primitives of one database backend.
///
/// `begin` is raced against the caller's context by the runner. `commit` and
/// `rollback` always run to completion. If `commit` fails the adapter must leave
/// the transaction rolled back; sqlx does this when a `Transaction` is dropped.
pub trait Backend: Send + Sync + 'static {
    /// Connection bound to one transaction attempt.
    type Conn: Send + 'static;

    fn name(&self) -> &'static str;

    fn supports_read_only(&self) -> bool {
        false
    }

    fn classifier(&self) -> &dyn ConflictClassifier;

    fn retry_policy(&self, mode: TxMode) -> RetryPolicy;

    fn begin(&self, mode: TxMode) -> impl Future<Output = Result<Self::Conn>> + Send;

    fn commit(&self, conn: Self::Conn) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&self, conn: Self::Conn) -> impl Future<Output = Result<()>> + Send;

    /// Runs after the unit of work succeeded and before `commit`. An error here
    /// is handled like an error from the unit of work.
    fn before_commit(
        &self,
        _mode: TxMode,
        _conn: &mut Self::Conn,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Prepare the same transaction for another run of the unit of work after
    /// it failed with `err`. `Ok(true)` means the runner should run it again;
    /// `Ok(false)` ends the attempt with `err`.
    fn restart(
        &self,
        _mode: TxMode,
        _conn: &mut Self::Conn,
        _err: &Error,
        _restarts: u32,
    ) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(false) }
    }

    /// Pause before the unit of work runs again after in-place restart number
    /// `restarts` (1-based).
    fn restart_backoff(&self, _restarts: u32) -> Duration {
        Duration::ZERO
    }
}

/// Backends whose non-transactional default is a sqlx pool.
pub trait PoolSource {
    type Db: Database;

    fn pool(&self) -> &Pool<Self::Db>;
}

/// Backends speaking the Postgres wire protocol whose transactions are plain
/// sqlx transactions, so [`Executor`] finds them in the context.
pub trait PgBackend:
    Backend<Conn = Transaction<'static, Postgres>> + PoolSource<Db = Postgres>
{
}

impl<B> PgBackend for B where
    B: Backend<Conn = Transaction<'static, Postgres>> + PoolSource<Db = Postgres>
{
}

/// Entry point for transactional business logic.
pub struct Store<B> {
    backend: Arc<B>,
}

impl<B> Clone for Store<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `work` in a read-write transaction, retrying conflicts.
    pub async fn rw_tx<F, Fut, T>(&self, ctx: &Context, work: F) -> Result<T>
    where
        F: Fn(Context) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.transact(ctx, TxMode::ReadWrite, work).await
    }

    /// Run `work` in a read-only, snapshot-consistent transaction.
    ///
    /// Asking a backend without read-only transactions for one is a programming
    /// error and fails with `Misconfigured` before anything is started.
    pub async fn ro_tx<F, Fut, T>(&self, ctx: &Context, work: F) -> Result<T>
    where
        F: Fn(Context) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if !self.backend.supports_read_only() {
            return Err(Error::misconfigured(format!(
                "{} backend has no read-only transactions",
                self.backend.name()
            )));
        }
        self.transact(ctx, TxMode::ReadOnly, work).await
    }

    async fn transact<F, Fut, T>(&self, ctx: &Context, mode: TxMode, work: F) -> Result<T>
    where
        F: Fn(Context) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if let Some(active) = registry::active::<B::Conn>(ctx) {
            if active.is_finished() {
                return Err(Error::misconfigured(
                    "context outlived its transaction; derive from the request context instead",
                ));
            }
            if active.mode() == TxMode::ReadOnly && mode == TxMode::ReadWrite {
                return Err(Error::misconfigured(
                    "read-write transaction requested inside a read-only one",
                ));
            }
            debug!(
                "{}: joining active {} transaction (attempt {})",
                self.backend.name(),
                active.mode(),
                active.attempt()
            );
            return work(ctx.clone()).await;
        }

        let backend: &B = &self.backend;
        let work = &work;
        let policy = backend.retry_policy(mode);
        retry::with_retry(ctx, &policy, backend.classifier(), move |attempt| {
            runner::run_tx(ctx, backend, mode, attempt, work)
        })
        .await
    }
}

impl<B: Backend + PoolSource> Store<B> {
    /// The executor for statements issued under `ctx`.
    pub fn executor(&self, ctx: &Context) -> Executor<B::Db> {
        Executor::resolve(ctx, self.backend.pool())
    }

    pub fn pool(&self) -> &Pool<B::Db> {
        self.backend.pool()
    }
}
