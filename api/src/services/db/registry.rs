//! Active-transaction registry and executor resolution
//!
//! The transaction runner binds the connection of the current attempt into the
//! context under a private key. Domain code never holds a connection of its
//! own; it asks [`Executor::resolve`] (usually through `Store::executor`) and
//! gets either the bound transaction or the shared pool.
//!
//! ```ignore
//! store.rw_tx(&ctx, |ctx| {
//!     let store = store.clone();
//!     async move {
//!         let db = store.executor(&ctx);
//!         db.execute(
//!             sqlx::query("UPDATE accounts SET balance = balance - $1 WHERE id = $2")
//!                 .bind(amount)
//!                 .bind(from),
//!         )
//!         .await?;
//!         Ok(())
//!     }
//! })
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::{Query, QueryAs};
use sqlx::{Database, FromRow, MySql, Pool, Postgres, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use super::TxMode;
use crate::services::context::{Context, Key};
use crate::services::error::{Error, ErrorKind, Result};

/// Connection of one transaction attempt, shared between the runner and the
/// unit of work through the context.
///
/// The runner takes the connection back when the attempt ends. Any clone that
/// outlives the attempt finds the slot empty and fails instead of reaching a
/// connection that is no longer in a transaction.
pub struct TxHandle<C> {
    inner: Arc<Slot<C>>,
}

struct Slot<C> {
    conn: Mutex<Option<C>>,
    finished: AtomicBool,
    mode: TxMode,
    attempt: u32,
}

impl<C> Clone for TxHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + 'static> TxHandle<C> {
    pub(crate) fn new(conn: C, mode: TxMode, attempt: u32) -> Self {
        Self {
            inner: Arc::new(Slot {
                conn: Mutex::new(Some(conn)),
                finished: AtomicBool::new(false),
                mode,
                attempt,
            }),
        }
    }

    pub fn mode(&self) -> TxMode {
        self.inner.mode
    }

    /// Ordinal of the attempt this handle belongs to (1-based).
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// Whether the attempt this handle belongs to has ended.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Exclusive access to the connection while a statement runs.
    pub async fn lock(&self) -> Result<MappedMutexGuard<'_, C>> {
        let guard = self.inner.conn.lock().await;
        MutexGuard::try_map(guard, |conn| conn.as_mut()).map_err(|_| {
            Error::new(
                ErrorKind::Internal,
                "transaction already finished; its handle escaped the unit of work",
            )
        })
    }

    /// Take the connection out, ending the handle's usable life.
    pub(crate) async fn release(&self) -> Option<C> {
        let mut conn = self.inner.conn.lock().await;
        self.inner.finished.store(true, Ordering::Release);
        conn.take()
    }
}

struct ActiveTx<C>(PhantomData<fn() -> C>);

impl<C: Send + 'static> Key for ActiveTx<C> {
    type Value = TxHandle<C>;
}

/// Derive a context with `handle` as the active transaction for its connection type.
pub(crate) fn bind<C: Send + 'static>(ctx: &Context, handle: TxHandle<C>) -> Context {
    ctx.with_value::<ActiveTx<C>>(handle)
}

/// The transaction bound in `ctx` for connection type `C`, if any.
pub fn active<C: Send + 'static>(ctx: &Context) -> Option<&TxHandle<C>> {
    ctx.value::<ActiveTx<C>>()
}

/// Where a statement runs: the shared pool or the active transaction.
///
/// Every statement is raced against the context it was resolved from, so a
/// canceled request stops waiting on the database.
pub struct Executor<DB: Database> {
    ctx: Context,
    target: Target<DB>,
}

enum Target<DB: Database> {
    Pool(Pool<DB>),
    Tx(TxHandle<Transaction<'static, DB>>),
}

impl<DB: Database> Executor<DB> {
    /// The transaction bound in `ctx`, or `pool` when there is none.
    pub fn resolve(ctx: &Context, pool: &Pool<DB>) -> Self {
        let target = match active::<Transaction<'static, DB>>(ctx) {
            Some(handle) => Target::Tx(handle.clone()),
            None => Target::Pool(pool.clone()),
        };
        Self {
            ctx: ctx.clone(),
            target,
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self.target, Target::Tx(_))
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

/// Statement methods for one concrete database. The futures are boxed so they
/// are `Send` by signature, whatever the unit of work that awaits them.
macro_rules! impl_statements {
    ($db:ty, $args:ty, $row:ty) => {
        impl Executor<$db> {
            /// Run a statement and return its result (affected rows and friends).
            pub fn execute<'a, 'q: 'a>(
                &'a self,
                query: Query<'q, $db, $args>,
            ) -> BoxFuture<'a, Result<<$db as Database>::QueryResult>> {
                async move {
                    match &self.target {
                        Target::Pool(pool) => Ok(self.ctx.run(query.execute(pool)).await??),
                        Target::Tx(handle) => {
                            // Erase the guard to a `Send` trait object so the boxed future's
                            // `Send` proof does not trip over the guard's `T: 'a` bound.
                            let mut tx: Box<
                                dyn std::ops::DerefMut<Target = Transaction<'static, $db>> + Send + '_,
                            > = Box::new(self.ctx.run(handle.lock()).await??);
                            Ok(self.ctx.run(query.execute(&mut ***tx)).await??)
                        }
                    }
                }
                .boxed()
            }

            pub fn fetch_one<'a, 'q: 'a, O>(
                &'a self,
                query: QueryAs<'q, $db, O, $args>,
            ) -> BoxFuture<'a, Result<O>>
            where
                O: Send + Unpin + for<'r> FromRow<'r, $row> + 'a,
            {
                async move {
                    match &self.target {
                        Target::Pool(pool) => Ok(self.ctx.run(query.fetch_one(pool)).await??),
                        Target::Tx(handle) => {
                            // Erase the guard to a `Send` trait object so the boxed future's
                            // `Send` proof does not trip over the guard's `T: 'a` bound.
                            let mut tx: Box<
                                dyn std::ops::DerefMut<Target = Transaction<'static, $db>> + Send + '_,
                            > = Box::new(self.ctx.run(handle.lock()).await??);
                            Ok(self.ctx.run(query.fetch_one(&mut ***tx)).await??)
                        }
                    }
                }
                .boxed()
            }

            pub fn fetch_optional<'a, 'q: 'a, O>(
                &'a self,
                query: QueryAs<'q, $db, O, $args>,
            ) -> BoxFuture<'a, Result<Option<O>>>
            where
                O: Send + Unpin + for<'r> FromRow<'r, $row> + 'a,
            {
                async move {
                    match &self.target {
                        Target::Pool(pool) => {
                            Ok(self.ctx.run(query.fetch_optional(pool)).await??)
                        }
                        Target::Tx(handle) => {
                            // Erase the guard to a `Send` trait object so the boxed future's
                            // `Send` proof does not trip over the guard's `T: 'a` bound.
                            let mut tx: Box<
                                dyn std::ops::DerefMut<Target = Transaction<'static, $db>> + Send + '_,
                            > = Box::new(self.ctx.run(handle.lock()).await??);
                            Ok(self.ctx.run(query.fetch_optional(&mut ***tx)).await??)
                        }
                    }
                }
                .boxed()
            }

            pub fn fetch_all<'a, 'q: 'a, O>(
                &'a self,
                query: QueryAs<'q, $db, O, $args>,
            ) -> BoxFuture<'a, Result<Vec<O>>>
            where
                O: Send + Unpin + for<'r> FromRow<'r, $row> + 'a,
            {
                async move {
                    match &self.target {
                        Target::Pool(pool) => Ok(self.ctx.run(query.fetch_all(pool)).await??),
                        Target::Tx(handle) => {
                            // Erase the guard to a `Send` trait object so the boxed future's
                            // `Send` proof does not trip over the guard's `T: 'a` bound.
                            let mut tx: Box<
                                dyn std::ops::DerefMut<Target = Transaction<'static, $db>> + Send + '_,
                            > = Box::new(self.ctx.run(handle.lock()).await??);
                            Ok(self.ctx.run(query.fetch_all(&mut ***tx)).await??)
                        }
                    }
                }
                .boxed()
            }
        }

        impl Ping for Executor<$db> {
            fn ping(&self) -> BoxFuture<'_, Result<()>> {
                async move {
                    self.execute(sqlx::query("SELECT 1")).await?;
                    Ok(())
                }
                .boxed()
            }
        }
    };
}

impl_statements!(Postgres, PgArguments, PgRow);
impl_statements!(MySql, MySqlArguments, MySqlRow);

/// Cheapest round trip to the database behind an executor.
pub trait Ping {
    fn ping(&self) -> BoxFuture<'_, Result<()>>;
}
