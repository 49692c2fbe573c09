//! One transaction attempt: begin, run the unit of work, commit or roll back

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures::FutureExt;
use log::{debug, error, warn};

use super::registry::{self, TxHandle};
use super::{Backend, TxMode};
use crate::services::context::Context;
use crate::services::error::{Error, ErrorKind, Result};

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
    /// The unit of work panicked; the transaction was rolled back and the panic
    /// resumed.
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Committed => write!(f, "committed"),
            Outcome::RolledBack => write!(f, "rolled back"),
            Outcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Run `work` inside a fresh transaction on `backend`.
///
/// Exactly one of commit or rollback happens per call:
/// - `work` succeeds: commit. A failed commit is returned as `Internal`, or as
///   `Conflict` when the driver reported a conflict at commit time.
/// - `work` fails: roll back and return its error untouched. A failed rollback
///   is returned as `Internal` instead.
/// - `work` panics: roll back, then resume the same panic.
///
/// `work` gets a context with the transaction bound. When the call returns the
/// connection has been taken back, so handles that escaped are unusable.
pub async fn run_tx<B, F, Fut, T>(
    ctx: &Context,
    backend: &B,
    mode: TxMode,
    attempt: u32,
    work: &F,
) -> Result<T>
where
    B: Backend,
    F: Fn(Context) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let conn = ctx.run(backend.begin(mode)).await??;
    let handle = TxHandle::new(conn, mode, attempt);
    let tx_ctx = registry::bind(ctx, handle.clone());
    debug!("{}: began {} transaction, attempt {}", backend.name(), mode, attempt);

    let mut restarts = 0;
    let result = loop {
        let result = match AssertUnwindSafe(async { work(tx_ctx.clone()).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                abort(backend, &handle).await;
                debug!("{}: attempt {} {}", backend.name(), attempt, Outcome::Aborted);
                panic::resume_unwind(panic);
            }
        };

        let result = match result {
            Ok(value) => prepare_commit(backend, mode, &handle).await.map(|()| value),
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(value) => break Ok(value),
            Err(err) => err,
        };
        if ctx.is_done() {
            break Err(err);
        }
        match restart(backend, mode, &handle, &err, restarts).await {
            Ok(true) => {
                restarts += 1;
                let delay = backend.restart_backoff(restarts);
                debug!(
                    "{}: restarting attempt {} in place ({}) after {:?}: {}",
                    backend.name(),
                    attempt,
                    restarts,
                    delay,
                    err
                );
                if !delay.is_zero() {
                    tokio::select! {
                        reason = ctx.done() => break Err(Error::canceled_during(reason, err)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            Ok(false) => break Err(err),
            Err(restart_err) => break Err(restart_err),
        }
    };

    let Some(conn) = handle.release().await else {
        return Err(Error::new(
            ErrorKind::Internal,
            "transaction connection released before the attempt finished",
        ));
    };

    match result {
        Ok(value) => match backend.commit(conn).await {
            Ok(()) => {
                debug!("{}: attempt {} {}", backend.name(), attempt, Outcome::Committed);
                Ok(value)
            }
            Err(err) => {
                error!("{}: commit failed on attempt {}: {}", backend.name(), attempt, err);
                let kind = if err.is(ErrorKind::Conflict) {
                    ErrorKind::Conflict
                } else {
                    ErrorKind::Internal
                };
                Err(Error::with_source(kind, "commit failed", err))
            }
        },
        Err(err) => match backend.rollback(conn).await {
            Ok(()) => {
                debug!(
                    "{}: attempt {} {}: {}",
                    backend.name(),
                    attempt,
                    Outcome::RolledBack,
                    err
                );
                Err(err)
            }
            Err(rollback_err) => {
                warn!(
                    "{}: rollback failed on attempt {} after {}: {}",
                    backend.name(),
                    attempt,
                    err,
                    rollback_err
                );
                Err(Error::internal(
                    format!("rollback failed after: {}", err),
                    rollback_err,
                ))
            }
        },
    }
}

async fn prepare_commit<B: Backend>(
    backend: &B,
    mode: TxMode,
    handle: &TxHandle<B::Conn>,
) -> Result<()> {
    let mut conn = handle.lock().await?;
    backend.before_commit(mode, &mut *conn).await
}

async fn restart<B: Backend>(
    backend: &B,
    mode: TxMode,
    handle: &TxHandle<B::Conn>,
    err: &Error,
    restarts: u32,
) -> Result<bool> {
    let mut conn = handle.lock().await?;
    backend
        .restart(mode, &mut *conn, err, restarts)
        .await
        .map_err(|restart_err| {
            Error::internal(format!("restart failed after: {}", err), restart_err)
        })
}

/// Best-effort rollback while a panic is in flight.
async fn abort<B: Backend>(backend: &B, handle: &TxHandle<B::Conn>) {
    if let Some(conn) = handle.release().await {
        if let Err(err) = backend.rollback(conn).await {
            warn!("{}: rollback after panic failed: {}", backend.name(), err);
        }
    }
}
