//! Request-scoped execution context
//!
//! A [`Context`] carries a cancellation signal, an optional deadline and typed
//! attachments through every call boundary. It never changes once built: each
//! `with_*` call returns a derived carrier and leaves the receiver untouched, so
//! a carrier can be cloned into concurrent work without coordination.
//!
//! Attachments are keyed by types implementing [`Key`], never by strings. A
//! module that keeps its key type private is the only one able to read or
//! shadow that attachment.
//!
//! ```ignore
//! struct RequestId;
//! impl Key for RequestId {
//!     type Value = u64;
//! }
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! let ctx = ctx.with_value::<RequestId>(42);
//! assert_eq!(ctx.value::<RequestId>(), Some(&42));
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::Error;

/// Identity of a context attachment.
pub trait Key: 'static {
    type Value: Send + Sync + 'static;
}

/// Why a context stopped being live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    Canceled,
    DeadlineExceeded,
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cancellation::Canceled => write!(f, "context canceled"),
            Cancellation::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    parent: Option<Context>,
    token: CancellationToken,
    deadline: Option<Instant>,
    value: Option<(TypeId, Arc<dyn Any + Send + Sync>)>,
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Context {
    /// Root context: never canceled, no deadline, no attachments.
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: None,
                token: CancellationToken::new(),
                deadline: None,
                value: None,
            }),
        }
    }

    fn derive(&self, token: CancellationToken, deadline: Option<Instant>) -> Inner {
        Inner {
            parent: Some(self.clone()),
            token,
            deadline,
            value: None,
        }
    }

    /// Derive a context that can be canceled independently of its parent.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let token = self.inner.token.child_token();
        let handle = CancelHandle {
            token: token.clone(),
        };
        let ctx = Context {
            inner: Arc::new(self.derive(token, self.inner.deadline)),
        };
        (ctx, handle)
    }

    /// Derive a context that expires at `deadline`, or at the parent's deadline
    /// if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.inner.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Context {
            inner: Arc::new(self.derive(self.inner.token.child_token(), Some(deadline))),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context carrying `value` under `K`. A nearer attachment with the
    /// same key shadows outer ones.
    pub fn with_value<K: Key>(&self, value: K::Value) -> Context {
        let mut inner = self.derive(self.inner.token.clone(), self.inner.deadline);
        inner.value = Some((TypeId::of::<K>(), Arc::new(value)));
        Context {
            inner: Arc::new(inner),
        }
    }

    pub fn value<K: Key>(&self) -> Option<&K::Value> {
        let id = TypeId::of::<K>();
        let mut current = Some(self);
        while let Some(ctx) = current {
            if let Some((key, value)) = &ctx.inner.value {
                if *key == id {
                    return value.downcast_ref::<K::Value>();
                }
            }
            current = ctx.inner.parent.as_ref();
        }
        None
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// `Some` once the context has been canceled or its deadline has passed.
    pub fn err(&self) -> Option<Cancellation> {
        if self.inner.token.is_cancelled() {
            return Some(Cancellation::Canceled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Cancellation::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is canceled or its deadline passes.
    pub async fn done(&self) -> Cancellation {
        match self.inner.deadline {
            Some(deadline) => tokio::select! {
                _ = self.inner.token.cancelled() => Cancellation::Canceled,
                _ = tokio::time::sleep_until(deadline) => Cancellation::DeadlineExceeded,
            },
            None => {
                self.inner.token.cancelled().await;
                Cancellation::Canceled
            }
        }
    }

    /// Drive `fut` until it completes or the context is done, whichever is first.
    /// The future is dropped if the context wins.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Error> {
        if let Some(reason) = self.err() {
            return Err(Error::canceled(reason));
        }
        tokio::select! {
            biased;
            reason = self.done() => Err(Error::canceled(reason)),
            output = fut => Ok(output),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::ErrorKind;

    struct Tenant;
    impl Key for Tenant {
        type Value = String;
    }

    struct Attempt;
    impl Key for Attempt {
        type Value = u32;
    }

    #[test]
    fn test_values_are_scoped_to_derivations() {
        let root = Context::background();
        let acme = root.with_value::<Tenant>("acme".to_string());
        let nested = acme.with_value::<Attempt>(2);
        let shadowed = nested.with_value::<Tenant>("globex".to_string());

        assert_eq!(root.value::<Tenant>(), None);
        assert_eq!(acme.value::<Tenant>().map(String::as_str), Some("acme"));
        assert_eq!(nested.value::<Tenant>().map(String::as_str), Some("acme"));
        assert_eq!(nested.value::<Attempt>(), Some(&2));
        assert_eq!(shadowed.value::<Tenant>().map(String::as_str), Some("globex"));
        assert_eq!(acme.value::<Attempt>(), None);
    }

    #[test]
    fn test_cancel_flows_to_children_only() {
        let (parent, cancel_parent) = Context::background().with_cancel();
        let (child, cancel_child) = parent.with_cancel();
        let sibling = parent.with_value::<Attempt>(1);

        cancel_child.cancel();
        assert_eq!(child.err(), Some(Cancellation::Canceled));
        assert_eq!(parent.err(), None);
        assert_eq!(sibling.err(), None);

        cancel_parent.cancel();
        assert_eq!(parent.err(), Some(Cancellation::Canceled));
        assert_eq!(sibling.err(), Some(Cancellation::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earliest_deadline_wins() {
        let outer = Context::background().with_timeout(Duration::from_millis(50));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(inner.deadline(), outer.deadline());

        assert_eq!(inner.done().await, Cancellation::DeadlineExceeded);
        assert_eq!(inner.err(), Some(Cancellation::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = ctx
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);

        let live = Context::background();
        assert_eq!(live.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_run_refuses_canceled_context() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = ctx.run(async { 1 }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
    }
}
