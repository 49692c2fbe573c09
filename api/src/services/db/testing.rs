//! In-memory backend that records every transaction primitive it is asked for.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use sqlx::error::DatabaseError;

use super::classify::ConflictClassifier;
use super::{Backend, RetryPolicy, TxMode};
use crate::services::error::{Error, ErrorKind, Result};

#[derive(Debug)]
pub(crate) struct ScriptedConn {
    pub id: u32,
    pub statements: Vec<&'static str>,
}

#[derive(Default)]
pub(crate) struct Journal {
    begins: AtomicU32,
    commits: AtomicU32,
    rollbacks: AtomicU32,
    restarts: AtomicU32,
    committed: Mutex<Vec<&'static str>>,
}

impl Journal {
    pub fn begins(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u32 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn committed_statements(&self) -> Vec<&'static str> {
        self.committed.lock().unwrap().clone()
    }
}

/// Retries anything tagged `Conflict`; the default for scripted errors that
/// carry no driver error.
struct ConflictKind;

impl ConflictClassifier for ConflictKind {
    fn is_conflict(&self, _err: &(dyn DatabaseError + 'static)) -> bool {
        false
    }

    fn is_retryable(&self, err: &Error) -> bool {
        err.kind() == ErrorKind::Conflict
    }
}

pub(crate) struct ScriptedBackend {
    journal: Journal,
    policy: RetryPolicy,
    classifier: Box<dyn ConflictClassifier>,
    read_only: bool,
    fail_commits: bool,
    fail_rollbacks: bool,
    max_restarts: u32,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            journal: Journal::default(),
            policy: RetryPolicy::new(4, Duration::from_millis(10)).unwrap(),
            classifier: Box::new(ConflictKind),
            read_only: false,
            fail_commits: false,
            fail_rollbacks: false,
            max_restarts: 0,
        }
    }

    pub fn with_classifier(mut self, classifier: impl ConflictClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn with_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn failing_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    pub fn failing_rollbacks(mut self) -> Self {
        self.fail_rollbacks = true;
        self
    }

    pub fn with_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl Backend for ScriptedBackend {
    type Conn = ScriptedConn;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_read_only(&self) -> bool {
        self.read_only
    }

    fn classifier(&self) -> &dyn ConflictClassifier {
        &*self.classifier
    }

    fn retry_policy(&self, _mode: TxMode) -> RetryPolicy {
        self.policy
    }

    async fn begin(&self, _mode: TxMode) -> Result<ScriptedConn> {
        let id = self.journal.begins.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ScriptedConn {
            id,
            statements: Vec::new(),
        })
    }

    async fn commit(&self, conn: ScriptedConn) -> Result<()> {
        self.journal.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commits {
            return Err(Error::new(ErrorKind::Internal, "connection reset during COMMIT"));
        }
        self.journal.committed.lock().unwrap().extend(conn.statements);
        Ok(())
    }

    async fn rollback(&self, _conn: ScriptedConn) -> Result<()> {
        self.journal.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.fail_rollbacks {
            return Err(Error::new(ErrorKind::Internal, "connection reset during ROLLBACK"));
        }
        Ok(())
    }

    async fn restart(
        &self,
        _mode: TxMode,
        conn: &mut ScriptedConn,
        err: &Error,
        restarts: u32,
    ) -> Result<bool> {
        if restarts >= self.max_restarts || !err.is(ErrorKind::Conflict) {
            return Ok(false);
        }
        conn.statements.clear();
        self.journal.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn restart_backoff(&self, restarts: u32) -> Duration {
        self.policy.backoff(restarts)
    }
}
