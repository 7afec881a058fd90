//! The thin entry point into this crate: a handle to a deployment (any [`Topology`]
//! implementation) that knows how to mint and end [`ClientSession`]s and run the `with_transaction`
//! convenience wrapper. Just the session/transaction surface this crate covers — no CRUD helpers,
//! no URI parsing, no connection pool of its own.

use std::{future::Future, sync::Arc, time::Duration};

use crate::{
    error::{ErrorKind, Result},
    options::{SessionOptions, TransactionOptions},
    session::{ClientSession, ServerSessionPool},
    topology::{SessionKind, Topology},
};

/// The overall wall-clock budget for `with_transaction`.
const WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

struct ClientInner {
    topology: Arc<dyn Topology>,
    session_pool: Arc<ServerSessionPool>,
    logical_session_timeout: Option<Duration>,
}

/// A cheaply-cloneable handle to a MongoDB deployment, backed by an application-supplied
/// [`Topology`]. This is the root object applications construct to start sessions and run
/// transactions against the deployment `topology` represents.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Wraps `topology` in a `Client`, giving it its own session pool.
    ///
    /// `logical_session_timeout` should reflect the deployment's `logicalSessionTimeoutMinutes`;
    /// pass `None` if unknown, which disables idle-session eviction in the pool.
    pub fn new(topology: Arc<dyn Topology>, logical_session_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                topology,
                session_pool: Arc::new(ServerSessionPool::new()),
                logical_session_timeout,
            }),
        }
    }

    /// Starts a new explicit session. The caller is responsible for calling
    /// [`ClientSession::end_session`] (or letting it drop) when done.
    pub async fn start_session(&self, options: Option<SessionOptions>) -> Result<ClientSession> {
        tracing::debug!("starting explicit session");
        ClientSession::checkout(
            self.inner.topology.clone(),
            self.inner.session_pool.clone(),
            self.inner.logical_session_timeout,
            SessionKind::Write,
            false,
            options,
        )
        .await
    }

    /// Starts an implicit session for a single operation, reusing `existing` if the caller
    /// already has one (implicit-session checkout reuses a caller-supplied session if present).
    pub async fn start_implicit_session(
        &self,
        existing: Option<ClientSession>,
        kind: SessionKind,
    ) -> Result<ClientSession> {
        if let Some(session) = existing {
            return Ok(session);
        }
        ClientSession::checkout(
            self.inner.topology.clone(),
            self.inner.session_pool.clone(),
            self.inner.logical_session_timeout,
            kind,
            true,
            None,
        )
        .await
    }

    /// Starts a transaction, runs `callback`, and commits or aborts it depending on the outcome,
    /// Unlike MongoDB's own convenient-transactions behavior, this does **not** retry on
    /// `TransientTransactionError`/`UnknownTransactionCommitResult` — a deliberate limitation;
    /// callers that need that behavior should inspect the returned error's labels and retry the
    /// whole call themselves.
    ///
    /// The entire operation — starting the transaction, the callback, and the final commit or
    /// abort — is bounded by a 120-second deadline. Exceeding it returns
    /// [`crate::error::ErrorKind::Timeout`].
    pub async fn with_transaction<F, Fut, R>(
        &self,
        options: Option<TransactionOptions>,
        mut callback: F,
    ) -> Result<R>
    where
        F: FnMut(&mut ClientSession) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut session = self.start_session(None).await?;

        let run = async {
            session.start_transaction(options)?;

            let outcome = callback(&mut session).await;
            let result = match outcome {
                Ok(value) => value,
                Err(e) => {
                    if session.in_transaction() {
                        let _ = session.abort_transaction().await;
                    }
                    return Err(ErrorKind::Callback(Arc::new(e)).into());
                }
            };

            if session.in_transaction() {
                session.commit_transaction().await?;
            }
            Ok(result)
        };

        let outcome = match tokio::time::timeout(WITH_TRANSACTION_TIMEOUT, run).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    session_id = ?session.id(),
                    timeout_secs = WITH_TRANSACTION_TIMEOUT.as_secs(),
                    "with_transaction exceeded its deadline"
                );
                if session.in_transaction() {
                    let _ = session.abort_transaction().await;
                }
                Err(ErrorKind::Timeout {
                    message: "transaction did not complete within 120s".into(),
                }
                .into())
            }
        };

        session.end_session().await;
        outcome
    }
}
