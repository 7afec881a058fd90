//! The client session & transaction state machine: one instance per active logical session,
//! long-lived and single-owner. Holds a borrowed [`ServerSession`], a pinned connection, and the
//! transaction state described by the five-state transition table below. Scoped to the fields
//! this crate's data model needs: no cluster-time gossip, no snapshot reads, and a connection
//! pinned for the session's whole life rather than only during sharded transactions (see
//! `DESIGN.md` for why a separate sharded-transaction pin isn't carried here).

pub(crate) mod decorator;
pub(crate) mod pool;
pub(crate) mod transaction_ops;

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    bson::{Document, Timestamp},
    concern::WriteConcern,
    error::{ErrorKind, Result},
    options::{SessionOptions, TransactionOptions},
    topology::{Checkout, ConnectionHandle, SessionKind, Topology},
};

pub(crate) use pool::{ServerSession, ServerSessionPool};

/// How many times a session checkout will retry after a `Checkout::RetryLater` response before
/// giving up, at roughly one second between attempts (mirrors the ~30s default server selection
/// timeout real drivers use).
const MAX_CHECKOUT_RETRIES: u32 = 30;

/// The state of a transaction on a [`ClientSession`].
#[derive(Clone, Debug, Default, PartialEq)]
pub enum TransactionState {
    /// No transaction has been started, or the session has never started one.
    #[default]
    None,
    /// `start_transaction` has been called; no command has been sent under it yet.
    Starting,
    /// At least one command has been sent under this transaction.
    InProgress,
    /// The transaction was committed. `data_committed` distinguishes a vacuous commit (no
    /// `commitTransaction` command was ever sent, because no operation advanced the transaction
    /// past `Starting`) from one that actually ran the command, which matters when the caller
    /// calls `commit_transaction` again.
    Committed { data_committed: bool },
    /// The transaction was aborted.
    Aborted,
}

#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) recovery_token: Option<Document>,
}

impl Transaction {
    fn start(&mut self, options: Option<TransactionOptions>) {
        self.state = TransactionState::Starting;
        self.options = options;
        self.recovery_token = None;
    }

    fn commit(&mut self, data_committed: bool) {
        self.state = TransactionState::Committed { data_committed };
    }

    fn abort(&mut self) {
        self.state = TransactionState::Aborted;
        self.options = None;
    }
}

/// A MongoDB client session: the unit that coordinates causal consistency and, optionally, a
/// multi-statement transaction. Create one with [`crate::Client::start_session`].
///
/// Not `Sync`; a session is meant to be driven by one caller at a time — it behaves like an
/// independent, long-lived actor whose mailbox is realized here as ordinary `&mut self`
/// borrowing, with the borrow checker enforcing single-writer access.
pub struct ClientSession {
    topology: Arc<dyn Topology>,
    session_pool: Arc<ServerSessionPool>,
    logical_session_timeout: Option<Duration>,
    server_session: Option<ServerSession>,
    connection: ConnectionHandle,
    wire_version: i32,
    is_implicit: bool,
    options: Option<SessionOptions>,
    causal_consistency: bool,
    operation_time: Option<Timestamp>,
    pub(crate) transaction: Transaction,
    ended: bool,
}

impl fmt::Debug for ClientSession {
    /// `Topology` carries no `Debug` bound (it's the one trait a full driver implements against
    /// its own connection pool), so `topology` is rendered as a placeholder rather than derived.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("topology", &"<dyn Topology>")
            .field("session_pool", &self.session_pool)
            .field("logical_session_timeout", &self.logical_session_timeout)
            .field("server_session", &self.server_session)
            .field("connection", &self.connection)
            .field("wire_version", &self.wire_version)
            .field("is_implicit", &self.is_implicit)
            .field("options", &self.options)
            .field("causal_consistency", &self.causal_consistency)
            .field("operation_time", &self.operation_time)
            .field("transaction", &self.transaction)
            .field("ended", &self.ended)
            .finish()
    }
}

impl ClientSession {
    /// Checks out a connection and a [`ServerSession`] from the registry.
    pub(crate) async fn checkout(
        topology: Arc<dyn Topology>,
        session_pool: Arc<ServerSessionPool>,
        logical_session_timeout: Option<Duration>,
        kind: SessionKind,
        is_implicit: bool,
        options: Option<SessionOptions>,
    ) -> Result<Self> {
        if let Some(ref opts) = options {
            opts.validate()?;
        }
        let causal_consistency = SessionOptions::resolved_causal_consistency(options.as_ref(), is_implicit);

        let mut attempts = 0;
        let (connection, wire_version) = loop {
            match topology.checkout_session(kind).await? {
                Checkout::Ready { connection, wire_version } => break (connection, wire_version),
                Checkout::RetryLater { reason } => {
                    attempts += 1;
                    if attempts >= MAX_CHECKOUT_RETRIES {
                        return Err(ErrorKind::CheckoutRetryable { reason }.into());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let server_session = session_pool.check_out(logical_session_timeout).await;

        Ok(Self {
            topology,
            session_pool,
            logical_session_timeout,
            server_session: Some(server_session),
            connection,
            wire_version,
            is_implicit,
            options,
            causal_consistency,
            operation_time: None,
            transaction: Transaction::default(),
            ended: false,
        })
    }

    /// The server-assigned `lsid` document for this session.
    pub fn id(&self) -> &Document {
        self.server_session
            .as_ref()
            .expect("session used after being ended")
            .id()
    }

    /// Whether this session was created implicitly around a single operation.
    pub fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether reads on this session request `afterClusterTime` consistency.
    pub fn causal_consistency(&self) -> bool {
        self.causal_consistency
    }

    /// The highest `operationTime` observed through this session so far.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// The connection pinned to this session at checkout. Immutable after creation.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// The current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state.clone()
    }

    /// Whether a transaction is currently starting or in progress.
    pub fn in_transaction(&self) -> bool {
        matches!(
            self.transaction.state,
            TransactionState::Starting | TransactionState::InProgress
        )
    }

    /// Advances `operation_time` to `ts` if it is strictly later than the stored value. A no-op
    /// for an equal or earlier timestamp.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        if self.operation_time.map(|current| ts > current).unwrap_or(true) {
            self.operation_time = Some(ts);
        }
    }

    /// Advances `operation_time` from a command reply's `operationTime` field, but only if
    /// `write_concern` (the concern the command that produced `reply` used, if any) is
    /// acknowledged — an unacknowledged write's reported operation time is not reliable for
    /// causal-consistency purposes.
    pub fn update_from_reply(&mut self, reply: &Document, write_concern: Option<&WriteConcern>) {
        let acknowledged = write_concern.map(WriteConcern::is_acknowledged).unwrap_or(true);
        if !acknowledged {
            return;
        }
        if let Ok(ts) = reply.get_timestamp("operationTime") {
            self.advance_operation_time(ts);
        }
    }

    /// Decorates `command` in place with this session's metadata. A no-op if the session's
    /// connection negotiated a wire version below 6.
    pub fn bind_command(&mut self, command: &mut Document) -> Result<()> {
        self.ensure_not_ended()?;
        let server_session = self.server_session.as_ref().expect("checked above");
        let lsid = server_session.id().clone();
        let fields = decorator::SessionFields {
            lsid: &lsid,
            txn_number: server_session.txn_number(),
            causal_consistency: self.causal_consistency,
            operation_time: self.operation_time,
            wire_version: self.wire_version,
        };
        decorator::bind_session(&mut self.transaction, &fields, command);
        Ok(())
    }

    /// Starts a new transaction. Allowed from `None`, `Committed`, and `Aborted`; rejected
    /// otherwise. No network command is sent — the first `bind_command` call after this one
    /// marks the actual transition to `InProgress` and attaches `startTransaction: true`.
    pub fn start_transaction(&mut self, options: Option<TransactionOptions>) -> Result<()> {
        self.ensure_not_ended()?;
        if self.wire_version < 6 {
            return Err(ErrorKind::NoSessionSupport.into());
        }
        if self.in_transaction() {
            return Err(ErrorKind::State {
                message: "transaction already in progress".into(),
            }
            .into());
        }

        let mut resolved = options.unwrap_or_default();
        if let Some(defaults) = self
            .options
            .as_ref()
            .and_then(|o| o.default_transaction_options.as_ref())
        {
            resolved.merge_defaults(defaults);
        }
        resolved.validate()?;

        let txn_number = self
            .server_session
            .as_mut()
            .expect("checked above")
            .increment_txn_number();
        self.transaction.start(Some(resolved));
        tracing::debug!(
            session_id = ?self.id(),
            txn_number,
            "starting transaction"
        );
        Ok(())
    }

    /// Commits the active transaction. A network failure still transitions the state to
    /// `Committed` — the caller must consult the returned error to learn whether the commit
    /// actually landed (see `DESIGN.md`'s note on this open question).
    pub async fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_not_ended()?;
        match self.transaction.state {
            TransactionState::None => {
                return Err(ErrorKind::State {
                    message: "no transaction started".into(),
                }
                .into());
            }
            TransactionState::Aborted => {
                return Err(ErrorKind::State {
                    message: "cannot call commit_transaction after calling abort_transaction".into(),
                }
                .into());
            }
            TransactionState::Starting => {
                self.transaction.commit(false);
                return Ok(());
            }
            TransactionState::Committed { data_committed: false } => return Ok(()),
            TransactionState::InProgress | TransactionState::Committed { data_committed: true } => {}
        }

        let retrying = matches!(self.transaction.state, TransactionState::Committed { .. });
        let mut write_concern = self
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone());
        if retrying {
            write_concern = Some(transaction_ops::majority_commit_write_concern(write_concern.as_ref()));
        }
        let max_commit_time = self.transaction.options.as_ref().and_then(|o| o.max_commit_time);
        let recovery_token = self.transaction.recovery_token.clone();

        self.transaction.commit(true);

        let server_session = self.server_session.as_ref().expect("checked above");
        let lsid = server_session.id().clone();
        let txn_number = server_session.txn_number();

        let fields = transaction_ops::TransactionCommandFields {
            lsid: &lsid,
            txn_number,
            write_concern: write_concern.as_ref(),
            recovery_token: recovery_token.as_ref(),
        };
        let body = transaction_ops::build_commit_command(&fields, max_commit_time)?;

        tracing::debug!(?lsid, txn_number, retrying, "sending commitTransaction");

        match self.topology.exec_command(&self.connection, "admin", body).await {
            Ok(reply) => {
                if let Ok(ts) = reply.get_timestamp("operationTime") {
                    self.advance_operation_time(ts);
                }
                match transaction_ops::interpret_reply(&reply) {
                    Ok(token) => {
                        if token.is_some() {
                            self.transaction.recovery_token = token;
                        }
                        tracing::debug!(?lsid, txn_number, "commitTransaction succeeded");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(?lsid, txn_number, error = %e, "commitTransaction reply reported failure");
                        Err(e.maybe_tag_unknown_commit_result())
                    }
                }
            }
            Err(e) => {
                self.mark_dirty();
                tracing::warn!(?lsid, txn_number, error = %e, "commitTransaction failed");
                Err(e.maybe_tag_unknown_commit_result())
            }
        }
    }

    /// Aborts the active transaction. Any error from the `abortTransaction` command itself is
    /// swallowed: abort must never mask the failure the caller is already handling.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        self.ensure_not_ended()?;
        match self.transaction.state {
            TransactionState::None => {
                return Err(ErrorKind::State {
                    message: "no transaction started".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                return Err(ErrorKind::State {
                    message: "cannot call abort_transaction after calling commit_transaction".into(),
                }
                .into());
            }
            TransactionState::Aborted => {
                return Err(ErrorKind::State {
                    message: "cannot call abort_transaction twice".into(),
                }
                .into());
            }
            TransactionState::Starting => {
                self.transaction.abort();
                return Ok(());
            }
            TransactionState::InProgress => {}
        }

        let write_concern = self
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone());
        let recovery_token = self.transaction.recovery_token.clone();
        let server_session = self.server_session.as_ref().expect("checked above");
        let lsid = server_session.id().clone();
        let txn_number = server_session.txn_number();

        self.transaction.abort();

        let fields = transaction_ops::TransactionCommandFields {
            lsid: &lsid,
            txn_number,
            write_concern: write_concern.as_ref(),
            recovery_token: recovery_token.as_ref(),
        };
        let body = transaction_ops::build_abort_command(&fields)?;

        tracing::debug!(?lsid, txn_number, "sending abortTransaction");

        match self.topology.exec_command(&self.connection, "admin", body).await {
            Ok(reply) => {
                if let Ok(ts) = reply.get_timestamp("operationTime") {
                    self.advance_operation_time(ts);
                }
                let _ = transaction_ops::interpret_reply(&reply);
            }
            Err(e) => {
                tracing::warn!(?lsid, txn_number, error = %e, "abortTransaction failed, marking session dirty");
                self.mark_dirty();
            }
        }
        Ok(())
    }

    /// Ends this session unconditionally: aborts an in-progress transaction on a best-effort
    /// basis, then returns the underlying `ServerSession` to the pool. Further calls on this
    /// session return a `StateError`.
    pub async fn end_session(mut self) {
        self.end_internal().await;
    }

    /// Ends this session only if it was created implicitly; otherwise a no-op (the caller
    /// retains responsibility for the session and its eventual `Drop` or explicit `end_session`).
    pub async fn end_implicit_session(mut self) {
        if self.is_implicit {
            self.end_internal().await;
        }
    }

    async fn end_internal(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if matches!(self.transaction.state, TransactionState::InProgress) {
            let _ = self.abort_transaction().await;
        }
        if let Some(server_session) = self.server_session.take() {
            self.session_pool
                .check_in(server_session, self.logical_session_timeout)
                .await;
        }
    }

    fn mark_dirty(&mut self) {
        if let Some(server_session) = self.server_session.as_mut() {
            server_session.mark_dirty();
        }
    }

    fn ensure_not_ended(&self) -> Result<()> {
        if self.ended {
            return Err(ErrorKind::State {
                message: "session has already been ended".into(),
            }
            .into());
        }
        Ok(())
    }
}

impl Drop for ClientSession {
    /// Abnormal termination: if a transaction was in progress, attempt exactly one
    /// best-effort `abortTransaction` before returning the server session to the pool. Runs on
    /// the ambient tokio runtime if one is available; if not (e.g. the runtime has already shut
    /// down), the server session is silently leaked rather than panicking in a destructor.
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        let Some(server_session) = self.server_session.take() else {
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let topology = self.topology.clone();
        let session_pool = self.session_pool.clone();
        let logical_session_timeout = self.logical_session_timeout;
        let connection = self.connection.clone();
        let in_progress = matches!(self.transaction.state, TransactionState::InProgress);
        let txn_number = server_session.txn_number();
        let lsid = server_session.id().clone();
        let write_concern = self
            .transaction
            .options
            .as_ref()
            .and_then(|o| o.write_concern.clone());
        let recovery_token = self.transaction.recovery_token.clone();

        handle.spawn(async move {
            if in_progress {
                let fields = transaction_ops::TransactionCommandFields {
                    lsid: &lsid,
                    txn_number,
                    write_concern: write_concern.as_ref(),
                    recovery_token: recovery_token.as_ref(),
                };
                if let Ok(body) = transaction_ops::build_abort_command(&fields) {
                    let _ = topology.exec_command(&connection, "admin", body).await;
                }
            }
            session_pool.check_in(server_session, logical_session_timeout).await;
        });
    }
}


#[cfg(test)]
mod test {
    use super::{test_support::*, *};

    #[tokio::test]
    async fn vacuous_commit_sends_no_command() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology.clone(), false).await;

        session.start_transaction(None).unwrap();
        session.commit_transaction().await.unwrap();

        assert!(topology.executed_commands().is_empty());
        assert_eq!(session.transaction_state(), TransactionState::Committed { data_committed: false });
    }

    #[tokio::test]
    async fn two_phase_transaction_decorates_first_and_subsequent_commands() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology.clone(), false).await;

        session.start_transaction(None).unwrap();

        let mut first = crate::bson::doc! { "insert": "dogs", "documents": [{ "name": "Greta" }] };
        session.bind_command(&mut first).unwrap();
        assert_eq!(first.get_bool("startTransaction").unwrap(), true);
        assert_eq!(first.get_bool("autocommit").unwrap(), false);
        assert_eq!(first.get_i64("txnNumber").unwrap(), 1);
        assert_eq!(session.transaction_state(), TransactionState::InProgress);

        let mut second = crate::bson::doc! { "insert": "dogs", "documents": [{ "name": "Waldo" }] };
        session.bind_command(&mut second).unwrap();
        assert!(second.get("startTransaction").is_none());
        assert_eq!(second.get_i64("txnNumber").unwrap(), 1);

        session.commit_transaction().await.unwrap();
        let executed = topology.executed_commands();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "commitTransaction");
        assert_eq!(executed[0].1.get_i64("txnNumber").unwrap(), 1);
    }

    #[tokio::test]
    async fn abort_on_callback_error_sends_exactly_one_abort() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology.clone(), false).await;

        session.start_transaction(None).unwrap();
        let mut cmd = crate::bson::doc! { "insert": "dogs" };
        session.bind_command(&mut cmd).unwrap();

        session.abort_transaction().await.unwrap();

        let executed = topology.executed_commands();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].0, "abortTransaction");
        assert_eq!(session.transaction_state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn abort_error_is_swallowed() {
        let topology = Arc::new(MockTopology::default());
        topology.queue_reply(
            "abortTransaction",
            Err(ErrorKind::Network { message: "connection reset".into() }.into()),
        );
        let mut session = new_session(topology.clone(), false).await;
        session.start_transaction(None).unwrap();
        let mut cmd = crate::bson::doc! { "insert": "dogs" };
        session.bind_command(&mut cmd).unwrap();

        // Must not propagate the network error.
        session.abort_transaction().await.unwrap();
        assert_eq!(session.transaction_state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn commit_network_error_still_transitions_to_committed() {
        let topology = Arc::new(MockTopology::default());
        topology.queue_reply(
            "commitTransaction",
            Err(ErrorKind::Network { message: "connection reset".into() }.into()),
        );
        let mut session = new_session(topology.clone(), false).await;
        session.start_transaction(None).unwrap();
        let mut cmd = crate::bson::doc! { "insert": "dogs" };
        session.bind_command(&mut cmd).unwrap();

        let err = session.commit_transaction().await.unwrap_err();
        assert!(err.contains_label(crate::error::UNKNOWN_TRANSACTION_COMMIT_RESULT));
        assert_eq!(
            session.transaction_state(),
            TransactionState::Committed { data_committed: true }
        );
    }

    #[tokio::test]
    async fn retried_commit_uses_majority_write_concern() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology.clone(), false).await;
        session.start_transaction(None).unwrap();
        let mut cmd = crate::bson::doc! { "insert": "dogs" };
        session.bind_command(&mut cmd).unwrap();
        session.commit_transaction().await.unwrap();
        session.commit_transaction().await.unwrap();

        let executed = topology.executed_commands();
        assert_eq!(executed.len(), 2);
        let second_wc = executed[1].1.get_document("writeConcern").unwrap();
        assert_eq!(second_wc.get_str("w").unwrap(), "majority");
    }

    #[tokio::test]
    async fn causal_consistency_injects_after_cluster_time_on_next_bind() {
        let topology = Arc::new(MockTopology::default());
        let mut session = ClientSession::checkout(
            topology,
            Arc::new(ServerSessionPool::new()),
            None,
            SessionKind::Read,
            false,
            Some(SessionOptions::builder().causal_consistency(true).build()),
        )
        .await
        .unwrap();

        let ts = Timestamp { time: 55, increment: 2 };
        session.advance_operation_time(ts);

        let mut cmd = crate::bson::doc! { "find": "c" };
        session.bind_command(&mut cmd).unwrap();
        let rc = cmd.get_document("readConcern").unwrap();
        assert_eq!(rc.get_timestamp("afterClusterTime").unwrap(), ts);
    }

    #[tokio::test]
    async fn advance_operation_time_is_monotonic() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology, false).await;
        let t1 = Timestamp { time: 10, increment: 0 };
        let t2 = Timestamp { time: 20, increment: 0 };
        session.advance_operation_time(t2);
        session.advance_operation_time(t1);
        assert_eq!(session.operation_time(), Some(t2));
    }

    #[tokio::test]
    async fn start_transaction_rejected_while_already_in_progress() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology, false).await;
        session.start_transaction(None).unwrap();
        let err = session.start_transaction(None).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::State { .. }));
    }

    #[tokio::test]
    async fn commit_without_transaction_is_a_state_error() {
        let topology = Arc::new(MockTopology::default());
        let mut session = new_session(topology, false).await;
        let err = session.commit_transaction().await.unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::State { .. }));
    }

    #[tokio::test]
    async fn end_session_checks_in_server_session_for_reuse() {
        let topology = Arc::new(MockTopology::default());
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::checkout(
            topology,
            pool.clone(),
            None,
            SessionKind::Write,
            false,
            None,
        )
        .await
        .unwrap();
        session.end_session().await;
        assert_eq!(pool.len().await, 1);
    }
}
