//! The pure command decorator: rewrites an outgoing command document to carry session and
//! transaction metadata according to the session's current state, without ever touching the
//! network. This is the one piece of the state machine deliberately factored out as a free
//! function so it can be unit tested in isolation. Simplified to the fields this crate's scope
//! actually needs (no cluster-time gossip, no snapshot reads).

use crate::{
    bson::{doc, Bson, Document, Timestamp},
    session::{Transaction, TransactionState},
};

/// The session-level facts a decoration needs, gathered once per call by [`super::ClientSession`].
pub(crate) struct SessionFields<'a> {
    pub(crate) lsid: &'a Document,
    pub(crate) txn_number: i64,
    pub(crate) causal_consistency: bool,
    pub(crate) operation_time: Option<Timestamp>,
    /// The wire version negotiated with the pinned connection. Below 6 (MongoDB 3.6), the
    /// deployment does not understand sessions at all and decoration is a no-op here (unlike
    /// `start_transaction`, which rejects a too-old wire version outright).
    pub(crate) wire_version: i32,
}

/// Decorates `command` in place according to the session's transaction state. When `transaction`
/// is in `Starting`, this call is itself the transition to `InProgress` — the caller does not
/// need a separate step.
pub(crate) fn bind_session(
    transaction: &mut Transaction,
    fields: &SessionFields<'_>,
    command: &mut Document,
) {
    if fields.wire_version < 6 {
        return;
    }

    match transaction.state {
        TransactionState::None | TransactionState::Committed { .. } | TransactionState::Aborted => {
            command.insert("lsid", Bson::Document(fields.lsid.clone()));
            apply_read_concern(command, fields);
        }
        TransactionState::Starting => {
            command.insert("lsid", Bson::Document(fields.lsid.clone()));
            command.insert("txnNumber", fields.txn_number);
            command.insert("startTransaction", true);
            command.insert("autocommit", false);
            command.remove("writeConcern");
            apply_read_concern(command, fields);
            transaction.state = TransactionState::InProgress;
        }
        TransactionState::InProgress => {
            command.insert("lsid", Bson::Document(fields.lsid.clone()));
            command.insert("txnNumber", fields.txn_number);
            command.insert("autocommit", false);
            command.remove("writeConcern");
            command.remove("readConcern");
        }
    }
}

/// Injects `afterClusterTime`: a no-op unless the session is causally consistent and has an
/// observed `operation_time`, in which case it is merged into (or used to create) the command's
/// `readConcern` document.
fn apply_read_concern(command: &mut Document, fields: &SessionFields<'_>) {
    if !fields.causal_consistency {
        return;
    }
    let Some(operation_time) = fields.operation_time else {
        return;
    };
    match command.get_mut("readConcern") {
        Some(Bson::Document(existing)) => {
            existing.insert("afterClusterTime", operation_time);
        }
        _ => {
            command.insert("readConcern", doc! { "afterClusterTime": operation_time });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn lsid() -> Document {
        doc! { "id": "deadbeef" }
    }

    fn fields(causal_consistency: bool, operation_time: Option<Timestamp>) -> SessionFields<'static> {
        // leaked on purpose: tests are short-lived processes and this keeps call sites terse.
        let lsid: &'static Document = Box::leak(Box::new(lsid()));
        SessionFields {
            lsid,
            txn_number: 1,
            causal_consistency,
            operation_time,
            wire_version: 13,
        }
    }

    #[test]
    fn wire_version_below_6_passes_command_through_unchanged() {
        let mut transaction = Transaction::default();
        let mut f = fields(true, Some(Timestamp { time: 1, increment: 1 }));
        f.wire_version = 5;
        let mut cmd = doc! { "find": "c" };
        let before = cmd.clone();
        bind_session(&mut transaction, &f, &mut cmd);
        assert_eq!(cmd, before);
    }

    #[test]
    fn no_transaction_attaches_lsid_only_when_not_causally_consistent() {
        let mut transaction = Transaction::default();
        let f = fields(false, None);
        let mut cmd = doc! { "find": "c" };
        bind_session(&mut transaction, &f, &mut cmd);
        assert_eq!(cmd.get_document("lsid").unwrap(), f.lsid);
        assert!(cmd.get("readConcern").is_none());
        assert!(cmd.get("txnNumber").is_none());
    }

    #[test]
    fn no_transaction_causally_consistent_injects_after_cluster_time() {
        let mut transaction = Transaction::default();
        let ts = Timestamp { time: 42, increment: 7 };
        let f = fields(true, Some(ts));
        let mut cmd = doc! { "find": "c" };
        bind_session(&mut transaction, &f, &mut cmd);
        let rc = cmd.get_document("readConcern").unwrap();
        assert_eq!(rc.get_timestamp("afterClusterTime").unwrap(), ts);
    }

    #[test]
    fn starting_transaction_sets_flags_strips_write_concern_and_advances_state() {
        let mut transaction = Transaction::default();
        transaction.state = TransactionState::Starting;
        let f = fields(false, None);
        let mut cmd = doc! { "insert": "dogs", "writeConcern": { "w": 1 } };
        bind_session(&mut transaction, &f, &mut cmd);

        assert_eq!(cmd.get_bool("startTransaction").unwrap(), true);
        assert_eq!(cmd.get_bool("autocommit").unwrap(), false);
        assert_eq!(cmd.get_i64("txnNumber").unwrap(), 1);
        assert!(cmd.get("writeConcern").is_none());
        assert_eq!(transaction.state, TransactionState::InProgress);
    }

    #[test]
    fn in_progress_strips_both_write_and_read_concern() {
        let mut transaction = Transaction::default();
        transaction.state = TransactionState::InProgress;
        let f = fields(true, Some(Timestamp { time: 1, increment: 1 }));
        let mut cmd = doc! {
            "insert": "dogs",
            "writeConcern": { "w": 1 },
            "readConcern": { "level": "majority" },
        };
        bind_session(&mut transaction, &f, &mut cmd);

        assert!(cmd.get("writeConcern").is_none());
        assert!(cmd.get("readConcern").is_none());
        assert_eq!(cmd.get_i64("txnNumber").unwrap(), 1);
        assert_eq!(cmd.get_bool("autocommit").unwrap(), false);
        assert!(cmd.get("startTransaction").is_none());
    }

    #[test]
    fn second_bind_in_same_transaction_does_not_resend_start_transaction() {
        let mut transaction = Transaction::default();
        transaction.state = TransactionState::Starting;
        let f = fields(false, None);

        let mut first = doc! { "insert": "dogs", "documents": [{ "name": "Greta" }] };
        bind_session(&mut transaction, &f, &mut first);
        assert_eq!(first.get_bool("startTransaction").unwrap(), true);

        let mut second = doc! { "insert": "dogs", "documents": [{ "name": "Waldo" }] };
        bind_session(&mut transaction, &f, &mut second);
        assert!(second.get("startTransaction").is_none());
        assert_eq!(second.get_bool("autocommit").unwrap(), false);
        assert_eq!(second.get_i64("txnNumber").unwrap(), 1);
    }
}
