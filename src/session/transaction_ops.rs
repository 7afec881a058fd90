//! Construction of the `commitTransaction`/`abortTransaction` command envelopes and
//! interpretation of their replies. Unlike ordinary operations, commit and abort are built
//! directly rather than through [`super::decorator::bind_session`]: the decorator strips
//! `writeConcern` from in-transaction commands, but commit/abort are exactly the commands that
//! need to carry one. Connection selection and retry live in `session/mod.rs`; this module only
//! builds envelopes and interprets replies.

use std::time::Duration;

use crate::{
    bson::{doc, Bson, Document},
    concern::WriteConcern,
    error::{command_failed, CommandErrorBody, Error, ErrorKind, Result},
};

/// Everything needed to build a commit or abort envelope: the fields the decorator would otherwise inject
/// via the decorator, plus the write concern and (for commit only) `maxTimeMS`.
pub(crate) struct TransactionCommandFields<'a> {
    pub(crate) lsid: &'a Document,
    pub(crate) txn_number: i64,
    pub(crate) write_concern: Option<&'a WriteConcern>,
    pub(crate) recovery_token: Option<&'a Document>,
}

/// Builds a `commitTransaction` command body: `{commitTransaction: 1, lsid, txnNumber,
/// autocommit: false, writeConcern?, maxTimeMS?, recoveryToken?}`, omitting absent fields.
pub(crate) fn build_commit_command(
    fields: &TransactionCommandFields<'_>,
    max_commit_time: Option<Duration>,
) -> Result<Document> {
    let mut body = base_envelope("commitTransaction", fields)?;
    if let Some(max_commit_time) = max_commit_time {
        body.insert("maxTimeMS", max_commit_time.as_millis() as i64);
    }
    Ok(body)
}

/// Builds an `abortTransaction` command body. Identical envelope to commit, minus `maxTimeMS`.
pub(crate) fn build_abort_command(fields: &TransactionCommandFields<'_>) -> Result<Document> {
    base_envelope("abortTransaction", fields)
}

fn base_envelope(name: &str, fields: &TransactionCommandFields<'_>) -> Result<Document> {
    let mut body = Document::new();
    body.insert(name, 1);
    body.insert("lsid", Bson::Document(fields.lsid.clone()));
    body.insert("txnNumber", fields.txn_number);
    body.insert("autocommit", false);
    if let Some(wc) = fields.write_concern {
        let bson = bson::to_bson(wc).map_err(|e| ErrorKind::Internal {
            message: format!("failed to serialize write concern: {e}"),
        })?;
        body.insert("writeConcern", bson);
    }
    if let Some(token) = fields.recovery_token {
        body.insert("recoveryToken", Bson::Document(token.clone()));
    }
    Ok(body)
}

/// Returns `write_concern` bumped to `{w: majority, wtimeout: 10000ms}` if it does not already
/// request at least that much. Used when retrying a commit that previously sent data.
pub(crate) fn majority_commit_write_concern(write_concern: Option<&WriteConcern>) -> WriteConcern {
    use crate::concern::Acknowledgment;

    let mut wc = write_concern.cloned().unwrap_or_default();
    wc.w = Some(Acknowledgment::Majority);
    if wc.w_timeout.is_none() {
        wc.w_timeout = Some(Duration::from_millis(10_000));
    }
    wc
}

/// Interprets a commit/abort reply. A server-side `ok: 0` or a `writeConcernError` field becomes
/// an `Err`; otherwise returns the `recoveryToken` field, if the reply carried one.
pub(crate) fn interpret_reply(reply: &Document) -> Result<Option<Document>> {
    if command_failed(reply) {
        let body: CommandErrorBody = bson::from_document(reply.clone()).map_err(|e| ErrorKind::Internal {
            message: format!("failed to parse command error reply: {e}"),
        })?;
        return Err(body.into_error());
    }

    if let Ok(wc_error) = reply.get_document("writeConcernError") {
        let code = wc_error.get_i32("code").unwrap_or(0);
        let message = wc_error
            .get_str("errmsg")
            .map(str::to_string)
            .unwrap_or_default();
        return Err(Error::from(ErrorKind::WriteConcern { code, message }));
    }

    Ok(reply.get_document("recoveryToken").ok().cloned())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::concern::Acknowledgment;

    fn lsid() -> Document {
        doc! { "id": "deadbeef" }
    }

    #[test]
    fn commit_command_has_full_envelope() {
        let wc = WriteConcern::builder().w(Acknowledgment::Majority).build();
        let lsid = lsid();
        let fields = TransactionCommandFields {
            lsid: &lsid,
            txn_number: 7,
            write_concern: Some(&wc),
            recovery_token: None,
        };
        let cmd = build_commit_command(&fields, Some(Duration::from_millis(500))).unwrap();
        assert_eq!(cmd.get_i64("commitTransaction").unwrap(), 1);
        assert_eq!(cmd.get_i64("txnNumber").unwrap(), 7);
        assert_eq!(cmd.get_bool("autocommit").unwrap(), false);
        assert_eq!(cmd.get_document("lsid").unwrap(), &lsid);
        assert_eq!(
            cmd.get_document("writeConcern").unwrap().get_str("w").unwrap(),
            "majority"
        );
        assert_eq!(cmd.get_i64("maxTimeMS").unwrap(), 500);
    }

    #[test]
    fn abort_command_omits_max_time_and_absent_write_concern() {
        let lsid = lsid();
        let fields = TransactionCommandFields {
            lsid: &lsid,
            txn_number: 2,
            write_concern: None,
            recovery_token: None,
        };
        let cmd = build_abort_command(&fields).unwrap();
        assert_eq!(cmd.get_i64("abortTransaction").unwrap(), 1);
        assert!(cmd.get("maxTimeMS").is_none());
        assert!(cmd.get("writeConcern").is_none());
    }

    #[test]
    fn recovery_token_is_attached_when_present() {
        let lsid = lsid();
        let token = doc! { "recoveryShardId": "shard01" };
        let fields = TransactionCommandFields {
            lsid: &lsid,
            txn_number: 2,
            write_concern: None,
            recovery_token: Some(&token),
        };
        let cmd = build_abort_command(&fields).unwrap();
        assert_eq!(cmd.get_document("recoveryToken").unwrap(), &token);
    }

    #[test]
    fn majority_commit_write_concern_fills_in_defaults() {
        let wc = majority_commit_write_concern(None);
        assert_eq!(wc.w, Some(Acknowledgment::Majority));
        assert_eq!(wc.w_timeout, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn majority_commit_write_concern_preserves_explicit_timeout() {
        let existing = WriteConcern::builder()
            .w(Acknowledgment::Nodes(1))
            .w_timeout(Duration::from_millis(2_000))
            .build();
        let wc = majority_commit_write_concern(Some(&existing));
        assert_eq!(wc.w, Some(Acknowledgment::Majority));
        assert_eq!(wc.w_timeout, Some(Duration::from_millis(2_000)));
    }

    #[test]
    fn interpret_reply_errors_on_ok_zero() {
        let reply = doc! { "ok": 0.0, "code": 251, "errmsg": "no such transaction" };
        let err = interpret_reply(&reply).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::Protocol { code: 251, .. }));
    }

    #[test]
    fn interpret_reply_returns_recovery_token_on_success() {
        let reply = doc! { "ok": 1.0, "recoveryToken": { "recoveryShardId": "shard01" } };
        let token = interpret_reply(&reply).unwrap();
        assert_eq!(token.unwrap().get_str("recoveryShardId").unwrap(), "shard01");
    }

    #[test]
    fn interpret_reply_surfaces_write_concern_error() {
        let reply = doc! {
            "ok": 1.0,
            "writeConcernError": { "code": 64, "errmsg": "waiting for replication timed out" },
        };
        let err = interpret_reply(&reply).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::WriteConcern { code: 64, .. }));
    }
}
