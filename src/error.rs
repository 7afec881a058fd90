//! Contains the `Error` and `Result` types that this crate uses.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error;

use crate::bson::{Bson, Document};

/// Transient transaction error label. Attached to a network error or server selection error
/// that occurs while a transaction is in progress.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Unknown transaction commit result error label. Attached to a network error, a
/// write-concern failure, or a `MaxTimeMSExpired` error observed during `commitTransaction`.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";

/// The result type for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in this crate. The inner [`ErrorKind`] is wrapped in an `Arc`-free
/// `Box` and cloning the error is cheap because `ErrorKind`'s variants are themselves small.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels.into_iter().collect(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        ErrorKind::State {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn protocol(code: i32, message: impl Into<String>) -> Self {
        ErrorKind::Protocol {
            code,
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn no_session_support() -> Self {
        ErrorKind::NoSessionSupport.into()
    }

    /// Returns the labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label(&mut self, label: impl Into<String>) {
        self.labels.insert(label.into());
    }

    pub(crate) fn with_label(mut self, label: impl Into<String>) -> Self {
        self.add_label(label);
        self
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Network { .. })
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::CheckoutRetryable { .. })
    }

    pub(crate) fn is_write_concern_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::WriteConcern { .. })
    }

    pub(crate) fn is_max_time_ms_expired(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Protocol { code, .. } if *code == 50)
    }

    /// Tags this error with `TransientTransactionError` if it looks like the kind of failure
    /// that occurred while a transaction was in progress (network or server-selection).
    ///
    /// This crate's own commit/abort paths tag their own errors with
    /// `UnknownTransactionCommitResult` directly (see `maybe_tag_unknown_commit_result`) because
    /// they already know a commit was in flight. `TransientTransactionError`, by contrast,
    /// applies to ordinary in-transaction commands, which are executed by the caller through
    /// [`crate::ClientSession::connection`] and [`crate::ClientSession::bind_command`], outside
    /// this crate's scope — so this helper is `pub`, for that caller to apply to its own errors
    /// observed while [`crate::ClientSession::in_transaction`] is true.
    pub fn maybe_tag_transient_transaction(self) -> Self {
        if self.is_network_error() || self.is_server_selection_error() {
            self.with_label(TRANSIENT_TRANSACTION_ERROR)
        } else {
            self
        }
    }

    /// Tags this error with `UnknownTransactionCommitResult` if it looks like a failure where
    /// the server-side commit outcome could not be determined.
    pub(crate) fn maybe_tag_unknown_commit_result(self) -> Self {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return self;
        }
        if self.is_network_error()
            || self.is_server_selection_error()
            || self.is_write_concern_error()
            || self.is_max_time_ms_expired()
        {
            self.with_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
        } else {
            self
        }
    }
}

/// The type of error that occurred.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server returned an error (`ok: 0`) to an attempted operation.
    #[error("command failed with code {code}: {message}")]
    Protocol { code: i32, message: String },

    /// An operation was requested in a state that does not permit it (e.g. `start_transaction`
    /// while a transaction is already starting).
    #[error("{message}")]
    State { message: String },

    /// A transport failure occurred, most commonly while sending `commitTransaction` or
    /// `abortTransaction`.
    #[error("network error: {message}")]
    Network { message: String },

    /// The server acknowledged an operation but reported that the requested write concern was
    /// not satisfied.
    #[error("write concern error: code {code}: {message}")]
    WriteConcern { code: i32, message: String },

    /// A command that requires session support was attempted against a deployment with a wire
    /// version below 6 (MongoDB 3.6).
    #[error("the deployment does not support sessions")]
    NoSessionSupport,

    /// The topology reported a transient failure selecting a server for a session checkout; the
    /// caller should back off and retry.
    #[error("server selection failed, retry later: {reason}")]
    CheckoutRetryable { reason: String },

    /// The `with_transaction` callback returned an error.
    #[error("transaction callback failed: {0}")]
    Callback(#[source] Arc<Error>),

    /// `with_transaction`'s overall 120-second wall-clock budget elapsed before the transaction
    /// could be committed or aborted.
    #[error("with_transaction exceeded its deadline: {message}")]
    Timeout { message: String },

    /// An invalid argument was supplied (e.g. conflicting session options).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An internal invariant was violated; this indicates a bug in this crate rather than
    /// caller misuse.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, None)
    }
}

/// The body of a failed command reply, used to build a [`ErrorKind::Protocol`].
#[derive(Debug, Clone, serde::Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "code", default)]
    pub(crate) code: i32,
    #[serde(rename = "errmsg", default)]
    pub(crate) message: String,
    #[serde(rename = "errorLabels", default)]
    pub(crate) error_labels: Option<Vec<String>>,
}

impl CommandErrorBody {
    pub(crate) fn into_error(self) -> Error {
        Error::new(
            ErrorKind::Protocol {
                code: self.code,
                message: self.message,
            },
            self.error_labels.unwrap_or_default(),
        )
    }
}

/// Returns whether `reply` indicates command failure (`ok` is present and falsy).
pub(crate) fn command_failed(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Boolean(ok)) => !ok,
        Some(ok) => ok.as_f64().map(|v| v == 0.0).unwrap_or(false),
        None => false,
    }
}

impl fmt::Display for CommandErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}
