//! Session- and transaction-level configuration.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    error::{ErrorKind, Result},
};

/// Merges every named field from `src` into `dst`, without overwriting a field `dst` already
/// has set. Used to apply a session's `default_transaction_options` to a per-call
/// `TransactionOptions` that didn't specify them.
macro_rules! resolve_defaults {
    ($defaults:expr, $dst:expr, [$( $field:ident ),+ $(,)?]) => {
        $(
            if let Some(value) = $defaults.$field.clone() {
                if $dst.$field.is_none() {
                    $dst.$field = Some(value);
                }
            }
        )+
    };
}

/// Options used to configure a [`crate::ClientSession`].
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct SessionOptions {
    /// The default options to use for transactions started on this session, when a call to
    /// `start_transaction` doesn't specify its own.
    #[builder(default)]
    pub default_transaction_options: Option<TransactionOptions>,

    /// Whether operations performed in the context of this session are causally consistent.
    /// Defaults to `true` for explicit sessions and `false` for implicit ones.
    #[builder(default)]
    pub causal_consistency: Option<bool>,
}

impl SessionOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref txn_opts) = self.default_transaction_options {
            if let Some(ref wc) = txn_opts.write_concern {
                wc.validate()?;
            }
        }
        Ok(())
    }

    /// Resolves whether a session created with these options (or no options at all) should be
    /// causally consistent, given whether it is implicit.
    pub(crate) fn resolved_causal_consistency(opts: Option<&SessionOptions>, is_implicit: bool) -> bool {
        opts.and_then(|o| o.causal_consistency)
            .unwrap_or(!is_implicit)
    }
}

/// Options used to configure a transaction started with `start_transaction`.
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct TransactionOptions {
    /// The read concern to use for every operation in the transaction.
    #[builder(default)]
    pub read_concern: Option<ReadConcern>,

    /// The write concern to use when committing or aborting the transaction.
    #[builder(default)]
    pub write_concern: Option<WriteConcern>,

    /// The maximum amount of time to allow a single `commitTransaction` to run.
    #[builder(default)]
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    /// Applies `defaults` (typically a session's `default_transaction_options`) to any field on
    /// `self` that was not explicitly set.
    pub(crate) fn merge_defaults(&mut self, defaults: &TransactionOptions) {
        resolve_defaults!(defaults, self, [read_concern, write_concern, max_commit_time]);
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref wc) = self.write_concern {
            wc.validate()?;
            if !wc.is_acknowledged() {
                return Err(ErrorKind::InvalidArgument {
                    message: "transactions do not support unacknowledged write concerns".into(),
                }
                .into());
            }
        }
        Ok(())
    }
}
