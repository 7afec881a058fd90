//! The narrow interface this crate needs from the rest of a driver: a way to check a connection
//! out for a session and a way to run a command on it. Everything else a real deployment needs
//! (server monitoring, connection pooling, wire framing) lives outside this crate.

use async_trait::async_trait;

use crate::{
    bson::Document,
    error::Result,
};

/// Whether a session is being checked out to run reads or writes. A real `Topology`
/// implementation uses this to pick a server via its own server-selection rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Read,
    Write,
}

/// An opaque handle identifying a connection pinned to a session for the lifetime of a
/// transaction. This crate never inspects its contents; it only threads it back through
/// [`Topology::exec_command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// The address of the server this connection is open to, e.g. `"localhost:27017"`.
    pub address: String,
    /// An opaque identifier distinguishing this connection from others to the same address.
    pub id: u64,
}

/// The result of attempting to check out a connection for a new or implicit session.
pub enum Checkout {
    /// A connection was selected and its wire version negotiated.
    Ready {
        connection: ConnectionHandle,
        wire_version: i32,
    },
    /// The topology could not select a server right now but the condition is expected to be
    /// transient (e.g. a server was marked unknown after a recent failure). The caller should
    /// back off and retry the checkout (see `ClientSession::checkout`'s retry loop).
    RetryLater { reason: String },
}

/// The external collaborator this crate depends on: a MongoDB-like deployment capable of
/// selecting a connection and running a command on it. A full driver built on top of this crate
/// implements this trait once, backed by its real connection pool and SDAM topology.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Selects and pins a connection suitable for a session of the given `kind`.
    async fn checkout_session(&self, kind: SessionKind) -> Result<Checkout>;

    /// Runs `command` against `database` on `connection`, returning the raw reply document.
    /// Implementations should return `Err` only for transport-level failures; a server-side
    /// `ok: 0` reply is still `Ok(reply)` and is interpreted by the caller.
    async fn exec_command(
        &self,
        connection: &ConnectionHandle,
        database: &str,
        command: Document,
    ) -> Result<Document>;
}
