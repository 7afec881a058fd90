//! The `ServerSession` registry: a pool of server-assigned session identities, each with
//! its own monotonically increasing transaction counter.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bson::Document;

/// Client-side abstraction of a server-assigned session. These are pooled and may be bound to
/// multiple [`crate::ClientSession`]s over the course of their lifetime.
#[derive(Clone, Debug)]
pub struct ServerSession {
    id: Document,
    uuid: Uuid,
    last_use: Instant,
    dirty: bool,
    txn_number: i64,
}

impl ServerSession {
    /// Creates a new session, generating its id client-side.
    fn new() -> Self {
        let uuid = Uuid::new_v4();
        Self {
            id: crate::bson_util::uuid_lsid(uuid),
            uuid,
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    /// The `{id: <uuid>}` document sent as a command's `lsid` field.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// The raw session UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The current transaction number. Incremented by [`ServerSession::increment_txn_number`]
    /// exactly once per `start_transaction`.
    pub fn txn_number(&self) -> i64 {
        self.txn_number
    }

    pub(crate) fn increment_txn_number(&mut self) -> i64 {
        self.txn_number += 1;
        self.txn_number
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// Whether this session will expire within the next minute, and so should not be recycled.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let Some(timeout) = logical_session_timeout else {
            return false;
        };
        let expiration = self.last_use + timeout;
        expiration < Instant::now() + Duration::from_secs(60)
    }
}

/// The free list of [`ServerSession`]s available for reuse, shared process-wide.
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
        }
    }

    /// Checks a server session out of the pool, first discarding any sessions that are about to
    /// expire. If the pool is empty afterward, a new session is created.
    pub async fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            tracing::debug!(session_id = %session.uuid(), "checked out server session from pool");
            return session;
        }
        let session = ServerSession::new();
        tracing::debug!(session_id = %session.uuid(), "created new server session");
        session
    }

    /// Returns `session` to the pool, first discarding any sessions at the back that are about
    /// to expire. A dirty session (one that saw a network error) is discarded rather than
    /// recycled.
    pub async fn check_in(&self, mut session: ServerSession, logical_session_timeout: Option<Duration>) {
        session.update_last_use();
        let mut pool = self.pool.lock().await;
        while let Some(oldest) = pool.pop_back() {
            if oldest.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            pool.push_back(oldest);
            break;
        }

        if !session.is_dirty() && !session.is_about_to_expire(logical_session_timeout) {
            tracing::debug!(session_id = %session.uuid(), "checked server session back into pool");
            pool.push_front(session);
        } else {
            tracing::debug!(
                session_id = %session.uuid(),
                dirty = session.is_dirty(),
                "discarding server session instead of returning it to the pool"
            );
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, uuid: Uuid) -> bool {
        self.pool.lock().await.iter().any(|s| s.uuid() == uuid)
    }
}
