use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bson::{doc, spec::BinarySubtype, Binary, Document};
use tokio::sync::Mutex;

/// Sessions created within a minute of expiration are discarded rather than reused, per the
/// sessions spec.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// A server session as defined by the driver sessions spec: an id document plus the
/// bookkeeping needed to decide when the session may be reused.
#[derive(Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(crate) id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(crate) dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        // Server session ids are client-generated v4 UUIDs.
        let mut bytes: [u8; 16] = rand::random();
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;

        Self {
            id: doc! {
                "id": Binary {
                    subtype: BinarySubtype::Uuid,
                    bytes: bytes.to_vec(),
                }
            },
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// Updates the date of the last use of this session to the current time.
    pub(crate) fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether this session is about to expire given the timeout the deployment reported.
    /// A deployment that reports no timeout (e.g. one behind a load balancer) never expires
    /// sessions.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(timeout) => timeout,
            None => return false,
        };
        self.last_use.elapsed() > timeout.saturating_sub(EXPIRY_BUFFER)
    }
}

/// A LIFO pool of server sessions, shared by all operations on a client. Returning the most
/// recently used session first keeps the working set small so idle sessions can expire on
/// the server.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Checks out a server session, discarding pooled sessions that are about to expire.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks in a server session. Dirty or expiring sessions are discarded.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while pool
            .back()
            .map_or(false, |session| session.is_about_to_expire(logical_session_timeout))
        {
            pool.pop_back();
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.pool.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ServerSession, ServerSessionPool};

    #[tokio::test]
    async fn sessions_are_reused_lifo() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let first = pool.check_out(timeout).await;
        let second = pool.check_out(timeout).await;
        assert_ne!(first.id, second.id);

        let first_id = first.id.clone();
        let second_id = second.id.clone();
        pool.check_in(first, timeout).await;
        pool.check_in(second, timeout).await;

        // The most recently checked in session comes out first.
        let reused = pool.check_out(timeout).await;
        assert_eq!(reused.id, second_id);
        let reused_next = pool.check_out(timeout).await;
        assert_eq!(reused_next.id, first_id);
    }

    #[tokio::test]
    async fn dirty_sessions_are_discarded() {
        let pool = ServerSessionPool::new();
        let timeout = Some(Duration::from_secs(30 * 60));

        let mut session = pool.check_out(timeout).await;
        let session_id = session.id.clone();
        session.mark_dirty();
        pool.check_in(session, timeout).await;

        assert_eq!(pool.len().await, 0);
        let fresh = pool.check_out(timeout).await;
        assert_ne!(fresh.id, session_id);
    }

    #[tokio::test]
    async fn expiring_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        // A timeout under the expiry buffer means every session is already "about to
        // expire".
        let timeout = Some(Duration::from_secs(30));
        let session = pool.check_out(timeout).await;
        pool.check_in(session, timeout).await;
        assert_eq!(pool.len().await, 0);

        // With no timeout reported, sessions never expire.
        let session = ServerSession::new();
        pool.check_in(session, None).await;
        assert_eq!(pool.len().await, 1);
    }
}
