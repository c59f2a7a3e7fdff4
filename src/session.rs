//! Client session boundary
//!
//! The registry never owns sockets. Whatever transport hosts a client hands
//! the registry an `Arc<dyn ClientSession>` and the registry talks to it
//! only through this trait.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::registry::AccountId;

/// Opaque per-connection identity.
pub type SessionId = u64;

pub trait ClientSession: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn account_id(&self) -> AccountId;

    /// Privilege level the session acts with, recomputed on every login.
    fn set_gm_level(&self, level: u8);

    /// True once the account finished authenticating.
    fn is_logged_in(&self) -> bool;

    /// Log the client out through the normal path.
    fn disconnect(&self);

    /// Drop the transport without any logout bookkeeping.
    fn close_transport(&self);

    /// Push the disease state of nearby monsters and players to the client.
    fn announce_diseases(&self) {}
}

/// Shared handle to a live session.
#[derive(Clone)]
pub struct SessionHandle(pub Arc<dyn ClientSession>);

impl SessionHandle {
    pub fn new(session: Arc<dyn ClientSession>) -> Self {
        Self(session)
    }

    pub fn id(&self) -> SessionId {
        self.0.session_id()
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = dyn ClientSession;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.0.session_id())
            .field("account_id", &self.0.account_id())
            .finish()
    }
}

/// In-memory session used by tests and tooling.
#[derive(Debug, Default)]
pub struct TestSession {
    pub id: SessionId,
    pub account: AccountId,
    pub logged_in: AtomicBool,
    pub gm_level: AtomicU8,
    pub disconnects: AtomicUsize,
    pub transport_closes: AtomicUsize,
    pub announcements: AtomicUsize,
}

impl TestSession {
    pub fn new(id: SessionId, account: AccountId, logged_in: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            account,
            logged_in: AtomicBool::new(logged_in),
            ..Default::default()
        })
    }

    pub fn gm_level(&self) -> u8 {
        self.gm_level.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn transport_close_count(&self) -> usize {
        self.transport_closes.load(Ordering::SeqCst)
    }

    pub fn announce_count(&self) -> usize {
        self.announcements.load(Ordering::SeqCst)
    }
}

impl ClientSession for TestSession {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn account_id(&self) -> AccountId {
        self.account
    }

    fn set_gm_level(&self, level: u8) {
        self.gm_level.store(level, Ordering::SeqCst);
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn close_transport(&self) {
        self.transport_closes.fetch_add(1, Ordering::SeqCst);
    }

    fn announce_diseases(&self) {
        self.announcements.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_forwards_to_session() {
        let session = TestSession::new(42, 7, true);
        let handle = SessionHandle::new(session.clone());

        assert_eq!(handle.id(), 42);
        assert_eq!(handle.account_id(), 7);
        assert!(handle.is_logged_in());

        handle.set_gm_level(3);
        handle.disconnect();
        assert_eq!(session.gm_level(), 3);
        assert_eq!(session.disconnect_count(), 1);
        assert_eq!(session.transport_close_count(), 0);
    }

    #[test]
    fn test_debug_shows_ids() {
        let handle = SessionHandle::new(TestSession::new(5, 9, false));
        let text = format!("{:?}", handle);
        assert!(text.contains("session_id: 5"));
        assert!(text.contains("account_id: 9"));
    }
}
