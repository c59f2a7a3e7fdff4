use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::session::{SessionHandle, SessionId};

/// Default time a session may stay in the login state.
pub const LOGIN_TIMEOUT: Duration = Duration::from_millis(600_000);

struct Admission {
    session: SessionHandle,
    deadline: Instant,
}

/// Sessions still in the login state and the moment each must be gone by.
pub struct LoginAdmission {
    timeout: Duration,
    entries: Mutex<HashMap<SessionId, Admission>>,
}

impl LoginAdmission {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Admit `session` now. Returns its deadline.
    pub fn register_login_state(&self, session: SessionHandle) -> Instant {
        self.register_login_state_at(session, Instant::now())
    }

    /// Re-registering a session moves its deadline.
    pub fn register_login_state_at(&self, session: SessionHandle, now: Instant) -> Instant {
        let deadline = now + self.timeout;
        let id = session.id();
        self.entries.lock().insert(id, Admission { session, deadline });
        tracing::trace!("[login] [admitted] session={}", id);
        deadline
    }

    pub fn unregister_login_state(&self, session: SessionId) -> bool {
        self.entries.lock().remove(&session).is_some()
    }

    pub fn deadline(&self, session: SessionId) -> Option<Instant> {
        self.entries.lock().get(&session).map(|a| a.deadline)
    }

    /// Remove and return every session whose deadline is strictly before `now`.
    pub fn take_overdue(&self, now: Instant) -> Vec<SessionHandle> {
        let mut entries = self.entries.lock();
        let overdue: Vec<SessionId> = entries
            .iter()
            .filter(|(_, a)| now > a.deadline)
            .map(|(id, _)| *id)
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|a| a.session)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LoginAdmission {
    fn default() -> Self {
        Self::new(LOGIN_TIMEOUT)
    }
}
