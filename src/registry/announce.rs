//! Disease-announce queue
//!
//! Clients that just entered a map are queued here. A client registered
//! during one run is only announced to on the run after, so it always waits
//! at least one full update tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::session::SessionHandle;
use crate::timer::{run_isolated, ScheduledTask, TimerError, TimerManager};

#[derive(Default)]
struct AnnounceLists {
    processing: Vec<SessionHandle>,
    registered: Vec<SessionHandle>,
}

#[derive(Default)]
pub struct AnnounceQueue {
    lists: Mutex<AnnounceLists>,
}

impl AnnounceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_announce_player_diseases(&self, session: SessionHandle) {
        self.lists.lock().registered.push(session);
    }

    /// Announce to the processing list, then promote everything registered.
    ///
    /// Returns how many clients were announced to.
    pub fn run_announce_player_diseases(&self) -> usize {
        let processing = std::mem::take(&mut self.lists.lock().processing);

        for session in &processing {
            if session.is_logged_in() {
                run_isolated("announce", || session.announce_diseases());
            }
        }

        let mut lists = self.lists.lock();
        let registered = std::mem::take(&mut lists.registered);
        lists.processing.extend(registered);
        processing.len()
    }

    pub fn pending(&self) -> usize {
        let lists = self.lists.lock();
        lists.processing.len() + lists.registered.len()
    }

    /// Run the queue every `interval`.
    pub fn start(
        self: &Arc<Self>,
        timer: &TimerManager,
        interval: Duration,
    ) -> Result<ScheduledTask, TimerError> {
        let queue = Arc::clone(self);
        timer.schedule_repeating(
            Arc::new(move || {
                queue.run_announce_player_diseases();
            }),
            interval,
            interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TestSession;

    #[test]
    fn test_registered_client_waits_one_run() {
        let queue = AnnounceQueue::new();
        let session = TestSession::new(1, 1, true);
        queue.register_announce_player_diseases(SessionHandle::new(session.clone()));

        assert_eq!(queue.run_announce_player_diseases(), 0);
        assert_eq!(session.announce_count(), 0);
        assert_eq!(queue.pending(), 1);

        assert_eq!(queue.run_announce_player_diseases(), 1);
        assert_eq!(session.announce_count(), 1);
        assert_eq!(queue.pending(), 0);

        queue.run_announce_player_diseases();
        assert_eq!(session.announce_count(), 1);
    }

    #[test]
    fn test_logged_out_client_skipped() {
        let queue = AnnounceQueue::new();
        let session = TestSession::new(2, 1, false);
        queue.register_announce_player_diseases(SessionHandle::new(session.clone()));

        queue.run_announce_player_diseases();
        queue.run_announce_player_diseases();
        assert_eq!(session.announce_count(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_run() {
        let timer = TimerManager::current().unwrap();
        let queue = Arc::new(AnnounceQueue::new());
        let session = TestSession::new(3, 1, true);

        queue.start(&timer, Duration::from_millis(777)).unwrap();
        queue.register_announce_player_diseases(SessionHandle::new(session.clone()));

        // promoted at 777, announced at 1554
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(session.announce_count(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(session.announce_count(), 1);
    }
}
