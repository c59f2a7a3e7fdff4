//! Idle-login reaper
//!
//! Sessions that never leave the login state past their deadline are
//! dropped: gracefully when the account authenticated, by closing the
//! transport otherwise. Disconnects happen after the admission lock is
//! released.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::admission::LoginAdmission;
use crate::timer::{run_isolated, ScheduledTask, TimerError, TimerManager};

/// Default reaper period.
pub const IDLE_LOGIN_CHECK_INTERVAL: Duration = Duration::from_millis(300_000);

/// Evict overdue login sessions as of `now`. Returns how many were dropped.
pub fn disconnect_idles_on_login_state(admission: &LoginAdmission, now: Instant) -> usize {
    let overdue = admission.take_overdue(now);
    for session in &overdue {
        let logged_in = session.is_logged_in();
        tracing::info!(
            "[login] [idle_disconnect] session={} account={} logged_in={}",
            session.id(),
            session.account_id(),
            logged_in
        );
        run_isolated("login", || {
            if logged_in {
                session.disconnect();
            } else {
                session.close_transport();
            }
        });
    }
    overdue.len()
}

pub struct IdleLoginReaper;

impl IdleLoginReaper {
    /// Run the reaper every `interval`, first after one full interval.
    pub fn start(
        timer: &TimerManager,
        admission: Arc<LoginAdmission>,
        interval: Duration,
    ) -> Result<ScheduledTask, TimerError> {
        tracing::debug!("[login] [reaper_started] interval_ms={}", interval.as_millis());
        timer.schedule_repeating(
            Arc::new(move || {
                disconnect_idles_on_login_state(&admission, Instant::now());
            }),
            interval,
            interval,
        )
    }
}
