//! Keyed delayed-removal scheduler
//!
//! A `DelayEngine` maps opaque keys to a pending removal action. Entries are
//! checked on one shared periodic tick; an entry whose expiry has passed runs
//! its action exactly once. Interrupting an entry removes it silently.
//!
//! Listeners see every removal batch, tagged with whether the batch came from
//! a periodic tick. They run with the engine lock held and must push any work
//! that calls back into the engine onto the `deferred` list instead.

pub mod mob_status;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::timer::{run_isolated, ScheduledTask, TimerError, TimerManager};

pub use mob_status::MobStatusScheduler;

/// One-shot action owned by a scheduled entry.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Default check interval (ms), shared by every scheduler.
pub const MOB_STATUS_MONITOR_PROC: u64 = 200;

/// Default number of empty ticks before a scheduler stops its timer.
pub const MOB_STATUS_MONITOR_LIFE: u32 = 84;

/// Tick settings for a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub idle_tick_limit: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(MOB_STATUS_MONITOR_PROC),
            idle_tick_limit: MOB_STATUS_MONITOR_LIFE,
        }
    }
}

impl From<&ServerConfig> for SchedulerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.mob_status_monitor_proc),
            idle_tick_limit: config.mob_status_monitor_life,
        }
    }
}

/// Result of `register_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// A pending entry with the same key was dropped without running.
    Replaced,
}

/// Keys removed together, plus whether a periodic tick produced them.
#[derive(Debug, Clone, Copy)]
pub struct RemovedBatch<'a, K> {
    pub keys: &'a [K],
    pub tick: bool,
}

pub trait SchedulerListener<K>: Send + Sync {
    /// Called with the engine lock held, once per tick (possibly with no
    /// keys) and once per interruption.
    fn removed_scheduled_entries(&self, batch: RemovedBatch<'_, K>, deferred: &mut Vec<Action>);
}

struct ScheduledEntry {
    cancel_action: Action,
    expiry: Instant,
}

struct EngineState<K> {
    entries: HashMap<K, ScheduledEntry>,
    listeners: Vec<Arc<dyn SchedulerListener<K>>>,
    idle_ticks: u32,
    task: Option<ScheduledTask>,
}

pub struct DelayEngine<K> {
    name: &'static str,
    timer: TimerManager,
    settings: SchedulerSettings,
    state: Mutex<EngineState<K>>,
    this: Weak<Self>,
}

impl<K> DelayEngine<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, timer: TimerManager, settings: SchedulerSettings) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            timer,
            settings,
            state: Mutex::new(EngineState {
                entries: HashMap::new(),
                listeners: Vec::new(),
                idle_ticks: 0,
                task: None,
            }),
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.settings
    }

    pub fn add_listener(&self, listener: Arc<dyn SchedulerListener<K>>) {
        self.state.lock().listeners.push(listener);
    }

    /// Schedule `cancel_action` to run once after `delay`.
    pub fn register_entry(
        &self,
        key: K,
        cancel_action: Action,
        delay: Duration,
    ) -> Result<Registration, TimerError> {
        self.register_entry_with(key, cancel_action, delay, || {})
    }

    /// Like `register_entry`, running `on_insert` under the engine lock just
    /// before the entry goes in. A tick never lands between the two.
    ///
    /// `on_insert` runs only when the entry is stored. It must not call back
    /// into this engine.
    pub fn register_entry_with<F>(
        &self,
        key: K,
        cancel_action: Action,
        delay: Duration,
        on_insert: F,
    ) -> Result<Registration, TimerError>
    where
        F: FnOnce(),
    {
        let mut state = self.state.lock();
        state.idle_ticks = 0;

        if state.task.is_none() {
            state.task = Some(self.start_ticking()?);
            tracing::debug!("[{}] [tick_started] interval_ms={}", self.name, self.settings.tick_interval.as_millis());
        }

        let entry = ScheduledEntry {
            cancel_action,
            expiry: Instant::now() + delay,
        };
        on_insert();
        match state.entries.insert(key, entry) {
            Some(_) => {
                tracing::debug!("[{}] [entry_replaced] pending={}", self.name, state.entries.len());
                Ok(Registration::Replaced)
            }
            None => Ok(Registration::Created),
        }
    }

    /// Remove a pending entry without running its action.
    ///
    /// Returns false if the key had nothing pending.
    pub fn interrupt_entry(&self, key: &K) -> bool {
        let deferred = {
            let mut state = self.state.lock();
            if state.entries.remove(key).is_none() {
                return false;
            }

            let keys = [key.clone()];
            Self::dispatch(&state, &keys, false)
        };

        self.run_deferred(deferred);
        true
    }

    /// Drop every pending entry without running it and stop the tick.
    pub fn dispose(&self) {
        let deferred = {
            let mut state = self.state.lock();
            if let Some(task) = state.task.take() {
                task.cancel();
            }
            let keys: Vec<K> = state.entries.drain().map(|(k, _)| k).collect();
            if keys.is_empty() {
                return;
            }
            tracing::debug!("[{}] [disposed] dropped={}", self.name, keys.len());
            Self::dispatch(&state, &keys, false)
        };

        self.run_deferred(deferred);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True while the periodic tick is scheduled.
    pub fn is_ticking(&self) -> bool {
        self.state.lock().task.is_some()
    }

    /// Run one tick as of `now`.
    pub fn run_tick_at(&self, now: Instant) {
        let (expired, deferred) = {
            let mut state = self.state.lock();

            if state.entries.is_empty() {
                state.idle_ticks += 1;
                if state.idle_ticks >= self.settings.idle_tick_limit {
                    if let Some(task) = state.task.take() {
                        task.cancel();
                        tracing::debug!("[{}] [tick_stopped] idle_ticks={}", self.name, state.idle_ticks);
                    }
                }
                return;
            }
            state.idle_ticks = 0;

            let keys: Vec<K> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.expiry <= now)
                .map(|(key, _)| key.clone())
                .collect();

            let mut expired = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(entry) = state.entries.remove(key) {
                    expired.push(entry.cancel_action);
                }
            }

            let deferred = Self::dispatch(&state, &keys, true);
            (expired, deferred)
        };

        if !expired.is_empty() {
            tracing::trace!("[{}] [expired] count={}", self.name, expired.len());
        }
        for action in expired {
            run_isolated(self.name, action);
        }
        self.run_deferred(deferred);
    }

    fn dispatch(state: &EngineState<K>, keys: &[K], tick: bool) -> Vec<Action> {
        let mut deferred = Vec::new();
        for listener in &state.listeners {
            listener.removed_scheduled_entries(RemovedBatch { keys, tick }, &mut deferred);
        }
        deferred
    }

    fn run_deferred(&self, deferred: Vec<Action>) {
        for action in deferred {
            run_isolated(self.name, action);
        }
    }

    fn start_ticking(&self) -> Result<ScheduledTask, TimerError> {
        let engine = self.this.clone();
        let interval = self.settings.tick_interval;
        self.timer.schedule_repeating(
            Arc::new(move || {
                if let Some(engine) = engine.upgrade() {
                    engine.run_tick_at(Instant::now());
                }
            }),
            interval,
            interval,
        )
    }
}

impl<K> Drop for DelayEngine<K> {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(tick_ms: u64, idle: u32) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(tick_ms),
            idle_tick_limit: idle,
        }
    }

    fn counting_action(count: &Arc<AtomicUsize>) -> Action {
        let c = count.clone();
        Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[derive(Default)]
    struct RecordingListener {
        batches: Mutex<Vec<(Vec<u32>, bool)>>,
    }

    impl SchedulerListener<u32> for RecordingListener {
        fn removed_scheduled_entries(&self, batch: RemovedBatch<'_, u32>, _deferred: &mut Vec<Action>) {
            let mut keys = batch.keys.to_vec();
            keys.sort();
            self.batches.lock().push((keys, batch.tick));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_before_expiry_never_runs() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let count = Arc::new(AtomicUsize::new(0));

        engine.register_entry(7u32, counting_action(&count), Duration::from_millis(500)).unwrap();
        assert!(engine.interrupt_entry(&7));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_runs_exactly_once() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let count = Arc::new(AtomicUsize::new(0));

        engine.register_entry(1u32, counting_action(&count), Duration::from_millis(1000)).unwrap();

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!engine.interrupt_entry(&1));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_drops_previous_action() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let t0 = Instant::now();

        assert_eq!(
            engine.register_entry(3u32, counting_action(&first), Duration::from_millis(200)).unwrap(),
            Registration::Created
        );
        assert_eq!(
            engine.register_entry(3u32, counting_action(&second), Duration::from_millis(400)).unwrap(),
            Registration::Replaced
        );

        engine.run_tick_at(t0 + Duration::from_millis(300));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        engine.run_tick_at(t0 + Duration::from_millis(400));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_sees_tick_and_interrupt_batches() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let listener = Arc::new(RecordingListener::default());
        engine.add_listener(listener.clone());
        let noop = Arc::new(AtomicUsize::new(0));
        let t0 = Instant::now();

        engine.register_entry(1u32, counting_action(&noop), Duration::from_millis(100)).unwrap();
        engine.register_entry(2u32, counting_action(&noop), Duration::from_millis(100)).unwrap();
        engine.register_entry(3u32, counting_action(&noop), Duration::from_millis(900)).unwrap();

        engine.run_tick_at(t0 + Duration::from_millis(50));
        engine.run_tick_at(t0 + Duration::from_millis(150));
        engine.interrupt_entry(&3);
        engine.interrupt_entry(&3);

        let batches = listener.batches.lock().clone();
        assert_eq!(
            batches,
            vec![(vec![], true), (vec![1, 2], true), (vec![3], false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_does_not_block_others() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let count = Arc::new(AtomicUsize::new(0));
        let t0 = Instant::now();

        engine.register_entry(1u32, Box::new(|| panic!("bad cancel")), Duration::ZERO).unwrap();
        engine.register_entry(2u32, counting_action(&count), Duration::ZERO).unwrap();
        engine.register_entry(3u32, counting_action(&count), Duration::ZERO).unwrap();

        engine.run_tick_at(t0 + Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_may_reregister_its_key() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let count = Arc::new(AtomicUsize::new(0));
        let t0 = Instant::now();

        let again = engine.clone();
        let c = count.clone();
        engine
            .register_entry(
                9u32,
                Box::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    let c2 = c.clone();
                    let _ = again.register_entry(
                        9,
                        Box::new(move || {
                            c2.fetch_add(1, Ordering::SeqCst);
                        }),
                        Duration::from_secs(60),
                    );
                }),
                Duration::ZERO,
            )
            .unwrap();

        engine.run_tick_at(t0 + Duration::from_millis(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(engine.contains(&9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ticks_stop_and_registration_restarts() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 3));
        let count = Arc::new(AtomicUsize::new(0));

        engine.register_entry(1u32, counting_action(&count), Duration::from_millis(50)).unwrap();
        assert!(engine.is_ticking());

        // tick at 100 expires the entry, then 200/300/400 are idle
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!engine.is_ticking());

        engine.register_entry(2u32, counting_action(&count), Duration::from_millis(50)).unwrap();
        assert!(engine.is_ticking());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_drops_everything_silently() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let listener = Arc::new(RecordingListener::default());
        engine.add_listener(listener.clone());
        let count = Arc::new(AtomicUsize::new(0));

        engine.register_entry(1u32, counting_action(&count), Duration::from_millis(100)).unwrap();
        engine.register_entry(2u32, counting_action(&count), Duration::from_millis(100)).unwrap();
        engine.dispose();

        assert!(!engine.is_ticking());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(listener.batches.lock().clone(), vec![(vec![1, 2], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_on_stopped_timer_fails() {
        let timer = TimerManager::current().unwrap();
        let engine = DelayEngine::new("test", timer.clone(), settings(100, 10));
        timer.stop();

        let count = Arc::new(AtomicUsize::new(0));
        let result = engine.register_entry(1u32, counting_action(&count), Duration::from_millis(10));
        assert!(matches!(result, Err(TimerError::Stopped)));
        assert_eq!(engine.pending_count(), 0);

        let hooked = AtomicUsize::new(0);
        let result = engine.register_entry_with(2u32, Box::new(|| {}), Duration::ZERO, || {
            hooked.fetch_add(1, Ordering::SeqCst);
        });
        assert!(result.is_err());
        assert_eq!(hooked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_hook_runs_with_entry_in_place() {
        let engine = DelayEngine::new("test", TimerManager::current().unwrap(), settings(100, 10));
        let count = Arc::new(AtomicUsize::new(0));

        let hooked = AtomicUsize::new(0);
        let result = engine.register_entry_with(1u32, counting_action(&count), Duration::from_millis(50), || {
            hooked.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Ok(Registration::Created)));
        assert_eq!(hooked.load(Ordering::SeqCst), 1);
        assert!(engine.contains(&1));
    }
}
