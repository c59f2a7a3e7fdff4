//! Mob status scheduler
//!
//! Status effects expire through the underlying `DelayEngine`. Periodic
//! effects (poison ticks, regeneration) do not get a timer of their own;
//! each keeps a counter that advances once per engine tick and fires its
//! action every `ceil(delay / tick)` ticks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Action, DelayEngine, Registration, RemovedBatch, SchedulerListener, SchedulerSettings};
use crate::timer::{TimerError, TimerManager};

/// Repeating action attached to a status effect.
pub type OvertimeAction = Arc<dyn Fn() + Send + Sync + 'static>;

struct OvertimeEntry {
    proc_count: u32,
    proc_limit: u32,
    action: OvertimeAction,
}

impl OvertimeEntry {
    fn new(delay: Duration, tick: Duration, action: OvertimeAction) -> Self {
        let tick_ms = tick.as_millis().max(1);
        let limit = delay.as_millis().div_ceil(tick_ms);
        Self {
            proc_count: 0,
            proc_limit: u32::try_from(limit).unwrap_or(u32::MAX),
            action,
        }
    }

    /// Advance one tick. True when the action is due.
    fn update(&mut self) -> bool {
        self.proc_count += 1;
        if self.proc_count >= self.proc_limit {
            self.proc_count = 0;
            return true;
        }
        false
    }
}

type OvertimeMap<K> = Arc<Mutex<HashMap<K, OvertimeEntry>>>;

struct OvertimeListener<K> {
    overtime: OvertimeMap<K>,
}

impl<K> SchedulerListener<K> for OvertimeListener<K>
where
    K: Eq + Hash + Send + Sync,
{
    fn removed_scheduled_entries(&self, batch: RemovedBatch<'_, K>, deferred: &mut Vec<Action>) {
        let mut overtime = self.overtime.lock();
        for key in batch.keys {
            overtime.remove(key);
        }

        if batch.tick {
            for entry in overtime.values_mut() {
                if entry.update() {
                    let action = entry.action.clone();
                    deferred.push(Box::new(move || action()));
                }
            }
        }
    }
}

pub struct MobStatusScheduler<K> {
    engine: Arc<DelayEngine<K>>,
    overtime: OvertimeMap<K>,
}

impl<K> MobStatusScheduler<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(timer: TimerManager, settings: SchedulerSettings) -> Self {
        let engine = DelayEngine::new("mob_status", timer, settings);
        let overtime: OvertimeMap<K> = Arc::new(Mutex::new(HashMap::new()));
        engine.add_listener(Arc::new(OvertimeListener {
            overtime: overtime.clone(),
        }));
        Self { engine, overtime }
    }

    /// Register a status effect that ends after `duration`.
    ///
    /// With `overtime` set, its action also runs every `overtime_delay`,
    /// rounded up to whole ticks, until the effect ends.
    pub fn register_mob_status(
        &self,
        key: K,
        cancel_status: Action,
        duration: Duration,
        overtime: Option<OvertimeAction>,
        overtime_delay: Duration,
    ) -> Result<Registration, TimerError> {
        let tick = self.engine.settings().tick_interval;
        let overtime_map = &self.overtime;
        let update_key = key.clone();
        // lock order: engine, then overtime
        self.engine.register_entry_with(key, cancel_status, duration, move || {
            let mut map = overtime_map.lock();
            match overtime {
                Some(action) => {
                    map.insert(update_key, OvertimeEntry::new(overtime_delay, tick, action));
                }
                None => {
                    map.remove(&update_key);
                }
            }
        })
    }

    /// End a status effect early. Its cancel action does not run.
    pub fn interrupt_mob_status(&self, key: &K) -> bool {
        self.engine.interrupt_entry(key)
    }

    pub fn engine(&self) -> &Arc<DelayEngine<K>> {
        &self.engine
    }

    pub fn overtime_count(&self) -> usize {
        self.overtime.lock().len()
    }

    pub fn dispose(&self) {
        self.engine.dispose();
    }
}
