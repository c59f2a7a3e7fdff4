//! Server lifecycle
//!
//! `ServerContext` owns everything with server lifetime: the timer pool, the
//! registry, the disease-announce queue and the periodic tasks. There is no
//! global instance; restarting means shutting one context down and starting
//! a fresh one from the same configuration.

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::config::ServerConfig;
use crate::registry::announce::AnnounceQueue;
use crate::registry::reaper::IdleLoginReaper;
use crate::registry::{CharacterStore, GuildStore, Registry, World, WorldId};
use crate::scheduler::{MobStatusScheduler, SchedulerSettings};
use crate::session::SessionHandle;
use crate::timer::TimerManager;

/// Type alias for termination callback functions
/// These are called once the server has shut down
pub type TermFunc = Box<dyn Fn() + Send + 'static>;

/// Persistence backends handed to every context built from them.
#[derive(Clone)]
pub struct Stores {
    pub characters: Arc<dyn CharacterStore>,
    pub guilds: Arc<dyn GuildStore>,
}

impl Stores {
    pub fn new(characters: Arc<dyn CharacterStore>, guilds: Arc<dyn GuildStore>) -> Self {
        Self { characters, guilds }
    }
}

pub struct ServerContext {
    config: ServerConfig,
    stores: Stores,
    timer: TimerManager,
    registry: Arc<Registry>,
    announce: Arc<AnnounceQueue>,
    online: AtomicBool,
    shutdown_requested: AtomicBool,
    shutdown_notify: Notify,
    term_func: Mutex<Option<TermFunc>>,
}

impl ServerContext {
    /// Build the worlds and start the periodic server tasks on the current runtime.
    pub fn start(config: ServerConfig, stores: Stores) -> Result<Arc<Self>> {
        let handle = Handle::try_current().context("ServerContext::start needs a tokio runtime")?;
        let timer = TimerManager::start(handle);

        let worlds: Vec<World> = config
            .worlds
            .iter()
            .enumerate()
            .map(|(i, w)| -> Result<World> {
                let id = WorldId::try_from(i).context("world index out of range")?;
                tracing::info!("[server] [world] id={} name={} channels={}", id, w.name, w.channels);
                Ok(World::from_config(id, w))
            })
            .collect::<Result<Vec<World>>>()?;

        let registry = Arc::new(Registry::new(
            worlds,
            stores.characters.clone(),
            stores.guilds.clone(),
            config.login_timeout(),
        ));
        let announce = Arc::new(AnnounceQueue::new());

        {
            let purger = timer.clone();
            timer
                .schedule_repeating(
                    Arc::new(move || {
                        purger.purge();
                    }),
                    config.purging_interval(),
                    config.purging_interval(),
                )
                .context("scheduling timer purge")?;
        }
        IdleLoginReaper::start(&timer, registry.admission().clone(), config.idle_login_check_interval())
            .context("scheduling idle login reaper")?;
        announce
            .start(&timer, config.update_interval())
            .context("scheduling disease announcements")?;

        tracing::info!("[server] [online] worlds={}", config.worlds.len());
        Ok(Arc::new(Self {
            config,
            stores,
            timer,
            registry,
            announce,
            online: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            term_func: Mutex::new(None),
        }))
    }

    /// Stop every task and run the termination callback. Idempotent.
    pub fn shutdown(&self) {
        if !self.online.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("[server] [shutdown]");
        self.timer.purge();
        self.timer.stop();
        self.call_term_func();
    }

    /// Shut this context down and start a fresh one with the same configuration and stores.
    ///
    /// The termination callback is not carried over.
    pub fn restart(&self) -> Result<Arc<Self>> {
        tracing::info!("[server] [restart]");
        self.shutdown();
        Self::start(self.config.clone(), self.stores.clone())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Request server shutdown. Wakes `run_until_shutdown`.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Check if shutdown has been requested
    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait until a shutdown is requested, then shut down.
    pub async fn run_until_shutdown(&self) {
        loop {
            let requested = self.shutdown_notify.notified();
            if self.should_shutdown() {
                break;
            }
            requested.await;
        }
        tracing::info!("[server] [shutdown_requested]");
        self.shutdown();
    }

    /// Set the termination callback function
    pub fn set_term_func<F>(&self, func: F)
    where
        F: Fn() + Send + 'static,
    {
        *self.term_func.lock() = Some(Box::new(func));
    }

    /// Call the termination function if set
    pub fn call_term_func(&self) {
        if let Some(ref func) = *self.term_func.lock() {
            func();
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn timer(&self) -> &TimerManager {
        &self.timer
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn register_announce_player_diseases(&self, session: SessionHandle) {
        self.announce.register_announce_player_diseases(session);
    }

    /// A mob status scheduler driven by this server's timer and tick settings.
    pub fn mob_status_scheduler<K>(&self) -> MobStatusScheduler<K>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
    {
        MobStatusScheduler::new(self.timer.clone(), SchedulerSettings::from(&self.config))
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        if self.online.load(Ordering::SeqCst) {
            self.timer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use crate::session::TestSession;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> ServerConfig {
        ServerConfig::from_str(
            r#"
sql_ip: "127.0.0.1"
sql_id: "user"
sql_pw: "pass"
sql_db: "testdb"
worlds:
  - name: Scania
  - name: Bera
    channels: 2
update_interval: 100
"#,
        )
        .unwrap()
    }

    fn stores() -> Stores {
        let store = Arc::new(MemoryStore::new());
        Stores::new(store.clone(), store)
    }

    #[tokio::test]
    async fn test_start_builds_worlds() {
        let server = ServerContext::start(config(), stores()).unwrap();

        assert!(server.is_online());
        assert_eq!(server.registry().world_count(), 2);
        assert_eq!(server.registry().with_world(1, |w| w.channels()), Some(2));
        // purge, reaper, announce
        assert_eq!(server.timer().task_count(), 3);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        assert!(ServerContext::start(config(), stores()).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_timer_and_calls_term_func() {
        let server = ServerContext::start(config(), stores()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        server.set_term_func(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        server.shutdown();
        server.shutdown();

        assert!(!server.is_online());
        assert!(server.timer().is_stopped());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_request_flag() {
        let server = ServerContext::start(config(), stores()).unwrap();
        assert!(!server.should_shutdown());
        server.request_shutdown();
        assert!(server.should_shutdown());
        assert!(server.is_online());
    }

    #[tokio::test]
    async fn test_shutdown_request_ends_run_loop() {
        let server = ServerContext::start(config(), stores()).unwrap();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run_until_shutdown().await })
        };

        tokio::task::yield_now().await;
        assert!(server.is_online());
        server.request_shutdown();

        tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
        assert!(!server.is_online());
        assert!(server.timer().is_stopped());
    }

    #[tokio::test]
    async fn test_run_loop_returns_at_once_when_already_requested() {
        let server = ServerContext::start(config(), stores()).unwrap();
        server.request_shutdown();

        tokio::time::timeout(Duration::from_secs(5), server.run_until_shutdown()).await.unwrap();
        assert!(!server.is_online());
    }

    #[tokio::test]
    async fn test_restart_builds_fresh_context() {
        let server = ServerContext::start(config(), stores()).unwrap();
        server.registry().set_character_in_transition("10.0.0.1:1".parse().unwrap(), 5);

        let fresh = server.restart().unwrap();
        assert!(!server.is_online());
        assert!(fresh.is_online());
        assert!(!fresh.timer().is_stopped());
        assert!(!fresh.registry().validate_character_in_transition("10.0.0.1:1".parse().unwrap(), 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disease_announcements_run_on_update_tick() {
        let server = ServerContext::start(config(), stores()).unwrap();
        let session = TestSession::new(1, 1, true);
        server.register_announce_player_diseases(SessionHandle::new(session.clone()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(session.announce_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mob_status_scheduler_uses_config_tick() {
        let server = ServerContext::start(config(), stores()).unwrap();
        let mobs = server.mob_status_scheduler::<u32>();
        assert_eq!(mobs.engine().settings().tick_interval, Duration::from_millis(200));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        mobs.register_mob_status(
            1,
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(300),
            None,
            Duration::ZERO,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
