//! Persistence boundary for the registry
//!
//! The registry only reads: account character rosters on first login and
//! guilds on a cache miss. `MemoryStore` backs tests and offline runs;
//! `database::MySqlStore` is the production implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::guild::Guild;
use super::{AccountId, CharacterEntry, GuildId, WorldId};

#[async_trait]
pub trait CharacterStore: Send + Sync {
    /// Every character of `account` whose world is below `world_count`.
    async fn load_account_characters(
        &self,
        account: AccountId,
        world_count: usize,
    ) -> Result<Vec<CharacterEntry>>;
}

#[async_trait]
pub trait GuildStore: Send + Sync {
    /// `Ok(None)` when no such guild exists.
    async fn load_guild(&self, id: GuildId, world: WorldId) -> Result<Option<Guild>>;
}

/// In-memory store with load counters.
#[derive(Default)]
pub struct MemoryStore {
    characters: Mutex<Vec<CharacterEntry>>,
    guilds: Mutex<HashMap<GuildId, Guild>>,
    character_loads: AtomicUsize,
    guild_loads: AtomicUsize,
    failing: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_character(&self, entry: CharacterEntry) {
        self.characters.lock().push(entry);
    }

    pub fn insert_guild(&self, guild: Guild) {
        self.guilds.lock().insert(guild.id, guild);
    }

    /// Make every load return an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every character load wait `delay` before answering.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock() = delay;
    }

    pub fn character_loads(&self) -> usize {
        self.character_loads.load(Ordering::SeqCst)
    }

    pub fn guild_loads(&self) -> usize {
        self.guild_loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CharacterStore for MemoryStore {
    async fn load_account_characters(
        &self,
        account: AccountId,
        world_count: usize,
    ) -> Result<Vec<CharacterEntry>> {
        self.character_loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "memory store is failing");

        let mut chars: Vec<CharacterEntry> = self
            .characters
            .lock()
            .iter()
            .filter(|c| c.account_id == account && usize::from(c.world) < world_count)
            .cloned()
            .collect();
        chars.sort_by_key(|c| (c.world, c.id));
        Ok(chars)
    }
}

#[async_trait]
impl GuildStore for MemoryStore {
    async fn load_guild(&self, id: GuildId, world: WorldId) -> Result<Option<Guild>> {
        self.guild_loads.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "memory store is failing");

        Ok(self
            .guilds
            .lock()
            .get(&id)
            .filter(|g| g.world == world)
            .cloned())
    }
}
