//! Server-wide session and world registry
//!
//! Tracks which world every known character lives in, which characters each
//! account owns, and the per-world character views shown on the character
//! select screen. One reader/writer lock covers all of these together, so
//! the indexes and the views change in a single critical section.
//!
//! Guilds, login admission and disease announcements keep their own locks.
//! No registry operation holds two of these locks at once. A first login
//! holds its account's load gate while it takes the index lock.

pub mod admission;
pub mod announce;
pub mod guild;
pub mod reaper;
pub mod store;
pub mod world;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use crate::session::{ClientSession, SessionHandle, SessionId};

pub use admission::LoginAdmission;
pub use guild::{Alliance, Guild, GuildCache, GuildMember, GuildRequester, SharedGuild};
pub use store::{CharacterStore, GuildStore, MemoryStore};
pub use world::World;

pub type AccountId = i32;
pub type CharacterId = i32;
pub type GuildId = i32;
pub type AllianceId = i32;
pub type WorldId = u8;

/// Character select snapshot of one character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterEntry {
    pub id: CharacterId,
    pub account_id: AccountId,
    pub world: WorldId,
    pub name: String,
    pub level: u16,
    pub job: u16,
    pub gm_level: u8,
}

impl CharacterEntry {
    pub fn new(id: CharacterId, account_id: AccountId, world: WorldId, name: impl Into<String>) -> Self {
        Self {
            id,
            account_id,
            world,
            name: name.into(),
            level: 1,
            job: 0,
            gm_level: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Account {0} has no loaded character set")]
    AccountNotLoaded(AccountId),

    #[error("World {0} is not hosted by this server")]
    UnknownWorld(WorldId),

    #[error("Character {0} is not registered in any world")]
    CharacterNotRegistered(CharacterId),
}

/// Per-world character lists for the character select screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountCharlist {
    pub total: usize,
    /// List of the last world (by id) where the account has characters.
    pub last_world_chars: Option<Vec<CharacterEntry>>,
    /// Only worlds holding at least one character, in world order.
    pub worlds: Vec<(WorldId, Vec<CharacterEntry>)>,
}

struct LoginIndex {
    account_chars: HashMap<AccountId, HashSet<CharacterId>>,
    character_worlds: HashMap<CharacterId, WorldId>,
    transitioning: HashMap<IpAddr, CharacterId>,
    worlds: Vec<World>,
}

impl LoginIndex {
    fn world_mut(&mut self, world: WorldId) -> Result<&mut World, RegistryError> {
        self.worlds
            .get_mut(usize::from(world))
            .ok_or(RegistryError::UnknownWorld(world))
    }

    /// Highest gm level among the account's cached characters.
    ///
    /// `None` when the account's characters were never loaded.
    fn cached_gm_level(&self, account: AccountId) -> Option<u8> {
        let chars = self.account_chars.get(&account)?;
        let level = chars
            .iter()
            .filter_map(|id| {
                let world = self.character_worlds.get(id)?;
                self.worlds
                    .get(usize::from(*world))?
                    .account_character(account, *id)
                    .map(|c| c.gm_level)
            })
            .max()
            .unwrap_or(0);
        Some(level)
    }

    /// Install a freshly loaded roster. Returns the highest gm level in it.
    fn apply_account_characters(&mut self, account: AccountId, chars: Vec<CharacterEntry>) -> u8 {
        let mut per_world: Vec<Vec<CharacterEntry>> = vec![Vec::new(); self.worlds.len()];
        let mut ids = HashSet::with_capacity(chars.len());
        let mut gm_level = 0;

        for chr in chars {
            let Some(list) = per_world.get_mut(usize::from(chr.world)) else {
                tracing::warn!(
                    "[registry] [skip_character] account={} character={} world={}",
                    account,
                    chr.id,
                    chr.world
                );
                continue;
            };
            gm_level = gm_level.max(chr.gm_level);
            ids.insert(chr.id);
            self.character_worlds.insert(chr.id, chr.world);
            list.push(chr);
        }

        for (world, list) in self.worlds.iter_mut().zip(per_world) {
            world.load_account_characters_view(account, list);
        }
        self.account_chars.insert(account, ids);
        gm_level
    }
}

pub struct Registry {
    index: RwLock<LoginIndex>,
    /// First-login gates, one per account with a load in flight.
    load_gates: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
    characters: Arc<dyn CharacterStore>,
    guilds: GuildCache,
    admission: Arc<LoginAdmission>,
}

impl Registry {
    pub fn new(
        worlds: Vec<World>,
        characters: Arc<dyn CharacterStore>,
        guilds: Arc<dyn GuildStore>,
        login_timeout: Duration,
    ) -> Self {
        Self {
            index: RwLock::new(LoginIndex {
                account_chars: HashMap::new(),
                character_worlds: HashMap::new(),
                transitioning: HashMap::new(),
                worlds,
            }),
            load_gates: Mutex::new(HashMap::new()),
            characters,
            guilds: GuildCache::new(guilds),
            admission: Arc::new(LoginAdmission::new(login_timeout)),
        }
    }

    pub fn world_count(&self) -> usize {
        self.index.read().worlds.len()
    }

    /// Run `f` against a world under the reader lock.
    pub fn with_world<R>(&self, world: WorldId, f: impl FnOnce(&World) -> R) -> Option<R> {
        self.index.read().worlds.get(usize::from(world)).map(f)
    }

    /// Recommendation reason of every world that has one, in world order.
    pub fn world_recommended_list(&self) -> Vec<(WorldId, String)> {
        self.index
            .read()
            .worlds
            .iter()
            .filter(|w| !w.recommended().is_empty())
            .map(|w| (w.id(), w.recommended().to_string()))
            .collect()
    }

    pub fn get_character_world(&self, character: CharacterId) -> Option<WorldId> {
        self.index.read().character_worlds.get(&character).copied()
    }

    pub fn have_character_entry(&self, account: AccountId, character: CharacterId) -> Result<bool, RegistryError> {
        let index = self.index.read();
        match index.account_chars.get(&account) {
            Some(chars) => Ok(chars.contains(&character)),
            None => Err(violation(RegistryError::AccountNotLoaded(account))),
        }
    }

    /// Ids of the account's characters across all worlds, if loaded.
    pub fn account_character_entries(&self, account: AccountId) -> Option<Vec<CharacterId>> {
        let index = self.index.read();
        let mut ids: Vec<_> = index.account_chars.get(&account)?.iter().copied().collect();
        ids.sort_unstable();
        Some(ids)
    }

    pub fn create_character_entry(&self, chr: &CharacterEntry) -> Result<(), RegistryError> {
        let mut index = self.index.write();
        if usize::from(chr.world) >= index.worlds.len() {
            return Err(violation(RegistryError::UnknownWorld(chr.world)));
        }
        let Some(chars) = index.account_chars.get_mut(&chr.account_id) else {
            return Err(violation(RegistryError::AccountNotLoaded(chr.account_id)));
        };

        chars.insert(chr.id);
        index.character_worlds.insert(chr.id, chr.world);
        index.world_mut(chr.world)?.register_account_character_view(chr.clone());
        tracing::debug!(
            "[registry] [created] account={} character={} world={}",
            chr.account_id,
            chr.id,
            chr.world
        );
        Ok(())
    }

    /// Refresh the character select view after the live character changed.
    pub fn update_character_entry(&self, chr: &CharacterEntry) -> Result<(), RegistryError> {
        let mut index = self.index.write();
        let Some(world) = index.character_worlds.get(&chr.id).copied() else {
            return Err(violation(RegistryError::CharacterNotRegistered(chr.id)));
        };

        let mut view = chr.clone();
        view.world = world;
        if !index.world_mut(world)?.update_character_view(&view) {
            return Err(violation(RegistryError::CharacterNotRegistered(chr.id)));
        }
        Ok(())
    }

    pub fn delete_character_entry(&self, account: AccountId, character: CharacterId) -> Result<(), RegistryError> {
        let mut index = self.index.write();
        let Some(chars) = index.account_chars.get_mut(&account) else {
            return Err(violation(RegistryError::AccountNotLoaded(account)));
        };
        chars.remove(&character);

        if let Some(world) = index.character_worlds.remove(&character) {
            if let Some(w) = index.worlds.get_mut(usize::from(world)) {
                w.unregister_account_character_view(account, character);
            }
        }
        tracing::debug!("[registry] [deleted] account={} character={}", account, character);
        Ok(())
    }

    /// Move a character's registration to `new_world`.
    ///
    /// Call before the live character's own world field is changed.
    pub fn transfer_world_character_entry(&self, chr: &CharacterEntry, new_world: WorldId) -> Result<(), RegistryError> {
        let mut index = self.index.write();
        if usize::from(new_world) >= index.worlds.len() {
            return Err(violation(RegistryError::UnknownWorld(new_world)));
        }

        let old_world = index.character_worlds.get(&chr.id).copied().unwrap_or(chr.world);
        if let Some(w) = index.worlds.get_mut(usize::from(old_world)) {
            w.unregister_account_character_view(chr.account_id, chr.id);
        }
        index.character_worlds.insert(chr.id, new_world);

        let mut moved = chr.clone();
        moved.world = new_world;
        index.world_mut(new_world)?.register_account_character_view(moved);
        tracing::info!(
            "[registry] [transferred] character={} from={} to={}",
            chr.id,
            old_world,
            new_world
        );
        Ok(())
    }

    /// Make the account's characters known and set the session's gm level.
    ///
    /// Persistence is read only the first time an account logs in. Concurrent
    /// first logins of one account wait on a per-account gate, so only one of
    /// them reads persistence and the rest find the roster cached. Returns
    /// true when this call performed that load.
    pub async fn load_account_characters(&self, session: &dyn ClientSession) -> bool {
        let account = session.account_id();

        let cached = self.index.read().cached_gm_level(account);
        if let Some(gm_level) = cached {
            session.set_gm_level(gm_level);
            return false;
        }

        let gate = self.load_gates.lock().entry(account).or_default().clone();
        let _loading = gate.lock().await;

        let cached = self.index.read().cached_gm_level(account);
        if let Some(gm_level) = cached {
            tracing::debug!("[registry] [load_joined] account={}", account);
            session.set_gm_level(gm_level);
            return false;
        }

        let world_count = self.world_count();
        let chars = match self.characters.load_account_characters(account, world_count).await {
            Ok(chars) => chars,
            Err(e) => {
                tracing::warn!("[registry] [load_failed] account={} error={:#}", account, e);
                Vec::new()
            }
        };

        let count = chars.len();
        let gm_level = self.index.write().apply_account_characters(account, chars);
        tracing::debug!("[registry] [first_login] account={} characters={}", account, count);

        {
            let mut gates = self.load_gates.lock();
            if gates.get(&account).is_some_and(|g| Arc::ptr_eq(g, &gate)) {
                gates.remove(&account);
            }
        }

        session.set_gm_level(gm_level);
        true
    }

    /// Collect the account's characters grouped by world.
    ///
    /// An account never seen in a world without a view gets an empty
    /// character set. The lists are read under the reader lock; the writer
    /// lock is taken only when that set has to be created.
    pub fn load_account_charlist(&self, account: AccountId) -> AccountCharlist {
        let mut charlist = AccountCharlist::default();
        let mut needs_set = false;
        {
            let index = self.index.read();
            for world in &index.worlds {
                match world.account_characters_view(account) {
                    None => {
                        if !index.account_chars.contains_key(&account) {
                            needs_set = true;
                        }
                    }
                    Some(chars) if !chars.is_empty() => {
                        charlist.total += chars.len();
                        charlist.last_world_chars = Some(chars.clone());
                        charlist.worlds.push((world.id(), chars));
                    }
                    Some(_) => {}
                }
            }
        }

        if needs_set {
            self.index.write().account_chars.entry(account).or_default();
        }
        charlist
    }

    /// Forget the account's roster so the next login reads persistence again.
    ///
    /// Returns the number of characters dropped.
    pub fn unload_account_characters(&self, account: AccountId) -> usize {
        let mut index = self.index.write();
        let Some(chars) = index.account_chars.remove(&account) else {
            return 0;
        };
        for id in &chars {
            index.character_worlds.remove(id);
        }
        for world in index.worlds.iter_mut() {
            world.clear_account_characters_view(account);
        }
        tracing::debug!("[registry] [unloaded] account={} characters={}", account, chars.len());
        chars.len()
    }

    /// Remember which character the client at `addr` is switching to.
    pub fn set_character_in_transition(&self, addr: SocketAddr, character: CharacterId) {
        self.index.write().transitioning.insert(addr.ip(), character);
    }

    /// Consume the pending transition for `addr`. True only if it names `character`.
    pub fn validate_character_in_transition(&self, addr: SocketAddr, character: CharacterId) -> bool {
        let pending = self.index.write().transitioning.remove(&addr.ip());
        pending == Some(character)
    }

    pub fn guilds(&self) -> &GuildCache {
        &self.guilds
    }

    /// Cached guild only.
    pub async fn get_guild(&self, id: GuildId) -> Option<SharedGuild> {
        self.guilds.get_guild(id).await
    }

    /// Cached guild, loading it on a miss.
    pub async fn get_guild_loading(
        &self,
        id: GuildId,
        world: WorldId,
        requester: Option<GuildRequester>,
    ) -> Option<SharedGuild> {
        self.guilds.get_guild_loading(id, world, requester).await
    }

    pub fn admission(&self) -> &Arc<LoginAdmission> {
        &self.admission
    }

    pub fn register_login_state(&self, session: SessionHandle) {
        self.admission.register_login_state(session);
    }

    pub fn unregister_login_state(&self, session: SessionId) -> bool {
        self.admission.unregister_login_state(session)
    }
}

fn violation(err: RegistryError) -> RegistryError {
    tracing::error!("[registry] [precondition] {}", err);
    err
}
