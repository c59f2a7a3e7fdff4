//! Guild and alliance caches
//!
//! At most one in-memory instance exists per guild id. A miss is loaded from
//! the `GuildStore` while the guild lock is held, so concurrent callers for
//! the same id wait and then share the loaded instance.
//!
//! Guilds and alliances have separate locks and no operation holds both.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::store::GuildStore;
use super::{AllianceId, CharacterId, GuildId, WorldId};

/// Alliance id stored on guilds that belong to none.
pub const NO_ALLIANCE: AllianceId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildMember {
    pub character_id: CharacterId,
    pub name: String,
    pub rank: u8,
    pub online: bool,
    pub channel: Option<u8>,
}

impl GuildMember {
    pub fn new(character_id: CharacterId, name: impl Into<String>, rank: u8) -> Self {
        Self {
            character_id,
            name: name.into(),
            rank,
            online: false,
            channel: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guild {
    pub id: GuildId,
    pub world: WorldId,
    pub name: String,
    pub leader_id: CharacterId,
    pub alliance_id: AllianceId,
    pub capacity: u32,
    pub notice: String,
    pub members: Vec<GuildMember>,
}

impl Guild {
    pub fn new(id: GuildId, world: WorldId, name: impl Into<String>, leader_id: CharacterId) -> Self {
        Self {
            id,
            world,
            name: name.into(),
            leader_id,
            alliance_id: NO_ALLIANCE,
            capacity: 10,
            notice: String::new(),
            members: Vec::new(),
        }
    }

    pub fn member(&self, character: CharacterId) -> Option<&GuildMember> {
        self.members.iter().find(|m| m.character_id == character)
    }

    /// False if `character` is not a member.
    pub fn set_online(&mut self, character: CharacterId, online: bool, channel: u8) -> bool {
        match self.members.iter_mut().find(|m| m.character_id == character) {
            Some(member) => {
                member.online = online;
                member.channel = online.then_some(channel);
                true
            }
            None => false,
        }
    }

    pub fn online_count(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }
}

pub type SharedGuild = Arc<RwLock<Guild>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alliance {
    pub id: AllianceId,
    pub name: String,
    pub capacity: u32,
    pub notice: String,
    pub rank_titles: Vec<String>,
    pub guilds: Vec<GuildId>,
}

impl Alliance {
    pub fn new(id: AllianceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            capacity: 2,
            notice: String::new(),
            rank_titles: ["Master", "Jr. Master", "Member", "Member", "Member"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            guilds: Vec::new(),
        }
    }
}

/// The character asking for a guild, marked online when it gets loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuildRequester {
    pub character_id: CharacterId,
    pub channel: u8,
}

pub struct GuildCache {
    guilds: tokio::sync::Mutex<HashMap<GuildId, SharedGuild>>,
    alliances: Mutex<HashMap<AllianceId, Alliance>>,
    store: Arc<dyn GuildStore>,
}

impl GuildCache {
    pub fn new(store: Arc<dyn GuildStore>) -> Self {
        Self {
            guilds: tokio::sync::Mutex::new(HashMap::with_capacity(100)),
            alliances: Mutex::new(HashMap::with_capacity(100)),
            store,
        }
    }

    /// Cached guild only, never loads.
    pub async fn get_guild(&self, id: GuildId) -> Option<SharedGuild> {
        self.guilds.lock().await.get(&id).cloned()
    }

    /// Cached guild, or load it from the store.
    ///
    /// Store errors and missing guilds both yield `None` and are not cached.
    pub async fn get_guild_loading(
        &self,
        id: GuildId,
        world: WorldId,
        requester: Option<GuildRequester>,
    ) -> Option<SharedGuild> {
        let mut guilds = self.guilds.lock().await;
        if let Some(guild) = guilds.get(&id) {
            return Some(guild.clone());
        }

        let mut guild = match self.store.load_guild(id, world).await {
            Ok(Some(guild)) => guild,
            Ok(None) => {
                tracing::debug!("[guild] [not_found] guild={} world={}", id, world);
                return None;
            }
            Err(e) => {
                tracing::warn!("[guild] [load_failed] guild={} world={} error={:#}", id, world, e);
                return None;
            }
        };

        if let Some(req) = requester {
            if !guild.set_online(req.character_id, true, req.channel) {
                tracing::warn!(
                    "[guild] [not_member] guild={} character={}",
                    id,
                    req.character_id
                );
            }
        }

        tracing::debug!("[guild] [loaded] guild={} members={}", id, guild.members.len());
        let shared = Arc::new(RwLock::new(guild));
        guilds.insert(id, shared.clone());
        Some(shared)
    }

    pub async fn get_guild_by_name(&self, name: &str) -> Option<SharedGuild> {
        let target = name.to_lowercase();
        self.guilds
            .lock()
            .await
            .values()
            .find(|g| g.read().name.to_lowercase() == target)
            .cloned()
    }

    /// Load if needed, then flag the member's presence.
    pub async fn set_guild_member_online(
        &self,
        id: GuildId,
        world: WorldId,
        character: CharacterId,
        online: bool,
        channel: u8,
    ) -> bool {
        let requester = GuildRequester { character_id: character, channel };
        match self.get_guild_loading(id, world, Some(requester)).await {
            Some(guild) => guild.write().set_online(character, online, channel),
            None => false,
        }
    }

    pub async fn set_guild_alliance_id(&self, id: GuildId, alliance: AllianceId) -> bool {
        match self.get_guild(id).await {
            Some(guild) => {
                guild.write().alliance_id = alliance;
                true
            }
            None => false,
        }
    }

    pub async fn disband_guild(&self, id: GuildId) -> Option<SharedGuild> {
        let removed = self.guilds.lock().await.remove(&id);
        if removed.is_some() {
            tracing::debug!("[guild] [disbanded] guild={}", id);
        }
        removed
    }

    pub async fn clear_guilds(&self) {
        let mut guilds = self.guilds.lock().await;
        tracing::debug!("[guild] [cleared] count={}", guilds.len());
        guilds.clear();
    }

    pub async fn guild_count(&self) -> usize {
        self.guilds.lock().await.len()
    }

    pub fn get_alliance(&self, id: AllianceId) -> Option<Alliance> {
        self.alliances.lock().get(&id).cloned()
    }

    /// Insert unless an alliance with that id is already cached.
    pub fn add_alliance(&self, alliance: Alliance) -> bool {
        let mut alliances = self.alliances.lock();
        if alliances.contains_key(&alliance.id) {
            return false;
        }
        alliances.insert(alliance.id, alliance);
        true
    }

    /// Remove the alliance and detach its cached member guilds.
    pub async fn disband_alliance(&self, id: AllianceId) -> bool {
        let removed = self.alliances.lock().remove(&id);
        let Some(alliance) = removed else {
            return false;
        };

        let guilds = self.guilds.lock().await;
        for gid in &alliance.guilds {
            if let Some(guild) = guilds.get(gid) {
                guild.write().alliance_id = NO_ALLIANCE;
            }
        }
        tracing::debug!("[alliance] [disbanded] alliance={} guilds={}", id, alliance.guilds.len());
        true
    }

    pub async fn add_guild_to_alliance(&self, alliance: AllianceId, guild: GuildId) -> bool {
        {
            let mut alliances = self.alliances.lock();
            let Some(entry) = alliances.get_mut(&alliance) else {
                return false;
            };
            if !entry.guilds.contains(&guild) {
                entry.guilds.push(guild);
            }
        }
        self.set_guild_alliance_id(guild, alliance).await;
        true
    }

    pub async fn remove_guild_from_alliance(&self, alliance: AllianceId, guild: GuildId) -> bool {
        {
            let mut alliances = self.alliances.lock();
            let Some(entry) = alliances.get_mut(&alliance) else {
                return false;
            };
            entry.guilds.retain(|g| *g != guild);
        }
        self.set_guild_alliance_id(guild, NO_ALLIANCE).await;
        true
    }

    pub fn set_alliance_notice(&self, alliance: AllianceId, notice: impl Into<String>) -> bool {
        match self.alliances.lock().get_mut(&alliance) {
            Some(entry) => {
                entry.notice = notice.into();
                true
            }
            None => false,
        }
    }

    pub fn set_alliance_ranks(&self, alliance: AllianceId, ranks: Vec<String>) -> bool {
        match self.alliances.lock().get_mut(&alliance) {
            Some(entry) => {
                entry.rank_titles = ranks;
                true
            }
            None => false,
        }
    }

    pub fn increase_alliance_capacity(&self, alliance: AllianceId, inc: u32) -> bool {
        match self.alliances.lock().get_mut(&alliance) {
            Some(entry) => {
                entry.capacity = entry.capacity.saturating_add(inc);
                true
            }
            None => false,
        }
    }
}
