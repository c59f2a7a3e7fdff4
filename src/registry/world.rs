use std::collections::{BTreeMap, HashMap};

use crate::config::WorldConfig;

use super::{AccountId, CharacterEntry, CharacterId, WorldId};

/// One hosted world and its per-account character views.
///
/// Views are only touched through `Registry`, under the login index writer
/// lock, so they agree with the account and world indexes.
#[derive(Debug, Clone)]
pub struct World {
    id: WorldId,
    name: String,
    flag: u8,
    event_message: String,
    server_message: String,
    recommended: String,
    channels: u8,
    account_chars: HashMap<AccountId, BTreeMap<CharacterId, CharacterEntry>>,
}

impl World {
    pub fn new(id: WorldId, name: impl Into<String>, channels: u8) -> Self {
        Self {
            id,
            name: name.into(),
            flag: 0,
            event_message: String::new(),
            server_message: String::new(),
            recommended: String::new(),
            channels,
            account_chars: HashMap::new(),
        }
    }

    pub fn from_config(id: WorldId, config: &WorldConfig) -> Self {
        Self {
            flag: config.flag,
            event_message: config.event_message.clone(),
            server_message: config.server_message.clone(),
            recommended: config.recommended.clone(),
            ..Self::new(id, config.name.clone(), config.channels)
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flag(&self) -> u8 {
        self.flag
    }

    pub fn event_message(&self) -> &str {
        &self.event_message
    }

    pub fn server_message(&self) -> &str {
        &self.server_message
    }

    /// Reason shown when the login screen recommends this world. Empty if unset.
    pub fn recommended(&self) -> &str {
        &self.recommended
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// Replace the account's view with `chars`. An empty list still creates a view.
    pub(crate) fn load_account_characters_view(&mut self, account: AccountId, chars: Vec<CharacterEntry>) {
        let view = chars.into_iter().map(|c| (c.id, c)).collect();
        self.account_chars.insert(account, view);
    }

    pub(crate) fn register_account_character_view(&mut self, entry: CharacterEntry) {
        self.account_chars
            .entry(entry.account_id)
            .or_default()
            .insert(entry.id, entry);
    }

    /// Refresh an existing view entry. False if the character has none here.
    pub(crate) fn update_character_view(&mut self, entry: &CharacterEntry) -> bool {
        match self
            .account_chars
            .get_mut(&entry.account_id)
            .and_then(|view| view.get_mut(&entry.id))
        {
            Some(slot) => {
                *slot = entry.clone();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unregister_account_character_view(
        &mut self,
        account: AccountId,
        character: CharacterId,
    ) -> Option<CharacterEntry> {
        self.account_chars.get_mut(&account)?.remove(&character)
    }

    pub(crate) fn clear_account_characters_view(&mut self, account: AccountId) {
        self.account_chars.remove(&account);
    }

    /// Characters of `account` here, ordered by id. `None` if never loaded.
    pub fn account_characters_view(&self, account: AccountId) -> Option<Vec<CharacterEntry>> {
        self.account_chars
            .get(&account)
            .map(|view| view.values().cloned().collect())
    }

    pub fn account_character(&self, account: AccountId, character: CharacterId) -> Option<&CharacterEntry> {
        self.account_chars.get(&account)?.get(&character)
    }

    /// Number of characters with a view in this world.
    pub fn character_count(&self) -> usize {
        self.account_chars.values().map(BTreeMap::len).sum()
    }
}
