//! MySQL persistence for the registry

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

use crate::config::ServerConfig;
use crate::registry::{AccountId, CharacterEntry, CharacterStore, Guild, GuildId, GuildStore, WorldId};

pub mod character_db;
pub mod guild_db;

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Connect with the credentials in `config`.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url())
            .await
            .with_context(|| format!(
                "Cannot connect to MySQL (host={}:{} db={} user={})",
                config.sql_ip, config.sql_port, config.sql_db, config.sql_id
            ))?;
        tracing::info!("[db] [connected] host={}:{} db={}", config.sql_ip, config.sql_port, config.sql_db);
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub async fn reset_login_flags(&self) -> Result<u64> {
        character_db::reset_login_flags(&self.pool).await
    }
}

#[async_trait]
impl CharacterStore for MySqlStore {
    async fn load_account_characters(
        &self,
        account: AccountId,
        world_count: usize,
    ) -> Result<Vec<CharacterEntry>> {
        character_db::load_account_characters(&self.pool, account, world_count).await
    }
}

#[async_trait]
impl GuildStore for MySqlStore {
    async fn load_guild(&self, id: GuildId, world: WorldId) -> Result<Option<Guild>> {
        guild_db::load_guild(&self.pool, id, world).await
    }
}
