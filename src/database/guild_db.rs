use anyhow::{Context, Result};
use sqlx::{MySqlPool, Row};

use crate::registry::{Guild, GuildId, GuildMember, WorldId};

/// Guild row plus its members. `None` when the guild does not exist.
pub async fn load_guild(pool: &MySqlPool, id: GuildId, world: WorldId) -> Result<Option<Guild>> {
    let row = sqlx::query(
        "SELECT `name`, CAST(`leader` AS SIGNED), CAST(`allianceId` AS SIGNED), \
         CAST(`capacity` AS SIGNED), `notice` FROM `guilds` WHERE `guildid` = ?"
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("loading guild {}", id))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut guild = Guild::new(
        id,
        world,
        row.try_get::<String, _>(0)?,
        i32::try_from(row.try_get::<i64, _>(1)?).unwrap_or(0),
    );
    guild.alliance_id = i32::try_from(row.try_get::<i64, _>(2).unwrap_or(0)).unwrap_or(0);
    guild.capacity = u32::try_from(row.try_get::<i64, _>(3).unwrap_or(10)).unwrap_or(10);
    guild.notice = row.try_get::<Option<String>, _>(4).unwrap_or(None).unwrap_or_default();

    let members: Vec<(i64, String, i64)> = sqlx::query_as(
        "SELECT CAST(`id` AS SIGNED), `name`, CAST(`guildrank` AS SIGNED) FROM `characters` \
         WHERE `guildid` = ? ORDER BY `guildrank` ASC, `name` ASC"
    )
    .bind(id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("loading members of guild {}", id))?;

    guild.members = members
        .into_iter()
        .filter_map(|(cid, name, rank)| {
            let cid = i32::try_from(cid).ok()?;
            Some(GuildMember::new(cid, name, u8::try_from(rank).unwrap_or(5)))
        })
        .collect();

    Ok(Some(guild))
}
