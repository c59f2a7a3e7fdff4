use anyhow::{Context, Result};
use sqlx::MySqlPool;

use crate::registry::{AccountId, CharacterEntry, WorldId};

type CharacterRow = (i64, i64, i64, String, i64, i64, i64);

/// Characters of `account` in worlds below `world_count`, ordered by world then id.
pub async fn load_account_characters(
    pool: &MySqlPool,
    account: AccountId,
    world_count: usize,
) -> Result<Vec<CharacterEntry>> {
    let rows: Vec<CharacterRow> = sqlx::query_as(
        "SELECT CAST(`id` AS SIGNED), CAST(`accountid` AS SIGNED), CAST(`world` AS SIGNED), \
         `name`, CAST(`level` AS SIGNED), CAST(`job` AS SIGNED), CAST(`gm` AS SIGNED) \
         FROM `characters` WHERE `accountid` = ? ORDER BY `world`, `id`"
    )
    .bind(account)
    .fetch_all(pool)
    .await
    .with_context(|| format!("loading characters of account {}", account))?;

    let mut chars = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(entry) = entry_from_row(row) else {
            continue;
        };
        // rows are ordered by world
        if usize::from(entry.world) >= world_count {
            break;
        }
        chars.push(entry);
    }
    Ok(chars)
}

fn entry_from_row((id, account, world, name, level, job, gm): CharacterRow) -> Option<CharacterEntry> {
    let world = match WorldId::try_from(world) {
        Ok(w) => w,
        Err(_) => {
            tracing::warn!("[db] [bad_world] character={} world={}", id, world);
            return None;
        }
    };
    Some(CharacterEntry {
        id: i32::try_from(id).ok()?,
        account_id: i32::try_from(account).ok()?,
        world,
        name,
        level: u16::try_from(level).unwrap_or(0),
        job: u16::try_from(job).unwrap_or(0),
        gm_level: u8::try_from(gm).unwrap_or(0),
    })
}

/// Mark every account logged out. Run once at startup.
pub async fn reset_login_flags(pool: &MySqlPool) -> Result<u64> {
    let res = sqlx::query("UPDATE `accounts` SET `loggedin` = 0")
        .execute(pool)
        .await
        .context("resetting account login flags")?;
    Ok(res.rows_affected())
}
