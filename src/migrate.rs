use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per (website, source:key) read cursor
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS target_states (
            website_id TEXT NOT NULL,
            state_key TEXT NOT NULL,
            last_offset INTEGER NOT NULL DEFAULT 0,
            last_size INTEGER NOT NULL DEFAULT 0,
            last_etag TEXT NOT NULL DEFAULT '',
            last_mod_time INTEGER NOT NULL DEFAULT 0,
            parsed_min_ts INTEGER NOT NULL DEFAULT 0,
            parsed_max_ts INTEGER NOT NULL DEFAULT 0,
            first_timestamp INTEGER NOT NULL DEFAULT 0,
            last_timestamp INTEGER NOT NULL DEFAULT 0,
            recent_cutoff_ts INTEGER NOT NULL DEFAULT 0,
            backfill_done INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (website_id, state_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_target_states_updated ON target_states(updated_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
