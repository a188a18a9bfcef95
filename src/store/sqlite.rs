use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::TargetStateStore;
use crate::models::TargetState;

/// [`TargetStateStore`] over the `target_states` table.
///
/// Each call is a single-row SELECT or UPSERT. Offsets and sizes are stored
/// as SQLite INTEGERs (i64); objects beyond 8 EiB are not supported.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetStateStore for SqliteStateStore {
    async fn get(&self, website_id: &str, state_key: &str) -> Result<Option<TargetState>> {
        let row = sqlx::query(
            r#"
            SELECT last_offset, last_size, last_etag, last_mod_time,
                   parsed_min_ts, parsed_max_ts, first_timestamp, last_timestamp,
                   recent_cutoff_ts, backfill_done
            FROM target_states
            WHERE website_id = ? AND state_key = ?
            "#,
        )
        .bind(website_id)
        .bind(state_key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load state for {}/{}", website_id, state_key))?;

        Ok(row.map(|row| {
            let last_offset: i64 = row.get("last_offset");
            let last_size: i64 = row.get("last_size");
            let backfill_done: i64 = row.get("backfill_done");
            TargetState {
                last_offset: last_offset.max(0) as u64,
                last_size: last_size.max(0) as u64,
                last_etag: row.get("last_etag"),
                last_mod_time: row.get("last_mod_time"),
                parsed_min_ts: row.get("parsed_min_ts"),
                parsed_max_ts: row.get("parsed_max_ts"),
                first_timestamp: row.get("first_timestamp"),
                last_timestamp: row.get("last_timestamp"),
                recent_cutoff_ts: row.get("recent_cutoff_ts"),
                backfill_done: backfill_done != 0,
            }
        }))
    }

    async fn set(&self, website_id: &str, state_key: &str, state: &TargetState) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO target_states (
                website_id, state_key, last_offset, last_size, last_etag, last_mod_time,
                parsed_min_ts, parsed_max_ts, first_timestamp, last_timestamp,
                recent_cutoff_ts, backfill_done, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(website_id, state_key) DO UPDATE SET
                last_offset = excluded.last_offset,
                last_size = excluded.last_size,
                last_etag = excluded.last_etag,
                last_mod_time = excluded.last_mod_time,
                parsed_min_ts = excluded.parsed_min_ts,
                parsed_max_ts = excluded.parsed_max_ts,
                first_timestamp = excluded.first_timestamp,
                last_timestamp = excluded.last_timestamp,
                recent_cutoff_ts = excluded.recent_cutoff_ts,
                backfill_done = excluded.backfill_done,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(website_id)
        .bind(state_key)
        .bind(state.last_offset as i64)
        .bind(state.last_size as i64)
        .bind(&state.last_etag)
        .bind(state.last_mod_time)
        .bind(state.parsed_min_ts)
        .bind(state.parsed_max_ts)
        .bind(state.first_timestamp)
        .bind(state.last_timestamp)
        .bind(state.recent_cutoff_ts)
        .bind(state.backfill_done as i64)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save state for {}/{}", website_id, state_key))?;

        Ok(())
    }
}
