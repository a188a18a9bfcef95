//! Persistence of per-target read cursors.
//!
//! A store is a key-value map from `(website_id, state_key)` to
//! [`TargetState`]. Writes to different keys never interfere; no multi-key
//! transactions are offered.

mod memory;
mod sqlite;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::TargetState;

#[async_trait]
pub trait TargetStateStore: Send + Sync {
    /// Fetch the stored state, `None` when the target was never scanned.
    async fn get(&self, website_id: &str, state_key: &str) -> Result<Option<TargetState>>;

    /// Insert or replace the state for one target.
    async fn set(&self, website_id: &str, state_key: &str, state: &TargetState) -> Result<()>;
}
