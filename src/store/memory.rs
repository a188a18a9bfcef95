use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::TargetStateStore;
use crate::models::TargetState;

/// In-process store for tests and dry runs. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<(String, String), TargetState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

#[async_trait]
impl TargetStateStore for MemoryStateStore {
    async fn get(&self, website_id: &str, state_key: &str) -> Result<Option<TargetState>> {
        let key = (website_id.to_string(), state_key.to_string());
        Ok(self.states.read().get(&key).cloned())
    }

    async fn set(&self, website_id: &str, state_key: &str, state: &TargetState) -> Result<()> {
        self.states.write().insert(
            (website_id.to_string(), state_key.to_string()),
            state.clone(),
        );
        Ok(())
    }
}
