use std::collections::HashMap;

use revi::error::AgentResult;

use super::{StoreBackend, StoredItem};

/// Fallback backend used when the embedded database is unavailable.
///
/// Holds nothing across restarts; the store reports itself degraded while
/// this backend is active.
#[derive(Debug, Default)]
pub(crate) struct MemoryBackend {
    items: HashMap<String, StoredItem>,
    meta: HashMap<String, String>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        MemoryBackend::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn insert(&mut self, item: &StoredItem) -> AgentResult<()> {
        self.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn remove(&mut self, id: &str) -> AgentResult<()> {
        self.items.remove(id);
        Ok(())
    }

    fn update_retry(&mut self, id: &str, retry_count: u32) -> AgentResult<()> {
        if let Some(item) = self.items.get_mut(id) {
            item.retry_count = retry_count;
        }
        Ok(())
    }

    fn load_all(&mut self) -> AgentResult<Vec<StoredItem>> {
        Ok(self.items.values().cloned().collect())
    }

    fn get_meta(&mut self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.meta.get(key).cloned())
    }

    fn set_meta(&mut self, key: &str, value: &str) -> AgentResult<()> {
        self.meta.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
