use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{BoxFuture, StateStore, validate_key};
use crate::error::StorageResult;

/// Process-local store, used when nothing should outlive the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<Option<String>>> {
        Box::pin(async move {
            validate_key(key, "memory-load")?;
            Ok(self.entries.read().await.get(key).cloned())
        })
    }

    fn save<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            validate_key(key, "memory-save")?;
            self.entries.write().await.insert(key.to_string(), value);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            validate_key(key, "memory-remove")?;
            self.entries.write().await.remove(key);
            Ok(())
        })
    }
}
